//! The delivery pipelines built from configuration.
//!
//! ```text
//! RegistryWave -> BuildWave -> DevWave -> TestWave -> StagingWave -> ProductionWave
//! ```
//!
//! Environments that deploy unverified images (`requires_verification =
//! false`) run between the build and the test wave; every other environment
//! runs after the test wave, in configuration order. An environment that
//! requires approval gets an `approve-{environment}` step in the wave just
//! before its own, so the decision is taken while the previous environment
//! is being deployed.

use std::sync::Arc;

use shipyard_core::{EnvironmentConfig, ShipyardConfig};

use crate::error::Result;
use crate::pipeline::{Pipeline, Wave, WaveMember};
use crate::stage::Stage;
use crate::steps::{
    ApprovalStep, BuildStep, CodeScanStep, FunctionalTestStep, PolicyCheckStep, RegistryScanStep,
};

pub const REGISTRY_WAVE: &str = "RegistryWave";
pub const BUILD_WAVE: &str = "BuildWave";
pub const TEST_WAVE: &str = "TestWave";

fn registry_wave(config: &ShipyardConfig) -> Wave {
    Wave::new(REGISTRY_WAVE).with_stage(Stage::registry(config.descriptors()))
}

fn build_wave(config: &ShipyardConfig) -> Wave {
    config.services.iter().fold(Wave::new(BUILD_WAVE), |wave, service| {
        wave.with_step(BuildStep::new(
            service.descriptor(),
            service.commands.build_argv(),
        ))
    })
}

fn test_wave(config: &ShipyardConfig) -> Wave {
    let mut wave = Wave::new(TEST_WAVE).with_step(PolicyCheckStep::new());
    for service in &config.services {
        let descriptor = service.descriptor();
        wave = wave
            .with_step(CodeScanStep::new(
                descriptor.clone(),
                service.commands.code_scan_argv(),
            ))
            .with_step(RegistryScanStep::new(descriptor.clone()))
            .with_step(FunctionalTestStep::new(
                descriptor,
                service.commands.test_argv(),
            ));
    }
    wave
}

fn environment_wave(config: &ShipyardConfig, environment: &EnvironmentConfig) -> Wave {
    Wave::new(environment.wave_name()).with_stage(Stage::environment(
        environment,
        config.descriptors(),
        &config.safety_net,
    ))
}

fn push_environment(
    waves: &mut Vec<Wave>,
    config: &ShipyardConfig,
    environment: &EnvironmentConfig,
) {
    if environment.requires_approval {
        if let Some(previous) = waves.last_mut() {
            let approval = ApprovalStep::new(&environment.name);
            previous.push(WaveMember::Step(Arc::new(approval)));
        }
    }
    waves.push(environment_wave(config, environment));
}

/// Registry, build, every environment and the verification wave.
pub fn standard_pipeline(config: &ShipyardConfig) -> Result<Pipeline> {
    let mut waves = vec![registry_wave(config), build_wave(config)];
    let (unverified, verified): (Vec<_>, Vec<_>) = config
        .environments
        .iter()
        .partition(|env| !env.requires_verification);

    for environment in unverified {
        push_environment(&mut waves, config, environment);
    }
    waves.push(test_wave(config));
    for environment in verified {
        push_environment(&mut waves, config, environment);
    }
    Pipeline::new(config.pipeline.name.clone(), waves)
}

/// Registry, build and verification only: what `shipyard test` runs.
pub fn verification_pipeline(config: &ShipyardConfig) -> Result<Pipeline> {
    Pipeline::new(
        format!("{}-verification", config.pipeline.name),
        vec![registry_wave(config), build_wave(config), test_wave(config)],
    )
}
