//! Pipeline structure: an ordered list of waves, each a set of stages and
//! steps dispatched together.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::stage::{Stage, StageOutcome};
use crate::step::{ExecutionContext, FailureKind, Step, StepOutcome};

/// A member of a wave.
#[derive(Clone)]
pub enum WaveMember {
    Stage(Arc<Stage>),
    Step(Arc<dyn Step>),
}

impl WaveMember {
    pub fn id(&self) -> &str {
        match self {
            WaveMember::Stage(stage) => stage.name(),
            WaveMember::Step(step) => step.id().as_str(),
        }
    }

    /// `stage`, or the step kind.
    pub fn kind(&self) -> &'static str {
        match self {
            WaveMember::Stage(_) => "stage",
            WaveMember::Step(step) => step.kind().as_str(),
        }
    }

    /// Run to a terminal outcome. Errors become infrastructure failures so
    /// the wave always completes.
    pub async fn run(&self, ctx: &ExecutionContext) -> StageOutcome {
        let result = match self {
            WaveMember::Stage(stage) => stage.execute(ctx).await,
            WaveMember::Step(step) => step.execute(ctx).await.map(StageOutcome::from),
        };
        result.unwrap_or_else(|err| {
            StepOutcome::failed(FailureKind::Infrastructure, err.to_string()).into()
        })
    }
}

pub struct Wave {
    name: String,
    members: Vec<WaveMember>,
}

impl Wave {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.members.push(WaveMember::Stage(Arc::new(stage)));
        self
    }

    pub fn with_step(mut self, step: impl Step + 'static) -> Self {
        self.members.push(WaveMember::Step(Arc::new(step)));
        self
    }

    pub fn push(&mut self, member: WaveMember) {
        self.members.push(member);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[WaveMember] {
        &self.members
    }

    pub fn member_ids(&self) -> Vec<&str> {
        self.members.iter().map(WaveMember::id).collect()
    }
}

/// Ordered waves. The graph is fixed at construction.
pub struct Pipeline {
    name: String,
    waves: Vec<Wave>,
}

impl Pipeline {
    /// Wave names must be unique, member ids unique across the whole
    /// pipeline, and no wave may be empty.
    pub fn new(name: impl Into<String>, waves: Vec<Wave>) -> Result<Self> {
        let name = name.into();
        if waves.is_empty() {
            return Err(PipelineError::InvalidPipeline(format!(
                "pipeline {name} has no waves"
            )));
        }
        let mut wave_names = HashSet::new();
        let mut member_ids = HashSet::new();
        for wave in &waves {
            if !wave_names.insert(wave.name()) {
                return Err(PipelineError::Duplicate {
                    kind: "wave",
                    name: wave.name().to_string(),
                });
            }
            if wave.members.is_empty() {
                return Err(PipelineError::EmptyWave(wave.name().to_string()));
            }
            for id in wave.member_ids() {
                if !member_ids.insert(id) {
                    return Err(PipelineError::Duplicate {
                        kind: "member",
                        name: id.to_string(),
                    });
                }
            }
        }
        Ok(Self { name, waves })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn waves(&self) -> &[Wave] {
        &self.waves
    }

    pub fn wave(&self, name: &str) -> Option<&Wave> {
        self.waves.iter().find(|w| w.name == name)
    }
}
