//! Image registry driven by external commands (`docker push`, a scanner).
//!
//! Commands see `REGISTRY_HOST`, `REPOSITORY_NAME`, `REPOSITORY_URI`,
//! `IMAGE_TAG`, `LOCAL_IMAGE` (push only) and `IMAGE` (the full remote
//! reference). The scan command prints a JSON array of findings:
//! `[{"rule_id": "CVE-...", "severity": "HIGH", "description": "..."}]`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shipyard_state::{Finding, ImageReference, ImageRegistry, StorageError, StorageResult};
use tracing::{debug, warn};

use crate::command::{CommandRunner, CommandSpec};

fn default_host() -> String {
    "localhost:5000".to_string()
}

fn default_push() -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        r#"docker tag "$LOCAL_IMAGE" "$IMAGE" && docker push "$IMAGE""#.to_string(),
    ]
}

fn default_timeout_secs() -> u64 {
    900
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default = "default_host")]
    pub host: String,
    /// Run once per repository by the registry stage.
    #[serde(default)]
    pub create: Option<Vec<String>>,
    #[serde(default = "default_push")]
    pub push: Vec<String>,
    /// Without a scan command every image scans clean.
    #[serde(default)]
    pub scan: Option<Vec<String>>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            create: None,
            push: default_push(),
            scan: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

pub struct CommandImageRegistry {
    settings: RegistrySettings,
}

impl CommandImageRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self { settings }
    }

    fn uri(&self, repository: &str) -> String {
        format!("{}/{}", self.settings.host.trim_end_matches('/'), repository)
    }

    fn spec(&self, name: &str, argv: &[String], repository: &str) -> CommandSpec {
        CommandSpec::new(format!("registry-{name}-{repository}"), argv.to_vec())
            .env("REGISTRY_HOST", &self.settings.host)
            .env("REPOSITORY_NAME", repository)
            .env("REPOSITORY_URI", self.uri(repository))
            .timeout_secs(self.settings.timeout_secs)
    }

    async fn run(&self, spec: CommandSpec) -> StorageResult<String> {
        let output = CommandRunner::execute(&spec)
            .await
            .map_err(|e| StorageError::Registry(e.to_string()))?;
        if !output.passed() {
            return Err(StorageError::Registry(format!(
                "{} exited with {}: {}",
                spec.name,
                output.exit_code,
                output.stderr_tail()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ImageRegistry for CommandImageRegistry {
    async fn create_repository(&self, name: &str) -> StorageResult<String> {
        if let Some(argv) = &self.settings.create {
            self.run(self.spec("create", argv, name)).await?;
        }
        Ok(self.uri(name))
    }

    async fn push(
        &self,
        repository: &str,
        local_image: &str,
        tag: &str,
    ) -> StorageResult<ImageReference> {
        let image = format!("{}:{tag}", self.uri(repository));
        let spec = self
            .spec("push", &self.settings.push, repository)
            .env("LOCAL_IMAGE", local_image)
            .env("IMAGE_TAG", tag)
            .env("IMAGE", &image);
        self.run(spec).await?;
        debug!(image = %image, "image pushed");
        Ok(ImageReference::new(repository, tag))
    }

    async fn scan(&self, reference: &ImageReference) -> StorageResult<Vec<Finding>> {
        let Some(argv) = &self.settings.scan else {
            warn!(image = %reference, "no registry scan command configured");
            return Ok(Vec::new());
        };
        let image = format!("{}:{}", self.uri(&reference.repository), reference.tag);
        let spec = self
            .spec("scan", argv, &reference.repository)
            .env("IMAGE_TAG", &reference.tag)
            .env("IMAGE", image);
        let stdout = self.run(spec).await?;
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(stdout.trim())?)
    }
}
