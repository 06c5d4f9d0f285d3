//! Pipeline identity.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shipyard_state::ContentDigest;

use crate::error::Result;
use crate::pipeline::Pipeline;

/// The shape of a pipeline: its name and the ordered member ids of every
/// wave. Two pipelines with the same shape share a digest, so runs of the
/// same definition can be grouped in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineSpec {
    pub pipeline: String,
    pub waves: Vec<(String, Vec<String>)>,
}

impl PipelineSpec {
    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        Self {
            pipeline: pipeline.name().to_string(),
            waves: pipeline
                .waves()
                .iter()
                .map(|wave| {
                    let ids = wave.member_ids().into_iter().map(str::to_string).collect();
                    (wave.name().to_string(), ids)
                })
                .collect(),
        }
    }

    /// SHA-256 over the ordered names, each terminated by a NUL byte. Waves
    /// are further separated by a second NUL so that moving a member across
    /// a wave boundary changes the digest.
    pub fn digest(&self) -> Result<ContentDigest> {
        let mut hasher = Sha256::new();
        hasher.update(self.pipeline.as_bytes());
        hasher.update(b"\0");
        for (wave, members) in &self.waves {
            hasher.update(wave.as_bytes());
            hasher.update(b"\0");
            for member in members {
                hasher.update(member.as_bytes());
                hasher.update(b"\0");
            }
            hasher.update(b"\0");
        }
        Ok(ContentDigest::try_from(hex::encode(hasher.finalize()))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(waves: &[(&str, &[&str])]) -> PipelineSpec {
        PipelineSpec {
            pipeline: "delivery".to_string(),
            waves: waves
                .iter()
                .map(|(w, m)| (w.to_string(), m.iter().map(|s| s.to_string()).collect()))
                .collect(),
        }
    }

    #[test]
    fn digest_is_deterministic() {
        let a = spec(&[("BuildWave", &["app1-build"]), ("TestWave", &["app1-test"])]);
        let b = a.clone();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(a.digest().unwrap().as_str().len(), 64);
    }

    #[test]
    fn digest_tracks_wave_boundaries() {
        let together = spec(&[("W", &["a", "b"])]);
        let split = spec(&[("W", &["a"]), ("b", &[])]);
        assert_ne!(together.digest().unwrap(), split.digest().unwrap());

        let reordered = spec(&[("W", &["b", "a"])]);
        assert_ne!(together.digest().unwrap(), reordered.digest().unwrap());
    }
}
