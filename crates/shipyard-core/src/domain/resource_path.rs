//! Hierarchical resource addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{Result, ShipyardError};

/// Fully-qualified address of a declared resource, e.g.
/// `/Dev/app1-service/load-balancer`.
///
/// Equality and ordering are defined over the whole segment sequence; there
/// is no prefix or substring matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(|s| s.is_empty() || s.contains('/')) {
            return Err(ShipyardError::InvalidResourcePath {
                path: segments.join("/"),
            });
        }
        Ok(Self { segments })
    }

    /// Path extended by one segment.
    pub fn child(&self, segment: &str) -> Result<Self> {
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Self::from_segments(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for ResourcePath {
    type Err = ShipyardError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.strip_prefix('/').unwrap_or(s);
        if trimmed.is_empty() {
            return Err(ShipyardError::InvalidResourcePath {
                path: s.to_string(),
            });
        }
        Self::from_segments(trimmed.split('/')).map_err(|_| ShipyardError::InvalidResourcePath {
            path: s.to_string(),
        })
    }
}

impl TryFrom<String> for ResourcePath {
    type Error = ShipyardError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ResourcePath> for String {
    fn from(path: ResourcePath) -> Self {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_and_without_leading_slash() {
        let a: ResourcePath = "/Dev/app1-service/load-balancer".parse().unwrap();
        let b: ResourcePath = "Dev/app1-service/load-balancer".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.segments().len(), 3);
        assert_eq!(a.to_string(), "/Dev/app1-service/load-balancer");
    }

    #[test]
    fn rejects_empty_segments() {
        assert!("/".parse::<ResourcePath>().is_err());
        assert!("/Dev//service".parse::<ResourcePath>().is_err());
        assert!("/Dev/service/".parse::<ResourcePath>().is_err());
        assert!(ResourcePath::from_segments(Vec::<String>::new()).is_err());
    }

    #[test]
    fn equality_is_over_the_full_path() {
        let parent: ResourcePath = "/Dev/app1-service".parse().unwrap();
        let child = parent.child("load-balancer").unwrap();
        assert_ne!(parent, child);
        assert_eq!(child, "/Dev/app1-service/load-balancer".parse().unwrap());
    }

    #[test]
    fn serializes_as_string() {
        let path: ResourcePath = "/Pipeline/artifacts-bucket".parse().unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"/Pipeline/artifacts-bucket\"");
        let back: ResourcePath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }
}
