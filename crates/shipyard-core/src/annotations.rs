//! Annotation lines emitted by policy checks, and the parser that groups
//! them by resource for reviewers.
//!
//! A line looks like `[Error at /Dev/network] NET-OPEN-INGRESS: message`.
//! Lines that do not match are ignored.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationLevel {
    Error,
    Warning,
}

impl fmt::Display for AnnotationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnotationLevel::Error => f.write_str("Error"),
            AnnotationLevel::Warning => f.write_str("Warning"),
        }
    }
}

/// Render one annotation line.
pub fn annotation_line(
    level: AnnotationLevel,
    location: impl fmt::Display,
    message: impl fmt::Display,
) -> String {
    format!("[{level} at {location}] {message}")
}

/// All messages reported against one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub location: String,
    pub messages: Vec<String>,
}

fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\[(Error|Warning) at (.*)\] (.*)$").unwrap_or_else(|e| {
            unreachable!("annotation pattern is a constant: {e}")
        })
    })
}

/// Group annotation lines by location, in order of first appearance.
/// Messages keep their input order within a location.
pub fn parse_annotations(log: &str) -> Vec<Annotation> {
    let pattern = line_pattern();
    let mut grouped: Vec<Annotation> = Vec::new();
    for line in log.lines() {
        let Some(captures) = pattern.captures(line.trim_end_matches('\r')) else {
            continue;
        };
        let location = &captures[2];
        let message = captures[3].to_string();
        match grouped.iter_mut().find(|a| a.location == location) {
            Some(annotation) => annotation.messages.push(message),
            None => grouped.push(Annotation {
                location: location.to_string(),
                messages: vec![message],
            }),
        }
    }
    grouped
}
