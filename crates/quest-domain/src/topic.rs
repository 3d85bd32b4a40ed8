//! Event topic names.
//!
//! Topics follow `<domain>.<event>.v<version>`, e.g. `profile.updated.v1`.
//! The version suffix tracks payload shape: a breaking payload change gets a
//! new version instead of mutating an existing topic.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic `{0}` must look like <domain>.<event>.v<version>")]
    Malformed(String),
    #[error("topic `{topic}` has an invalid segment `{segment}`")]
    InvalidSegment { topic: String, segment: String },
    #[error("topic `{0}` has an invalid version suffix")]
    InvalidVersion(String),
}

/// A validated topic name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.len() < 3 {
            return Err(TopicError::Malformed(raw.to_owned()));
        }

        let (version, names) = segments
            .split_last()
            .ok_or_else(|| TopicError::Malformed(raw.to_owned()))?;
        for segment in names {
            if !is_valid_segment(segment) {
                return Err(TopicError::InvalidSegment {
                    topic: raw.to_owned(),
                    segment: (*segment).to_owned(),
                });
            }
        }
        parse_version(version).ok_or_else(|| TopicError::InvalidVersion(raw.to_owned()))?;

        Ok(Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Owning domain, e.g. `profile`.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }

    /// Event name between the domain and the version, e.g. `updated`.
    pub fn event(&self) -> &str {
        let start = self.domain().len() + 1;
        let end = self.0.rfind('.').unwrap_or(self.0.len());
        self.0.get(start..end).unwrap_or_default()
    }

    pub fn version(&self) -> u32 {
        self.0
            .rsplit('.')
            .next()
            .and_then(parse_version)
            .unwrap_or_default()
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

fn parse_version(segment: &str) -> Option<u32> {
    let digits = segment.strip_prefix('v')?;
    if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    digits.parse().ok()
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
