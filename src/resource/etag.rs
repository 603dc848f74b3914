use sha2::{Digest, Sha256};

use crate::error::ResourceError;

/// Content etag: lowercase hex SHA-256 of the body.
#[must_use]
pub fn etag(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Either `*` or an explicit list of etags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EtagSet {
    Any,
    Tags(Vec<String>),
}

impl EtagSet {
    #[must_use]
    pub fn one(tag: impl Into<String>) -> Self {
        EtagSet::Tags(vec![tag.into()])
    }

    fn matches(&self, current: &str) -> bool {
        match self {
            EtagSet::Any => true,
            EtagSet::Tags(tags) => tags.iter().any(|t| t == current),
        }
    }

    /// Parse an HTTP entity-tag list: `*` or `"a", W/"b", c`.
    fn parse(header: &str) -> Result<Self, ResourceError> {
        let header = header.trim();
        if header == "*" {
            return Ok(EtagSet::Any);
        }
        let mut tags = Vec::new();
        for raw in header.split(',') {
            let raw = raw.trim();
            let raw = raw.strip_prefix("W/").unwrap_or(raw);
            let tag = raw
                .strip_prefix('"')
                .and_then(|t| t.strip_suffix('"'))
                .unwrap_or(raw);
            if tag.is_empty() || tag == "*" || tag.contains('"') {
                return Err(ResourceError::InvalidArgument(format!("malformed etag list: {}", header)));
            }
            tags.push(tag.to_string());
        }
        Ok(EtagSet::Tags(tags))
    }
}

/// Optimistic-concurrency condition checked against the current etag
/// before any mutation.
///
/// Conditions only apply to resources that exist: a missing resource
/// passes every precondition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EtagPrecondition {
    #[default]
    Any,
    IfMatch(EtagSet),
    IfNoneMatch(EtagSet),
}

impl EtagPrecondition {
    #[must_use]
    pub fn if_match(tag: impl Into<String>) -> Self {
        EtagPrecondition::IfMatch(EtagSet::one(tag))
    }

    /// Only succeeds when the resource does not exist yet.
    #[must_use]
    pub fn create_only() -> Self {
        EtagPrecondition::IfNoneMatch(EtagSet::Any)
    }

    /// Build from optional `If-Match` / `If-None-Match` header values.
    pub fn from_headers(if_match: Option<&str>, if_none_match: Option<&str>) -> Result<Self, ResourceError> {
        match (if_match, if_none_match) {
            (Some(_), Some(_)) => Err(ResourceError::InvalidArgument(
                "If-Match and If-None-Match are mutually exclusive".to_string(),
            )),
            (Some(h), None) => parse_if_match(h),
            (None, Some(h)) => parse_if_none_match(h),
            (None, None) => Ok(EtagPrecondition::Any),
        }
    }

    /// Check the condition against the etag of an existing resource.
    pub fn validate(&self, url: &str, current: &str) -> Result<(), ResourceError> {
        let ok = match self {
            EtagPrecondition::Any => true,
            EtagPrecondition::IfMatch(set) => set.matches(current),
            EtagPrecondition::IfNoneMatch(set) => !set.matches(current),
        };
        if ok {
            Ok(())
        } else {
            Err(ResourceError::Conflict { url: url.to_string(), etag: current.to_string() })
        }
    }
}

pub fn parse_if_match(header: &str) -> Result<EtagPrecondition, ResourceError> {
    EtagSet::parse(header).map(EtagPrecondition::IfMatch)
}

pub fn parse_if_none_match(header: &str) -> Result<EtagPrecondition, ResourceError> {
    EtagSet::parse(header).map(EtagPrecondition::IfNoneMatch)
}
