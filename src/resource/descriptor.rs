use std::fmt;

use super::ResourceKind;
use crate::error::ResourceError;

/// Identity of one resource for locks and fast-tier records: `{group}:{blob_path}`.
///
/// Ordered byte-wise; two-key operations lock the larger key first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey(String);

impl ResourceKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A resource (or folder) address.
///
/// `path` is relative to the bucket; it is empty for the bucket root and
/// ends with `/` for any folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceDescriptor {
    kind: ResourceKind,
    bucket: String,
    path: String,
}

impl ResourceDescriptor {
    pub fn new(kind: ResourceKind, bucket: &str, path: &str) -> Result<Self, ResourceError> {
        validate_segment(bucket, bucket)?;
        validate_path(path)?;
        Ok(Self { kind, bucket: bucket.to_string(), path: path.to_string() })
    }

    /// Parse `{group}/{bucket}/{path}`.
    pub fn from_url(url: &str) -> Result<Self, ResourceError> {
        let mut parts = url.splitn(3, '/');
        let group = parts.next().unwrap_or_default();
        let kind = ResourceKind::from_group(group)
            .ok_or_else(|| ResourceError::InvalidArgument(format!("unknown resource group in '{}'", url)))?;
        let bucket = parts
            .next()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ResourceError::InvalidArgument(format!("missing bucket in '{}'", url)))?;
        let path = parts
            .next()
            .ok_or_else(|| ResourceError::InvalidArgument(format!("missing path in '{}'", url)))?;
        Self::new(kind, bucket, path)
    }

    /// Parse a durable path `{bucket}/{group}/{path}`.
    pub fn from_blob_path(blob_path: &str) -> Result<Self, ResourceError> {
        let mut parts = blob_path.splitn(3, '/');
        let bucket = parts.next().unwrap_or_default();
        let group = parts.next().unwrap_or_default();
        let path = parts.next().unwrap_or_default();
        let kind = ResourceKind::from_group(group)
            .ok_or_else(|| ResourceError::InvalidArgument(format!("unknown resource group in '{}'", blob_path)))?;
        Self::new(kind, bucket, path)
    }

    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path segment (with its trailing `/` for folders); empty for the root.
    #[must_use]
    pub fn name(&self) -> &str {
        let trimmed = self.path.strip_suffix('/').unwrap_or(&self.path);
        let start = trimmed.rfind('/').map(|i| i + 1).unwrap_or(0);
        &self.path[start..]
    }

    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.path.is_empty() || self.path.ends_with('/')
    }

    #[must_use]
    pub fn is_root_folder(&self) -> bool {
        self.path.is_empty()
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("{}/{}/{}", self.kind.group(), self.bucket, self.path)
    }

    /// Durable-tier object path.
    #[must_use]
    pub fn blob_path(&self) -> String {
        format!("{}/{}/{}", self.bucket, self.kind.group(), self.path)
    }

    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey(format!("{}:{}", self.kind.group(), self.blob_path()))
    }

    /// Enclosing folder; `None` for the bucket root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root_folder() {
            return None;
        }
        let trimmed = self.path.strip_suffix('/').unwrap_or(&self.path);
        let parent_path = match trimmed.rfind('/') {
            Some(i) => &trimmed[..=i],
            None => "",
        };
        Some(Self { kind: self.kind, bucket: self.bucket.clone(), path: parent_path.to_string() })
    }

    /// Resource named `name` inside this folder. A trailing `/` makes a subfolder.
    pub fn child(&self, name: &str) -> Result<Self, ResourceError> {
        if !self.is_folder() {
            return Err(ResourceError::InvalidArgument(format!("'{}' is not a folder", self.url())));
        }
        let segment = name.strip_suffix('/').unwrap_or(name);
        if segment.contains('/') {
            return Err(ResourceError::InvalidArgument(format!("child name '{}' contains '/'", name)));
        }
        validate_segment(segment, name)?;
        Ok(Self { kind: self.kind, bucket: self.bucket.clone(), path: format!("{}{}", self.path, name) })
    }

    /// Same kind and bucket, different relative path.
    pub fn with_path(&self, path: &str) -> Result<Self, ResourceError> {
        Self::new(self.kind, &self.bucket, path)
    }

    pub(crate) fn require_item(&self) -> Result<(), ResourceError> {
        if self.is_folder() {
            Err(ResourceError::InvalidArgument(format!("'{}' is a folder, expected a resource", self.url())))
        } else {
            Ok(())
        }
    }

    pub(crate) fn require_folder(&self) -> Result<(), ResourceError> {
        if self.is_folder() {
            Ok(())
        } else {
            Err(ResourceError::InvalidArgument(format!("'{}' is not a folder", self.url())))
        }
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind.group(), self.bucket, self.path)
    }
}

fn validate_path(path: &str) -> Result<(), ResourceError> {
    if path.is_empty() {
        return Ok(());
    }
    let body = path.strip_suffix('/').unwrap_or(path);
    for segment in body.split('/') {
        validate_segment(segment, path)?;
    }
    Ok(())
}

fn validate_segment(segment: &str, context: &str) -> Result<(), ResourceError> {
    if segment.is_empty() || segment == "." || segment == ".." {
        return Err(ResourceError::InvalidArgument(format!("invalid path segment in '{}'", context)));
    }
    if segment.chars().any(char::is_control) {
        return Err(ResourceError::InvalidArgument(format!("control character in '{}'", context.escape_debug())));
    }
    Ok(())
}
