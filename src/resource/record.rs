//! The per-resource record kept in the fast tier, and its field codec.
//!
//! Each record is one hash. Numbers are decimal strings, booleans are
//! `true`/`false`, and `exists` tells a present resource from a tombstone.
//! A hash with no `exists` field (including a missing key) is [`ResourceRecord::Absent`].

use super::{ResourceDescriptor, ResourceKind};
use crate::storage::traits::{FieldMap, StorageError};

/// Field names of a fast-tier record.
pub mod fields {
    pub const BODY: &str = "body";
    pub const ETAG: &str = "etag";
    pub const CREATED_AT: &str = "created_at";
    pub const UPDATED_AT: &str = "updated_at";
    pub const CONTENT_TYPE: &str = "content_type";
    pub const CONTENT_LENGTH: &str = "content_length";
    pub const RESOURCE_TYPE: &str = "resource_type";
    pub const SYNCED: &str = "synced";
    pub const EXISTS: &str = "exists";

    /// Everything but the body.
    pub const METADATA: &[&str] = &[
        ETAG, CREATED_AT, UPDATED_AT, CONTENT_TYPE, CONTENT_LENGTH, RESOURCE_TYPE, SYNCED, EXISTS,
    ];

    pub const ALL: &[&str] = &[
        BODY, ETAG, CREATED_AT, UPDATED_AT, CONTENT_TYPE, CONTENT_LENGTH, RESOURCE_TYPE, SYNCED, EXISTS,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentRecord {
    /// `None` when read without body fields
    pub body: Option<Vec<u8>>,
    pub etag: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub content_type: String,
    /// Length of the full (uncompressed) body
    pub content_length: u64,
    pub kind: ResourceKind,
    pub synced: bool,
}

impl PresentRecord {
    /// Oversized resources keep only their metadata in the fast tier.
    #[must_use]
    pub fn is_stub(&self, max_size: usize) -> bool {
        self.content_length > max_size as u64 && self.body.as_ref().map_or(true, Vec::is_empty)
    }

    #[must_use]
    pub fn metadata(&self, descriptor: &ResourceDescriptor) -> ResourceMetadata {
        ResourceMetadata {
            descriptor: descriptor.clone(),
            etag: self.etag.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            content_type: self.content_type.clone(),
            content_length: self.content_length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRecord {
    /// Nothing cached; ask the durable tier
    Absent,
    Present(PresentRecord),
    /// Deleted; `synced` once the durable tier has dropped the object too
    Tombstone { synced: bool },
}

impl ResourceRecord {
    /// Fields that mark a stored record synced, merged over the rest.
    #[must_use]
    pub fn synced_fields() -> Vec<(String, Vec<u8>)> {
        vec![field(fields::SYNCED, bool_str(true))]
    }

    /// `Present` or `Tombstone`: the fast tier knows the answer.
    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(self, ResourceRecord::Absent)
    }

    #[must_use]
    pub fn is_synced(&self) -> bool {
        match self {
            ResourceRecord::Absent => true,
            ResourceRecord::Present(p) => p.synced,
            ResourceRecord::Tombstone { synced } => *synced,
        }
    }

    #[must_use]
    pub fn present(&self) -> Option<&PresentRecord> {
        match self {
            ResourceRecord::Present(p) => Some(p),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_present(self) -> Option<PresentRecord> {
        match self {
            ResourceRecord::Present(p) => Some(p),
            _ => None,
        }
    }

    /// Fast-tier fields for this record. `Absent` has none.
    #[must_use]
    pub fn encode(&self) -> Vec<(String, Vec<u8>)> {
        match self {
            ResourceRecord::Absent => Vec::new(),
            ResourceRecord::Tombstone { synced } => vec![
                field(fields::EXISTS, bool_str(false)),
                field(fields::SYNCED, bool_str(*synced)),
            ],
            ResourceRecord::Present(p) => {
                let mut out = Vec::with_capacity(fields::ALL.len());
                if let Some(body) = &p.body {
                    out.push((fields::BODY.to_string(), body.clone()));
                }
                out.push(field(fields::ETAG, &p.etag));
                out.push(field(fields::CREATED_AT, &p.created_at.to_string()));
                out.push(field(fields::UPDATED_AT, &p.updated_at.to_string()));
                out.push(field(fields::CONTENT_TYPE, &p.content_type));
                out.push(field(fields::CONTENT_LENGTH, &p.content_length.to_string()));
                out.push(field(fields::RESOURCE_TYPE, p.kind.as_str()));
                out.push(field(fields::SYNCED, bool_str(p.synced)));
                out.push(field(fields::EXISTS, bool_str(true)));
                out
            }
        }
    }

    /// Decode a record read from the fast tier under `key`.
    pub fn decode(key: &str, mut map: FieldMap) -> Result<Self, StorageError> {
        let Some(exists) = map.remove(fields::EXISTS) else {
            return Ok(ResourceRecord::Absent);
        };
        let reader = FieldReader { key, map: &mut map };
        let synced = reader.parse_bool(fields::SYNCED)?;
        if !parse_bool(key, fields::EXISTS, &exists)? {
            return Ok(ResourceRecord::Tombstone { synced });
        }

        let mut reader = FieldReader { key, map: &mut map };
        let etag = reader.string(fields::ETAG)?;
        let created_at = reader.number::<i64>(fields::CREATED_AT)?;
        let updated_at = reader.number::<i64>(fields::UPDATED_AT)?;
        let content_type = reader.string(fields::CONTENT_TYPE)?;
        let content_length = reader.number::<u64>(fields::CONTENT_LENGTH)?;
        let kind = reader
            .string(fields::RESOURCE_TYPE)?
            .parse::<ResourceKind>()
            .map_err(|reason| corrupt(key, reason))?;
        let body = map.remove(fields::BODY);

        Ok(ResourceRecord::Present(PresentRecord {
            body,
            etag,
            created_at,
            updated_at,
            content_type,
            content_length,
            kind,
            synced,
        }))
    }
}

/// Public view of an existing resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMetadata {
    pub descriptor: ResourceDescriptor,
    pub etag: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub content_type: String,
    pub content_length: u64,
}

impl ResourceMetadata {
    #[must_use]
    pub fn url(&self) -> String {
        self.descriptor.url()
    }
}

struct FieldReader<'a> {
    key: &'a str,
    map: &'a mut FieldMap,
}

impl FieldReader<'_> {
    fn string(&mut self, name: &str) -> Result<String, StorageError> {
        let raw = self
            .map
            .remove(name)
            .ok_or_else(|| corrupt(self.key, format!("missing field '{}'", name)))?;
        String::from_utf8(raw).map_err(|_| corrupt(self.key, format!("field '{}' is not UTF-8", name)))
    }

    fn number<T: std::str::FromStr>(&mut self, name: &str) -> Result<T, StorageError> {
        let raw = self.string(name)?;
        raw.parse::<T>()
            .map_err(|_| corrupt(self.key, format!("field '{}' is not a number: {}", name, raw)))
    }

    fn parse_bool(self, name: &str) -> Result<bool, StorageError> {
        match self.map.remove(name) {
            Some(raw) => parse_bool(self.key, name, &raw),
            None => Err(corrupt(self.key, format!("missing field '{}'", name))),
        }
    }
}

fn parse_bool(key: &str, name: &str, raw: &[u8]) -> Result<bool, StorageError> {
    match raw {
        b"true" => Ok(true),
        b"false" => Ok(false),
        other => Err(corrupt(
            key,
            format!("field '{}' is not a boolean: {}", name, String::from_utf8_lossy(other)),
        )),
    }
}

fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn field(name: &str, value: &str) -> (String, Vec<u8>) {
    (name.to_string(), value.as_bytes().to_vec())
}

fn corrupt(key: &str, reason: impl Into<String>) -> StorageError {
    StorageError::Corruption { key: key.to_string(), reason: reason.into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PresentRecord {
        PresentRecord {
            body: Some(br#"{"a":1}"#.to_vec()),
            etag: "abc".into(),
            created_at: 1_700_000_000_000,
            updated_at: 1_700_000_000_500,
            content_type: "application/json".into(),
            content_length: 7,
            kind: ResourceKind::Conversation,
            synced: false,
        }
    }

    fn as_map(fields: Vec<(String, Vec<u8>)>) -> FieldMap {
        fields.into_iter().collect()
    }

    #[test]
    fn test_present_round_trip() {
        let record = ResourceRecord::Present(sample());
        let decoded = ResourceRecord::decode("k", as_map(record.encode())).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_metadata_only_read_has_no_body() {
        let mut map = as_map(ResourceRecord::Present(sample()).encode());
        map.remove(fields::BODY);
        let decoded = ResourceRecord::decode("k", map).unwrap();
        assert_eq!(decoded.present().unwrap().body, None);
    }

    #[test]
    fn test_tombstone_round_trip() {
        for synced in [true, false] {
            let record = ResourceRecord::Tombstone { synced };
            let decoded = ResourceRecord::decode("k", as_map(record.encode())).unwrap();
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn test_empty_map_is_absent() {
        assert_eq!(ResourceRecord::decode("k", FieldMap::new()).unwrap(), ResourceRecord::Absent);
        assert!(ResourceRecord::Absent.encode().is_empty());
    }

    #[test]
    fn test_malformed_fields_are_corruption() {
        let mut map = as_map(ResourceRecord::Present(sample()).encode());
        map.insert(fields::CONTENT_LENGTH.into(), b"seven".to_vec());
        assert!(matches!(
            ResourceRecord::decode("k", map),
            Err(StorageError::Corruption { .. })
        ));

        let mut map = as_map(ResourceRecord::Present(sample()).encode());
        map.insert(fields::EXISTS.into(), b"yes".to_vec());
        assert!(matches!(
            ResourceRecord::decode("k", map),
            Err(StorageError::Corruption { .. })
        ));

        let mut map = as_map(ResourceRecord::Present(sample()).encode());
        map.remove(fields::ETAG);
        assert!(matches!(
            ResourceRecord::decode("k", map),
            Err(StorageError::Corruption { .. })
        ));
    }

    #[test]
    fn test_stub_detection() {
        let mut stub = sample();
        stub.body = Some(Vec::new());
        stub.content_length = 2048;
        assert!(stub.is_stub(1024));
        assert!(!stub.is_stub(4096));

        stub.body = None;
        assert!(stub.is_stub(1024));
        assert!(!sample().is_stub(1024));
    }
}
