//! Storage backends for the fast tier, sync queue and durable tier.

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;

pub use memory::{InMemoryDurableTier, InMemoryFastTier, InMemoryScoredSet};
pub use self::redis::{RedisFastTier, RedisScoredSet};
pub use sql::SqlDurableTier;
pub use traits::{
    Blob, BlobMetadata, BlobPage, BlobWrite, DurableTier, FastTier, FieldMap, ListEntry, ScoredSet, StorageError,
};
