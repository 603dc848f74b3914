//! Resource addressing, etags and the fast-tier record model.
//!
//! A resource is addressed by URL: `{group}/{bucket}/{path}`, where the
//! group names its [`ResourceKind`]. Paths ending in `/` are folders.
//!
//! ```
//! use resource_engine::resource::{ResourceDescriptor, ResourceKind};
//!
//! let desc = ResourceDescriptor::from_url("conversations/b1/chats/hello.json").unwrap();
//! assert_eq!(desc.kind(), ResourceKind::Conversation);
//! assert_eq!(desc.blob_path(), "b1/conversations/chats/hello.json");
//! assert_eq!(desc.parent().unwrap().url(), "conversations/b1/chats/");
//! ```

mod descriptor;
mod etag;
mod record;

pub use descriptor::{ResourceDescriptor, ResourceKey};
pub use etag::{etag, parse_if_match, parse_if_none_match, EtagPrecondition, EtagSet};
pub use record::{fields, PresentRecord, ResourceMetadata, ResourceRecord};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What a resource holds. Decides its URL group and default content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceKind {
    File,
    Conversation,
    Prompt,
    Application,
    Publication,
    Rules,
    Invitation,
    SharedWithMe,
    SharedByMe,
    Notification,
    Limit,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 11] = [
        ResourceKind::File,
        ResourceKind::Conversation,
        ResourceKind::Prompt,
        ResourceKind::Application,
        ResourceKind::Publication,
        ResourceKind::Rules,
        ResourceKind::Invitation,
        ResourceKind::SharedWithMe,
        ResourceKind::SharedByMe,
        ResourceKind::Notification,
        ResourceKind::Limit,
    ];

    /// First URL segment for this kind.
    #[must_use]
    pub fn group(self) -> &'static str {
        match self {
            ResourceKind::File => "files",
            ResourceKind::Conversation => "conversations",
            ResourceKind::Prompt => "prompts",
            ResourceKind::Application => "applications",
            ResourceKind::Publication => "publications",
            ResourceKind::Rules => "rules",
            ResourceKind::Invitation => "invitations",
            ResourceKind::SharedWithMe => "shared_with_me",
            ResourceKind::SharedByMe => "shared_by_me",
            ResourceKind::Notification => "notifications",
            ResourceKind::Limit => "limits",
        }
    }

    #[must_use]
    pub fn from_group(group: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.group() == group)
    }

    /// Value of the `resource_type` record field.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::File => "FILE",
            ResourceKind::Conversation => "CONVERSATION",
            ResourceKind::Prompt => "PROMPT",
            ResourceKind::Application => "APPLICATION",
            ResourceKind::Publication => "PUBLICATION",
            ResourceKind::Rules => "RULES",
            ResourceKind::Invitation => "INVITATION",
            ResourceKind::SharedWithMe => "SHARED_WITH_ME",
            ResourceKind::SharedByMe => "SHARED_BY_ME",
            ResourceKind::Notification => "NOTIFICATION",
            ResourceKind::Limit => "LIMIT",
        }
    }

    #[must_use]
    pub fn default_content_type(self) -> &'static str {
        match self {
            ResourceKind::File => "application/octet-stream",
            _ => "application/json",
        }
    }

    /// File bodies keep the caller's content type and are never compressed.
    #[must_use]
    pub fn is_file(self) -> bool {
        self == ResourceKind::File
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown resource type: {}", s))
    }
}

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
