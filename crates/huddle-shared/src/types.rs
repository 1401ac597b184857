use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChatError;

/// Declares a canonical identifier newtype over `Uuid`.
///
/// Ids are parsed once at the boundary (`FromStr` maps a malformed value to
/// `InvalidRequest`) and passed around by value afterwards.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ChatError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| ChatError::InvalidRequest(format!("invalid {}: {s}", $label)))
            }
        }
    };
}

uuid_id!(
    /// An authenticated user. Issued by the external identity provider.
    UserId,
    "user id"
);
uuid_id!(
    /// A direct or group conversation.
    ChatId,
    "chat id"
);
uuid_id!(MessageId, "message id");
uuid_id!(
    /// Reference to a blob held by the external attachment store.
    AttachmentId,
    "attachment id"
);
uuid_id!(AuditEventId, "audit event id");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    Group,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Direct => "direct",
            ChatKind::Group => "group",
        }
    }
}

/// A file reference carried by a message. The blob itself lives elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub id: AttachmentId,
}
