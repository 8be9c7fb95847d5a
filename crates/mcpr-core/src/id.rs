//! Identifier newtypes.
//!
//! Every entity the gateway tracks gets its own id type so a server id can
//! never be passed where a token id is expected. Display forms carry a short
//! prefix (`srv:`, `tok:`, ...) for log readability.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse an id from its string form (with or without the prefix).
            #[must_use]
            pub fn parse(s: &str) -> Option<Self> {
                let raw = s.strip_prefix(concat!($prefix, ":")).unwrap_or(s);
                Uuid::parse_str(raw).ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a downstream MCP server descriptor.
    ServerId,
    "srv"
);

uuid_id!(
    /// Unique identifier for a project (tenant scope).
    ProjectId,
    "prj"
);

uuid_id!(
    /// Unique identifier for a policy rule.
    PolicyRuleId,
    "rule"
);

uuid_id!(
    /// Unique identifier for an approval request.
    ApprovalId,
    "apr"
);

uuid_id!(
    /// Unique identifier for an audit event.
    AuditEventId,
    "audit"
);

uuid_id!(
    /// Unique identifier for an SSE session on the front-end.
    SessionId,
    "sess"
);

/// Identifier of a client application, as recorded when its token was issued.
///
/// Client ids are operator-chosen strings ("claude-desktop", "vscode"), not
/// uuids, so this is a thin wrapper over the raw name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    /// Wrap a client name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The raw client name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque bearer token identifier.
///
/// Unlike the uuid ids above, token ids are random URL-safe strings: they
/// travel in `Authorization` headers and must not be guessable from a
/// creation timestamp. Never logged in full.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub String);

impl TokenId {
    const GENERATED_LEN: usize = 43;

    /// Generate a fresh random token id.
    #[must_use]
    pub fn generate() -> Self {
        use rand::Rng;
        const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
        let mut rng = rand::thread_rng();
        let raw: String = (0..Self::GENERATED_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self(raw)
    }

    /// Wrap an existing token id string.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw token string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A redacted form safe for logs: first four characters plus length.
    #[must_use]
    pub fn redacted(&self) -> String {
        let head: String = self.0.chars().take(4).collect();
        format!("{head}…({})", self.0.len())
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Display is the redacted form; the raw value only leaves via as_str().
        f.write_str(&self.redacted())
    }
}
