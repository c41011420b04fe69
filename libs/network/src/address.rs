//! Actor Addressing
//!
//! Location-transparent actor addresses. An address names the process
//! endpoint, the pool inside that process and the actor inside that pool.
//! Routing is a pure function of these three fields.

use crate::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Endpoint marker used by systems that do not accept inbound connections
pub const LOCAL_ENDPOINT: &str = "local";

/// URI scheme used by the textual address form
const ADDRESS_SCHEME: &str = "oscar://";

/// Identifier of a scheduling pool within one process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(String);

impl PoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PoolId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PoolId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Actor identifier, unique within its pool for the actor's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorUid(String);

impl ActorUid {
    /// Generate a fresh random uid
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ActorUid {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for ActorUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorUid {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Globally unique envelope identifier (16 bytes on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvelopeId(Uuid);

impl EnvelopeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env-{}", self.0.simple())
    }
}

/// Location-transparent actor address
///
/// Immutable once assigned. Two addresses are equal iff endpoint, pool and
/// uid all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorAddress {
    endpoint: String,
    pool_id: PoolId,
    uid: ActorUid,
}

impl ActorAddress {
    pub fn new(endpoint: impl Into<String>, pool_id: PoolId, uid: ActorUid) -> Self {
        Self {
            endpoint: endpoint.into(),
            pool_id,
            uid,
        }
    }

    /// Process endpoint (`host:port` or [`LOCAL_ENDPOINT`])
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn pool_id(&self) -> &PoolId {
        &self.pool_id
    }

    pub fn uid(&self) -> &ActorUid {
        &self.uid
    }

    /// Whether the address lives in a process without a listener
    pub fn is_local_only(&self) -> bool {
        self.endpoint == LOCAL_ENDPOINT
    }
}

/// Text form: `oscar://endpoint/pool/uid`, with `%` and `/` inside a
/// segment written as `%25` and `%2F`
impl fmt::Display for ActorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}/{}/{}",
            ADDRESS_SCHEME,
            escape_segment(&self.endpoint),
            escape_segment(self.pool_id.as_str()),
            escape_segment(self.uid.as_str())
        )
    }
}

fn escape_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace('/', "%2F")
}

fn unescape_segment(segment: &str) -> Option<String> {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let code = rest.get(at + 1..at + 3)?;
        match code {
            "25" => out.push('%'),
            "2F" | "2f" => out.push('/'),
            _ => return None,
        }
        rest = &rest[at + 3..];
    }
    out.push_str(rest);
    Some(out)
}

impl FromStr for ActorAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s.strip_prefix(ADDRESS_SCHEME).ok_or_else(|| {
            TransportError::protocol(format!("Address '{}' is missing the oscar:// scheme", s))
        })?;

        let mut parts = rest.splitn(3, '/');
        let endpoint = parts.next().unwrap_or_default();
        let pool = parts.next().unwrap_or_default();
        let uid = parts.next().unwrap_or_default();

        if endpoint.is_empty() || pool.is_empty() || uid.is_empty() || uid.contains('/') {
            return Err(TransportError::protocol(format!(
                "Address '{}' must have the form oscar://endpoint/pool/uid",
                s
            )));
        }

        let malformed = || TransportError::protocol(format!("Address '{}' has a malformed escape", s));
        let endpoint = unescape_segment(endpoint).ok_or_else(malformed)?;
        let pool = unescape_segment(pool).ok_or_else(malformed)?;
        let uid = unescape_segment(uid).ok_or_else(malformed)?;
        Ok(Self::new(endpoint, PoolId::new(pool), ActorUid::new(uid)))
    }
}
