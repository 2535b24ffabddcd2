//! Wire vocabulary shared by the pusher and the receiver.
//!
//! Everything here is part of the protocol surface: the JSON payloads for the
//! `/api/v1` endpoints, the object-name grammar, and the textual checksum
//! format carried in multipart uploads.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// Object type suffixes we accept on the wire. `filez` is the compressed
/// content object form used by `archive` mode repositories.
pub const OBJECT_SUFFIXES: &[&str] = &["commit", "dirtree", "dirmeta", "file", "filez"];

/// A validated content-addressed object name, `<sha256-hex>.<suffix>`.
///
/// Object names become filesystem paths on the receiver, so parsing rejects
/// anything that is not exactly 64 lowercase hex characters followed by one
/// of the known suffixes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectName(String);

#[derive(Debug, thiserror::Error)]
#[error("invalid object name {0:?}")]
pub struct InvalidObjectName(pub String);

impl ObjectName {
    pub fn parse(s: &str) -> Result<Self, InvalidObjectName> {
        let (checksum, suffix) = s
            .split_once('.')
            .ok_or_else(|| InvalidObjectName(s.to_string()))?;
        if !is_hex_checksum(checksum) || !OBJECT_SUFFIXES.contains(&suffix) {
            return Err(InvalidObjectName(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The content checksum embedded in the name.
    pub fn checksum(&self) -> &str {
        &self.0[..64]
    }

    pub fn suffix(&self) -> &str {
        &self.0[65..]
    }

    /// Object path under `root`, using the store's two-level fan-out:
    /// `<root>/<first two hex chars>/<rest of name>`.
    pub fn path_in(&self, root: &Utf8Path) -> Utf8PathBuf {
        root.join(&self.0[..2]).join(&self.0[2..])
    }
}

impl std::fmt::Display for ObjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ObjectName {
    type Err = InvalidObjectName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ObjectName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ObjectName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Is `s` a 64-character lowercase hex checksum?
pub fn is_hex_checksum(s: &str) -> bool {
    s.len() == 64
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// The server and client revisions of one branch being updated. An empty
/// `server` revision means the branch does not exist on the server yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RevisionPair {
    pub server: String,
    pub client: String,
}

/// Reply to `GET /api/v1/info`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InfoResponse {
    /// Repository mode: `bare`, `archive`, `bare-user` or `bare-user-only`.
    pub mode: String,
    /// All refs with their current revisions.
    pub revs: BTreeMap<String, String>,
}

/// Body of `POST /api/v1/queue`: the branches to advance and the full object
/// closure backing them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueRequest {
    pub refs: BTreeMap<String, RevisionPair>,
    pub objects: Vec<ObjectName>,
}

/// Reply to `POST /api/v1/queue`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueResponse {
    pub id: String,
}

/// Reply to `GET /api/v1/queue/{id}`: objects still missing from both the
/// staging area and the live store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectsResponse {
    pub objects: Vec<ObjectName>,
}

/// Render the body of a multipart `checksum` part.
pub fn format_checksum_part(name: &ObjectName, digest: &str) -> String {
    format!("{name}:{digest}")
}

/// Parse the body of a multipart `checksum` part, `<object-name>:<hex-digest>`.
pub fn parse_checksum_part(body: &str) -> Result<(ObjectName, String), InvalidChecksumPart> {
    let (name, digest) = body
        .split_once(':')
        .ok_or_else(|| InvalidChecksumPart(body.to_string()))?;
    let name = ObjectName::parse(name).map_err(|_| InvalidChecksumPart(body.to_string()))?;
    if !is_hex_checksum(digest) {
        return Err(InvalidChecksumPart(body.to_string()));
    }
    Ok((name, digest.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("invalid checksum field {0:?}, expected \"<object-name>:<hex-digest>\"")]
pub struct InvalidChecksumPart(pub String);
