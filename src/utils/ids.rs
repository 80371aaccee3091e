//! Object identifiers
//!
//! Every document, attachment and chunk is addressed by a 12-byte id rendered
//! as 24 lowercase hex characters. The first four bytes carry the creation
//! time in seconds (big endian), the remaining eight are random.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::error::InvalidObjectId;

/// Identity of an authenticated user (the hex form of the user's object id).
pub type UserId = String;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Length of the hex representation, and of the id prefix of a transfer frame.
    pub const HEX_LEN: usize = 24;

    /// Terminates a chunk chain.
    pub const NIL: ObjectId = ObjectId([0; 12]);

    pub fn new() -> Self {
        let mut bytes = [0u8; 12];
        let secs = chrono::Utc::now().timestamp() as u32;
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..].copy_from_slice(&Uuid::new_v4().as_bytes()[..8]);
        Self(bytes)
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    /// Parse the ASCII-hex form. Anything other than exactly 24 hex digits is rejected.
    pub fn from_hex(raw: &[u8]) -> Result<Self, InvalidObjectId> {
        if raw.len() != Self::HEX_LEN {
            return Err(InvalidObjectId);
        }
        let mut bytes = [0u8; 12];
        hex::decode_to_slice(raw, &mut bytes).map_err(|_| InvalidObjectId)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Hex form as raw bytes, the on-disk key format.
    pub fn hex_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        // cannot fail: the output buffer is exactly twice the input
        let _ = hex::encode_to_slice(self.0, &mut out);
        out
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = InvalidObjectId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s.as_bytes())
    }
}

impl TryFrom<String> for ObjectId {
    type Error = InvalidObjectId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.to_hex()
    }
}
