//! Node identity: GUID, short id derived from it, and unique bus names.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Node GUID (128-bit, random per bus attachment). Carried in hello and discovery beacons.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeGuid(uuid::Uuid);

impl NodeGuid {
    pub fn generate() -> Self {
        NodeGuid(uuid::Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        NodeGuid(uuid::Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Short id: first 4 bytes of SHA-256 of the GUID. Used as the session id prefix
    /// and in unique names.
    pub fn short_id(&self) -> u32 {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let digest = hasher.finalize();
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Unique name for the `n`th connection minted by this node, e.g. `:1a2b3c4d.1`.
    pub fn unique_name(&self, n: u32) -> UniqueName {
        UniqueName(format!(":{:08x}.{}", self.short_id(), n))
    }
}

impl fmt::Display for NodeGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Name of one bus participant. Unique names start with `:`; well-known names are
/// plain dotted names claimed through the registry, but owners are always unique names.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct UniqueName(String);

impl UniqueName {
    pub fn new(name: impl Into<String>) -> Self {
        UniqueName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UniqueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for UniqueName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for UniqueName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_is_stable_for_guid() {
        let guid = NodeGuid::generate();
        let again = NodeGuid::from_bytes(*guid.as_bytes());
        assert_eq!(guid.short_id(), again.short_id());
    }

    #[test]
    fn unique_name_format() {
        let guid = NodeGuid::from_bytes([7u8; 16]);
        let name = guid.unique_name(3);
        assert!(name.as_str().starts_with(':'));
        assert!(name.as_str().ends_with(".3"));
        assert_eq!(name.as_str().len(), 1 + 8 + 2);
    }

    #[test]
    fn distinct_guids_give_distinct_names() {
        let a = NodeGuid::generate();
        let b = NodeGuid::generate();
        assert_ne!(a.unique_name(1), b.unique_name(1));
    }
}
