//! Interface definitions: explicit, data-driven descriptions of methods, signals and
//! properties, validated once when built.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::names::validate_bus_name;
use crate::status::Status;

const MAX_SIGNATURE_LEN: usize = 255;
const MAX_NESTING: usize = 32;
const MAX_MEMBER_LEN: usize = 255;
const BASIC_TYPES: &[u8] = b"ybnqiuxtdsogh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Method,
    Signal,
    Property,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    Read,
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemberFlags(u8);

impl MemberFlags {
    pub const NONE: MemberFlags = MemberFlags(0);
    /// Caller does not wait for a reply.
    pub const NO_REPLY: MemberFlags = MemberFlags(0x1);
    pub const DEPRECATED: MemberFlags = MemberFlags(0x2);

    pub fn contains(self, other: MemberFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MemberFlags {
    type Output = MemberFlags;
    fn bitor(self, rhs: Self) -> Self {
        MemberFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub kind: MemberKind,
    /// Input arguments for methods, arguments for signals, value type for properties.
    pub signature: String,
    /// Reply signature; methods only.
    pub out_signature: String,
    pub flags: MemberFlags,
    pub access: Option<PropertyAccess>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("invalid interface name {0:?}")]
    InvalidName(String),
    #[error("invalid member name {0:?}")]
    InvalidMember(String),
    #[error("member {member}: invalid signature {signature:?}")]
    InvalidSignature { member: String, signature: String },
    #[error("duplicate member {0}")]
    DuplicateMember(String),
    #[error("interface has no members")]
    Empty,
}

impl From<InterfaceError> for Status {
    fn from(_: InterfaceError) -> Status {
        Status::InvalidInterface
    }
}

/// Collects members; nothing is checked until [`InterfaceBuilder::build`].
#[derive(Debug, Clone)]
pub struct InterfaceBuilder {
    name: String,
    members: Vec<Member>,
}

impl InterfaceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    pub fn method(mut self, name: &str, in_sig: &str, out_sig: &str, flags: MemberFlags) -> Self {
        self.members.push(Member {
            name: name.to_string(),
            kind: MemberKind::Method,
            signature: in_sig.to_string(),
            out_signature: out_sig.to_string(),
            flags,
            access: None,
        });
        self
    }

    pub fn signal(mut self, name: &str, sig: &str, flags: MemberFlags) -> Self {
        self.members.push(Member {
            name: name.to_string(),
            kind: MemberKind::Signal,
            signature: sig.to_string(),
            out_signature: String::new(),
            flags,
            access: None,
        });
        self
    }

    pub fn property(mut self, name: &str, sig: &str, access: PropertyAccess) -> Self {
        self.members.push(Member {
            name: name.to_string(),
            kind: MemberKind::Property,
            signature: sig.to_string(),
            out_signature: String::new(),
            flags: MemberFlags::NONE,
            access: Some(access),
        });
        self
    }

    pub fn build(self) -> Result<InterfaceDescription, InterfaceError> {
        if validate_bus_name(&self.name).is_err() || self.name.contains('-') {
            return Err(InterfaceError::InvalidName(self.name));
        }
        if self.members.is_empty() {
            return Err(InterfaceError::Empty);
        }
        let mut members = BTreeMap::new();
        for m in self.members {
            if !valid_member_name(&m.name) {
                return Err(InterfaceError::InvalidMember(m.name));
            }
            for sig in [&m.signature, &m.out_signature] {
                if !validate_signature(sig) {
                    return Err(InterfaceError::InvalidSignature {
                        member: m.name.clone(),
                        signature: sig.clone(),
                    });
                }
            }
            // a property holds exactly one value
            if m.kind == MemberKind::Property && !is_single_type(&m.signature) {
                return Err(InterfaceError::InvalidSignature {
                    member: m.name.clone(),
                    signature: m.signature.clone(),
                });
            }
            if members.contains_key(&m.name) {
                return Err(InterfaceError::DuplicateMember(m.name));
            }
            members.insert(m.name.clone(), m);
        }
        Ok(InterfaceDescription {
            name: self.name,
            members,
        })
    }
}

/// A validated interface. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescription {
    name: String,
    members: BTreeMap<String, Member>,
}

impl InterfaceDescription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    pub fn members_of(&self, kind: MemberKind) -> impl Iterator<Item = &Member> {
        self.members.values().filter(move |m| m.kind == kind)
    }
}

/// Interfaces registered on one bus attachment, keyed by name.
#[derive(Debug, Default)]
pub struct InterfaceRegistry {
    interfaces: BTreeMap<String, Arc<InterfaceDescription>>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, desc: InterfaceDescription) -> Result<Arc<InterfaceDescription>, Status> {
        if self.interfaces.contains_key(desc.name()) {
            return Err(Status::InterfaceExists);
        }
        let desc = Arc::new(desc);
        self.interfaces.insert(desc.name().to_string(), Arc::clone(&desc));
        Ok(desc)
    }

    pub fn get(&self, name: &str) -> Option<Arc<InterfaceDescription>> {
        self.interfaces.get(name).cloned()
    }
}

fn valid_member_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= MAX_MEMBER_LEN && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// D-Bus style type signature: a sequence of complete types, possibly empty.
pub fn validate_signature(sig: &str) -> bool {
    let bytes = sig.as_bytes();
    if bytes.len() > MAX_SIGNATURE_LEN {
        return false;
    }
    let mut pos = 0;
    while pos < bytes.len() {
        match complete_type(bytes, pos, 0) {
            Some(next) => pos = next,
            None => return false,
        }
    }
    true
}

fn is_single_type(sig: &str) -> bool {
    let bytes = sig.as_bytes();
    !bytes.is_empty() && complete_type(bytes, 0, 0) == Some(bytes.len())
}

/// End offset of the complete type starting at `pos`.
fn complete_type(bytes: &[u8], pos: usize, depth: usize) -> Option<usize> {
    if depth > MAX_NESTING {
        return None;
    }
    let c = *bytes.get(pos)?;
    match c {
        b'v' => Some(pos + 1),
        c if BASIC_TYPES.contains(&c) => Some(pos + 1),
        b'a' if bytes.get(pos + 1) == Some(&b'{') => {
            let key = *bytes.get(pos + 2)?;
            if !BASIC_TYPES.contains(&key) {
                return None;
            }
            let end = complete_type(bytes, pos + 3, depth + 1)?;
            (bytes.get(end) == Some(&b'}')).then_some(end + 1)
        }
        b'a' => complete_type(bytes, pos + 1, depth + 1),
        b'(' => {
            let mut p = pos + 1;
            if bytes.get(p) == Some(&b')') {
                return None;
            }
            while bytes.get(p) != Some(&b')') {
                p = complete_type(bytes, p, depth + 1)?;
            }
            Some(p + 1)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat() -> InterfaceBuilder {
        InterfaceBuilder::new("org.example.Chat")
            .method("Send", "s", "b", MemberFlags::NONE)
            .signal("Message", "ss", MemberFlags::NONE)
            .property("Topic", "s", PropertyAccess::ReadWrite)
    }

    #[test]
    fn builds_and_indexes_members() {
        let desc = chat().build().unwrap();
        assert_eq!(desc.name(), "org.example.Chat");
        assert_eq!(desc.member("Send").unwrap().out_signature, "b");
        assert_eq!(desc.members_of(MemberKind::Signal).count(), 1);
        assert_eq!(
            desc.member("Topic").unwrap().access,
            Some(PropertyAccess::ReadWrite)
        );
    }

    #[test]
    fn signatures() {
        for good in ["", "s", "a{sv}", "(ii)as", "aai", "a(sa{yv})"] {
            assert!(validate_signature(good), "{good}");
        }
        for bad in ["z", "a", "a{vs}", "()", "(ii", "a{s}", "a{si"] {
            assert!(!validate_signature(bad), "{bad}");
        }
        // nesting deeper than 32 arrays
        assert!(!validate_signature(&format!("{}i", "a".repeat(40))));
    }

    #[test]
    fn rejects_bad_definitions() {
        assert_eq!(
            InterfaceBuilder::new("nodots").method("M", "", "", MemberFlags::NONE).build(),
            Err(InterfaceError::InvalidName("nodots".into()))
        );
        assert_eq!(InterfaceBuilder::new("org.example.E").build(), Err(InterfaceError::Empty));
        assert!(matches!(
            chat().method("Send", "", "", MemberFlags::NO_REPLY).build(),
            Err(InterfaceError::DuplicateMember(_))
        ));
        assert!(matches!(
            chat().property("Pair", "ss", PropertyAccess::Read).build(),
            Err(InterfaceError::InvalidSignature { .. })
        ));
        assert!(matches!(
            chat().method("1st", "", "", MemberFlags::NONE).build(),
            Err(InterfaceError::InvalidMember(_))
        ));
    }

    #[test]
    fn registry_rejects_duplicates() {
        let mut reg = InterfaceRegistry::new();
        reg.register(chat().build().unwrap()).unwrap();
        assert_eq!(reg.register(chat().build().unwrap()).unwrap_err(), Status::InterfaceExists);
        assert!(reg.get("org.example.Chat").is_some());
    }
}
