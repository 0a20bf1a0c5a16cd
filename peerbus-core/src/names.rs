//! Name/Discovery Registry: well-known name ownership queues, local advertisements,
//! remote advertisements heard through discovery, and prefix subscriptions.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::identity::{NodeGuid, UniqueName};
use crate::status::Status;
use crate::transport::TransportMask;

const MAX_NAME_LEN: usize = 255;

/// Flags for [`NameRegistry::request_name`]. Only the listed bits are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NameFlags(u8);

impl NameFlags {
    /// Fail with `NameInUse` on conflict.
    pub const NONE: NameFlags = NameFlags(0);
    /// Let a later `REPLACE_EXISTING` request take the name away.
    pub const ALLOW_REPLACEMENT: NameFlags = NameFlags(0x1);
    /// Take the name if the owner allowed replacement.
    pub const REPLACE_EXISTING: NameFlags = NameFlags(0x2);
    /// Wait in line on conflict instead of failing.
    pub const QUEUE: NameFlags = NameFlags(0x4);

    const ALL: u8 = 0x7;

    pub fn from_bits(bits: u8) -> Result<Self, Status> {
        if bits & !Self::ALL != 0 {
            return Err(Status::InvalidFlags);
        }
        Ok(NameFlags(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: NameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for NameFlags {
    type Output = NameFlags;
    fn bitor(self, rhs: Self) -> Self {
        NameFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    AlreadyOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

/// One ownership transition. `None` means "no owner".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerChange {
    pub name: String,
    pub previous: Option<UniqueName>,
    pub new: Option<UniqueName>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found {
        name: String,
        transport: TransportMask,
        prefix: String,
    },
    Lost {
        name: String,
        transport: TransportMask,
        prefix: String,
    },
}

#[derive(Debug, Clone)]
struct QueueEntry {
    owner: UniqueName,
    flags: NameFlags,
}

#[derive(Debug, Clone)]
struct RemoteNode {
    address: String,
    transports: TransportMask,
    names: BTreeSet<String>,
    last_seen: u64,
}

/// Bus name syntax: dot-separated elements of `[A-Za-z0-9_-]`, no element starting with a digit,
/// at least two elements, at most 255 bytes.
pub fn validate_bus_name(name: &str) -> Result<(), Status> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.starts_with(':') {
        return Err(Status::InvalidName);
    }
    let mut elements = 0;
    for element in name.split('.') {
        let first = element.chars().next().ok_or(Status::InvalidName)?;
        if first.is_ascii_digit() {
            return Err(Status::InvalidName);
        }
        if !element
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Status::InvalidName);
        }
        elements += 1;
    }
    if elements < 2 {
        return Err(Status::InvalidName);
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct NameRegistry {
    owners: HashMap<String, VecDeque<QueueEntry>>,
    /// name -> advertising owner -> transports. Owners never overlap on a transport.
    local_adverts: BTreeMap<String, BTreeMap<UniqueName, TransportMask>>,
    remote: BTreeMap<NodeGuid, RemoteNode>,
    subscriptions: BTreeMap<String, TransportMask>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self, name: &str) -> Option<&UniqueName> {
        self.owners.get(name).and_then(|q| q.front()).map(|e| &e.owner)
    }

    /// Owner followed by queued requesters.
    pub fn queue(&self, name: &str) -> Vec<UniqueName> {
        self.owners
            .get(name)
            .map(|q| q.iter().map(|e| e.owner.clone()).collect())
            .unwrap_or_default()
    }

    pub fn request_name(
        &mut self,
        owner: &UniqueName,
        name: &str,
        flags: NameFlags,
    ) -> Result<(RequestNameReply, Option<OwnerChange>), Status> {
        validate_bus_name(name)?;
        NameFlags::from_bits(flags.bits())?;
        let entry = QueueEntry {
            owner: owner.clone(),
            flags,
        };
        let Some(queue) = self.owners.get_mut(name) else {
            self.owners.insert(name.to_string(), VecDeque::from([entry]));
            return Ok((
                RequestNameReply::PrimaryOwner,
                Some(OwnerChange {
                    name: name.to_string(),
                    previous: None,
                    new: Some(owner.clone()),
                }),
            ));
        };

        let primary_is_owner = queue[0].owner == *owner;
        let replaceable = queue[0].flags.contains(NameFlags::ALLOW_REPLACEMENT);
        if primary_is_owner {
            queue[0].flags = flags;
            return Ok((RequestNameReply::AlreadyOwner, None));
        }
        if replaceable && flags.contains(NameFlags::REPLACE_EXISTING) {
            queue.retain(|e| e.owner != *owner);
            let previous = queue.pop_front();
            if let Some(prev) = &previous {
                if prev.flags.contains(NameFlags::QUEUE) {
                    queue.push_front(prev.clone());
                }
            }
            queue.push_front(entry);
            return Ok((
                RequestNameReply::PrimaryOwner,
                Some(OwnerChange {
                    name: name.to_string(),
                    previous: previous.map(|p| p.owner),
                    new: Some(owner.clone()),
                }),
            ));
        }
        if flags.contains(NameFlags::QUEUE) {
            if let Some(existing) = queue.iter_mut().find(|e| e.owner == *owner) {
                existing.flags = flags;
            } else {
                queue.push_back(entry);
            }
            return Ok((RequestNameReply::InQueue, None));
        }
        Err(Status::NameInUse)
    }

    /// Release `name` for `owner`. Not owning the name is not an error.
    pub fn release_name(
        &mut self,
        owner: &UniqueName,
        name: &str,
    ) -> Result<(ReleaseNameReply, Option<OwnerChange>), Status> {
        validate_bus_name(name)?;
        let Some(queue) = self.owners.get_mut(name) else {
            return Ok((ReleaseNameReply::NonExistent, None));
        };
        if queue.front().map(|e| &e.owner) == Some(owner) {
            queue.pop_front();
            let next = queue.front().map(|e| e.owner.clone());
            if next.is_none() {
                self.owners.remove(name);
            }
            return Ok((
                ReleaseNameReply::Released,
                Some(OwnerChange {
                    name: name.to_string(),
                    previous: Some(owner.clone()),
                    new: next,
                }),
            ));
        }
        let before = queue.len();
        queue.retain(|e| e.owner != *owner);
        if queue.len() != before {
            Ok((ReleaseNameReply::Released, None))
        } else {
            Ok((ReleaseNameReply::NotOwner, None))
        }
    }

    /// Drop every claim `owner` holds (primary or queued), e.g. when its endpoint closes.
    pub fn release_all(&mut self, owner: &UniqueName) -> Vec<OwnerChange> {
        let mut names: Vec<String> = self
            .owners
            .iter()
            .filter(|(_, q)| q.iter().any(|e| e.owner == *owner))
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|n| self.release_name(owner, &n).ok().and_then(|(_, c)| c))
            .collect()
    }

    /// Advertise a locally owned name over `transports`.
    pub fn advertise(
        &mut self,
        owner: &UniqueName,
        name: &str,
        transports: TransportMask,
    ) -> Result<Vec<DiscoveryEvent>, Status> {
        validate_bus_name(name)?;
        if transports.is_empty() {
            return Err(Status::Fail);
        }
        let before = self.local_mask(name);
        let owners = self.local_adverts.entry(name.to_string()).or_default();
        if owners
            .iter()
            .any(|(o, m)| o != owner && m.intersects(transports))
        {
            return Err(Status::NameInUse);
        }
        let mine = owners.entry(owner.clone()).or_default();
        if mine.contains(transports) {
            return Err(Status::AlreadyAdvertising);
        }
        *mine = *mine | transports;
        let after = self.local_mask(name);
        Ok(self.transitions(name, before, after))
    }

    pub fn cancel_advertise(
        &mut self,
        owner: &UniqueName,
        name: &str,
        transports: TransportMask,
    ) -> Result<Vec<DiscoveryEvent>, Status> {
        let before = self.local_mask(name);
        let owners = self.local_adverts.get_mut(name).ok_or(Status::NotAdvertising)?;
        let mine = match owners.get_mut(owner) {
            Some(m) if m.intersects(transports) => m,
            _ => return Err(Status::NotAdvertising),
        };
        *mine = mine.without(transports);
        if mine.is_empty() {
            owners.remove(owner);
        }
        if owners.is_empty() {
            self.local_adverts.remove(name);
        }
        let after = self.local_mask(name);
        Ok(self.transitions(name, before, after))
    }

    fn local_mask(&self, name: &str) -> TransportMask {
        self.local_adverts
            .get(name)
            .map(|owners| {
                owners
                    .values()
                    .fold(TransportMask::NONE, |acc, m| acc | *m)
            })
            .unwrap_or(TransportMask::NONE)
    }

    /// Names this node currently advertises, sorted.
    pub fn advertised_names(&self) -> Vec<String> {
        self.local_adverts.keys().cloned().collect()
    }

    /// Advertised names reachable over at least one of `transports`, sorted.
    pub fn advertised_names_over(&self, transports: TransportMask) -> Vec<String> {
        self.local_adverts
            .keys()
            .filter(|name| self.local_mask(name).intersects(transports))
            .cloned()
            .collect()
    }

    /// Subscribe to advertisements whose name starts with `prefix`. Existing matches are
    /// reported immediately.
    pub fn find(&mut self, prefix: &str, transports: TransportMask) -> Result<Vec<DiscoveryEvent>, Status> {
        if self.subscriptions.contains_key(prefix) {
            return Err(Status::AlreadyDiscovering);
        }
        self.subscriptions.insert(prefix.to_string(), transports);
        let mut events = Vec::new();
        for name in self.local_adverts.keys() {
            push_found(&mut events, prefix, transports, name, self.local_mask(name));
        }
        for node in self.remote.values() {
            for name in &node.names {
                push_found(&mut events, prefix, transports, name, node.transports);
            }
        }
        Ok(events)
    }

    pub fn cancel_find(&mut self, prefix: &str) -> Result<(), Status> {
        self.subscriptions
            .remove(prefix)
            .map(|_| ())
            .ok_or(Status::NotDiscovering)
    }

    /// Full advertisement list heard from `guid`. Names missing from a previous list are lost.
    pub fn on_remote_advertisement(
        &mut self,
        guid: NodeGuid,
        address: &str,
        transports: TransportMask,
        names: Vec<String>,
        now: u64,
    ) -> Vec<DiscoveryEvent> {
        let incoming: BTreeSet<String> = names
            .into_iter()
            .filter(|n| validate_bus_name(n).is_ok())
            .collect();
        let (old_names, old_transports) = match self.remote.get(&guid) {
            Some(node) => (node.names.clone(), node.transports),
            None => (BTreeSet::new(), TransportMask::NONE),
        };
        let mut events = Vec::new();
        for name in old_names.union(&incoming) {
            let before = if old_names.contains(name) {
                old_transports
            } else {
                TransportMask::NONE
            };
            let after = if incoming.contains(name) {
                transports
            } else {
                TransportMask::NONE
            };
            events.extend(self.transitions(name, before, after));
        }
        if incoming.is_empty() {
            self.remote.remove(&guid);
        } else {
            self.remote.insert(
                guid,
                RemoteNode {
                    address: address.to_string(),
                    transports,
                    names: incoming,
                    last_seen: now,
                },
            );
        }
        events
    }

    /// Forget remote nodes not heard from for more than `ttl` ticks.
    pub fn expire_remote(&mut self, now: u64, ttl: u64) -> Vec<DiscoveryEvent> {
        let stale: Vec<NodeGuid> = self
            .remote
            .iter()
            .filter(|(_, n)| now.saturating_sub(n.last_seen) > ttl)
            .map(|(g, _)| *g)
            .collect();
        let mut events = Vec::new();
        for guid in stale {
            if let Some(node) = self.remote.remove(&guid) {
                tracing::debug!(%guid, "advertisement expired");
                for name in &node.names {
                    events.extend(self.transitions(name, node.transports, TransportMask::NONE));
                }
            }
        }
        events
    }

    /// Where a discovered name can be reached: first advertising node in GUID order.
    pub fn locate(&self, name: &str) -> Option<(NodeGuid, &str)> {
        self.remote
            .iter()
            .find(|(_, n)| n.names.contains(name))
            .map(|(g, n)| (*g, n.address.as_str()))
    }

    fn transitions(&self, name: &str, before: TransportMask, after: TransportMask) -> Vec<DiscoveryEvent> {
        let mut events = Vec::new();
        for (prefix, mask) in &self.subscriptions {
            if !name.starts_with(prefix.as_str()) {
                continue;
            }
            let was = before & *mask;
            let now = after & *mask;
            match (was.is_empty(), now.is_empty()) {
                (true, false) => events.push(DiscoveryEvent::Found {
                    name: name.to_string(),
                    transport: now,
                    prefix: prefix.clone(),
                }),
                (false, true) => events.push(DiscoveryEvent::Lost {
                    name: name.to_string(),
                    transport: was,
                    prefix: prefix.clone(),
                }),
                _ => {}
            }
        }
        events
    }
}

fn push_found(
    events: &mut Vec<DiscoveryEvent>,
    prefix: &str,
    mask: TransportMask,
    name: &str,
    transports: TransportMask,
) {
    let t = transports & mask;
    if name.starts_with(prefix) && !t.is_empty() {
        events.push(DiscoveryEvent::Found {
            name: name.to_string(),
            transport: t,
            prefix: prefix.to_string(),
        });
    }
}
