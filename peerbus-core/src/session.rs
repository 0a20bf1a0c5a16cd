//! Session identifiers, options and the per-session record kept by the multiplexer.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::UniqueName;
use crate::status::Status;
use crate::transport::TransportMask;

/// Session id: host short id in the high 32 bits, host-local counter in the low 32.
/// Zero is reserved for control traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub const CONTROL: SessionId = SessionId(0);

    pub fn compose(host_short_id: u32, counter: u32) -> Self {
        SessionId(((host_short_id as u64) << 32) | counter as u64)
    }

    pub fn from_u64(v: u64) -> Self {
        SessionId(v)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn host_short_id(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

pub type SessionPort = u16;

/// Passing this to bind asks the multiplexer to pick a free port.
pub const SESSION_PORT_ANY: SessionPort = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrafficType {
    Messages,
    RawReliable,
    RawUnreliable,
}

pub const PROXIMITY_PHYSICAL: u8 = 0x01;
pub const PROXIMITY_NETWORK: u8 = 0x02;
pub const PROXIMITY_ANY: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionOpts {
    pub traffic: TrafficType,
    pub multipoint: bool,
    pub proximity: u8,
    pub transports: TransportMask,
}

impl Default for SessionOpts {
    fn default() -> Self {
        Self {
            traffic: TrafficType::Messages,
            multipoint: false,
            proximity: PROXIMITY_ANY,
            transports: TransportMask::ANY,
        }
    }
}

impl SessionOpts {
    pub fn multipoint() -> Self {
        Self {
            multipoint: true,
            ..Self::default()
        }
    }

    /// Options a host may bind with. Raw traffic is point-to-point only.
    pub fn validate(&self) -> Result<(), Status> {
        if self.traffic != TrafficType::Messages && self.multipoint {
            return Err(Status::BadSessionOpts);
        }
        if self.transports.is_empty() || self.proximity == 0 {
            return Err(Status::BadSessionOpts);
        }
        Ok(())
    }

    pub fn is_compatible(&self, other: &SessionOpts) -> bool {
        self.traffic == other.traffic
            && self.proximity & other.proximity != 0
            && self.transports.intersects(other.transports)
    }

    /// Negotiated options for a joiner asking `requested` against a port bound with `self`.
    pub fn negotiate(&self, requested: &SessionOpts) -> Option<SessionOpts> {
        if !self.is_compatible(requested) {
            return None;
        }
        Some(SessionOpts {
            traffic: self.traffic,
            multipoint: self.multipoint && requested.multipoint,
            proximity: self.proximity & requested.proximity,
            transports: self.transports & requested.transports,
        })
    }
}

/// Where a session participant is reached from this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub enum Participant {
    /// This node's own bus attachment.
    Local,
    /// A peer behind the endpoint with this id.
    Remote(crate::multiplexer::EndpointId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Established,
    Terminated,
}

/// A live session as seen from this node.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub port: SessionPort,
    pub opts: SessionOpts,
    /// The binder. `Local` when this node hosts the session.
    pub host: Participant,
    pub host_name: UniqueName,
    /// False once a local host has left a multipoint session it keeps routing.
    pub host_present: bool,
    /// Joiners. On a joining node this holds `Local` plus any members the host told us about
    /// (those are recorded by name only, see `remote_members`).
    pub members: BTreeMap<Participant, UniqueName>,
    /// Other members of a multipoint session we joined, reached through the host.
    pub remote_members: Vec<UniqueName>,
    pub state: SessionState,
    /// Link timeout in ticks; 0 means the node default.
    pub link_timeout: u64,
    pub(crate) next_serial: u32,
}

impl Session {
    pub fn is_hosted_locally(&self) -> bool {
        self.host == Participant::Local
    }

    /// Participants that currently count toward keeping the session alive.
    pub fn participant_count(&self) -> usize {
        let host = if self.host_present { 1 } else { 0 };
        host + self.members.len() + self.remote_members.len()
    }

    /// True when `p` is the host or a member.
    pub fn involves(&self, p: Participant) -> bool {
        (self.host == p && self.host_present) || self.members.contains_key(&p)
    }

    pub(crate) fn take_serial(&mut self) -> u32 {
        self.next_serial = self.next_serial.wrapping_add(1).max(1);
        self.next_serial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_composition() {
        let id = SessionId::compose(0x1234_5678, 9);
        assert_eq!(id.host_short_id(), 0x1234_5678);
        assert_eq!(id.as_u64() & 0xffff_ffff, 9);
        assert!(id.is_valid());
        assert!(!SessionId::CONTROL.is_valid());
    }

    #[test]
    fn raw_multipoint_is_invalid() {
        let opts = SessionOpts {
            traffic: TrafficType::RawReliable,
            multipoint: true,
            ..SessionOpts::default()
        };
        assert_eq!(opts.validate(), Err(Status::BadSessionOpts));
        assert!(SessionOpts::default().validate().is_ok());
    }

    #[test]
    fn negotiate_intersects() {
        let bound = SessionOpts {
            transports: TransportMask::TCP | TransportMask::UDP,
            ..SessionOpts::multipoint()
        };
        let asked = SessionOpts {
            transports: TransportMask::TCP | TransportMask::BLUETOOTH,
            ..SessionOpts::default()
        };
        let got = bound.negotiate(&asked).unwrap();
        assert_eq!(got.transports, TransportMask::TCP);
        assert!(!got.multipoint);
    }

    #[test]
    fn traffic_mismatch_is_incompatible() {
        let bound = SessionOpts::default();
        let asked = SessionOpts {
            traffic: TrafficType::RawUnreliable,
            ..SessionOpts::default()
        };
        assert!(bound.negotiate(&asked).is_none());
        let disjoint = SessionOpts {
            transports: TransportMask::LOCAL,
            ..SessionOpts::default()
        };
        assert!(!bound.is_compatible(&disjoint));
    }
}
