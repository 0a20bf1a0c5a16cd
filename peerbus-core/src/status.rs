//! Status codes returned across the bus boundary.
//!
//! Every public operation yields `Result<T, Status>`; success is `Ok(..)`. `Status` is
//! serialisable because remote replies (join, name requests) carry it on the wire.

use serde::{Deserialize, Serialize};

/// Closed set of failure outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum Status {
    #[error("operation failed")]
    Fail,
    #[error("name is already owned")]
    NameInUse,
    #[error("invalid bus name")]
    InvalidName,
    #[error("invalid name flags")]
    InvalidFlags,
    #[error("join refused by session host")]
    JoinRefused,
    #[error("join timed out")]
    JoinTimeout,
    #[error("session port already bound")]
    PortAlreadyBound,
    #[error("no such session port")]
    NoSuchPort,
    #[error("endpoint closed")]
    EndpointClosed,
    #[error("protocol framing error")]
    ProtocolFramingError,
    #[error("no such session")]
    NoSession,
    #[error("already joined")]
    AlreadyJoined,
    #[error("incompatible session options")]
    BadSessionOpts,
    #[error("destination unreachable")]
    Unreachable,
    #[error("connect failed")]
    ConnectFailed,
    #[error("cannot join a session hosted by this attachment")]
    SelfJoin,
    #[error("not the session binder")]
    NotBinder,
    #[error("session is not multipoint")]
    NotMultipoint,
    #[error("no such session member")]
    NoSuchMember,
    #[error("name already advertised")]
    AlreadyAdvertising,
    #[error("name not advertised")]
    NotAdvertising,
    #[error("prefix already being discovered")]
    AlreadyDiscovering,
    #[error("prefix not being discovered")]
    NotDiscovering,
    #[error("interface already exists")]
    InterfaceExists,
    #[error("invalid interface definition")]
    InvalidInterface,
    #[error("bus attachment stopped")]
    BusStopped,
    #[error("no reply in time")]
    Timeout,
}

impl Status {
    /// Stable numeric code for logs and foreign callers.
    pub fn code(self) -> u16 {
        match self {
            Status::Fail => 1,
            Status::NameInUse => 2,
            Status::InvalidName => 3,
            Status::InvalidFlags => 4,
            Status::JoinRefused => 5,
            Status::JoinTimeout => 6,
            Status::PortAlreadyBound => 7,
            Status::NoSuchPort => 8,
            Status::EndpointClosed => 9,
            Status::ProtocolFramingError => 10,
            Status::NoSession => 11,
            Status::AlreadyJoined => 12,
            Status::BadSessionOpts => 13,
            Status::Unreachable => 14,
            Status::ConnectFailed => 15,
            Status::SelfJoin => 16,
            Status::NotBinder => 17,
            Status::NotMultipoint => 18,
            Status::NoSuchMember => 19,
            Status::AlreadyAdvertising => 20,
            Status::NotAdvertising => 21,
            Status::AlreadyDiscovering => 22,
            Status::NotDiscovering => 23,
            Status::InterfaceExists => 24,
            Status::InvalidInterface => 25,
            Status::BusStopped => 26,
            Status::Timeout => 27,
        }
    }
}

/// Why a session ended for this participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionLostReason {
    /// The other side called leave.
    RemoteEndLeft,
    /// The transport underneath went away without a leave.
    RemoteEndClosedAbruptly,
    /// The host removed this member.
    RemovedByBinder,
    /// The link was silent for longer than the link timeout.
    LinkTimeout,
    Unknown,
}
