//! peerbus wire protocol: control messages and version.

use serde::{Deserialize, Serialize};

use crate::identity::{NodeGuid, UniqueName};
use crate::names::{NameFlags, ReleaseNameReply, RequestNameReply};
use crate::session::{SessionId, SessionOpts, SessionPort};
use crate::status::{SessionLostReason, Status};
use crate::transport::TransportMask;

/// Current protocol version. Used in the frame header, hello and discovery beacons.
pub const PROTOCOL_VERSION: u8 = 1;

/// Control messages. Encoding is bincode inside a control frame (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// First frame on every connection, sent by both sides.
    Hello {
        protocol_version: u8,
        guid: NodeGuid,
        unique_name: UniqueName,
    },
    /// Discovery beacon: the full list of names a node advertises. Empty list withdraws all.
    Advertisement {
        protocol_version: u8,
        guid: NodeGuid,
        listen_port: u16,
        transports: TransportMask,
        names: Vec<String>,
    },
    /// Ask the receiver to host a session on `port`. `serial` correlates the reply.
    JoinSession {
        serial: u32,
        port: SessionPort,
        opts: SessionOpts,
    },
    JoinSessionReply {
        serial: u32,
        result: Result<(SessionId, SessionOpts), Status>,
    },
    /// Sender leaves the session.
    LeaveSession {
        session_id: SessionId,
    },
    /// Host tells a member the session is gone for it.
    SessionLost {
        session_id: SessionId,
        reason: SessionLostReason,
    },
    MemberAdded {
        session_id: SessionId,
        member: UniqueName,
    },
    MemberRemoved {
        session_id: SessionId,
        member: UniqueName,
    },
    /// A leaf endpoint claims a well-known name on the receiving node.
    RequestName {
        serial: u32,
        name: String,
        flags: NameFlags,
    },
    RequestNameReply {
        serial: u32,
        result: Result<RequestNameReply, Status>,
    },
    ReleaseName {
        serial: u32,
        name: String,
    },
    ReleaseNameReply {
        serial: u32,
        result: Result<ReleaseNameReply, Status>,
    },
    /// Heartbeat. Any frame counts as proof of life; Ping just guarantees one.
    Ping,
    /// Explicit ping; answered with `PingReply` carrying the same serial.
    PingRequest {
        serial: u32,
    },
    PingReply {
        serial: u32,
    },
}
