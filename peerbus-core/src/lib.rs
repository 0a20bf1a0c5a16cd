//! peerbus core: session and name multiplexing for a peer-to-peer message bus.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod identity;
pub mod interface;
pub mod multiplexer;
pub mod names;
pub mod protocol;
pub mod session;
pub mod status;
pub mod transport;
pub mod wire;

pub use identity::{NodeGuid, UniqueName};
pub use interface::{InterfaceBuilder, InterfaceDescription, InterfaceError, MemberFlags, MemberKind, PropertyAccess};
pub use multiplexer::{Action, BusEvent, CloseCause, CoreConfig, EndpointId, JoinRequestId, SessionMultiplexer};
pub use names::{NameFlags, ReleaseNameReply, RequestNameReply};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use session::{SessionId, SessionOpts, SessionPort, TrafficType, SESSION_PORT_ANY};
pub use status::{SessionLostReason, Status};
pub use transport::TransportMask;
pub use wire::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameDecoder, FrameEncodeError};
