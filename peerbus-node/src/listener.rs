//! Callback traits. Callbacks run one at a time on the dispatcher task, never on the task
//! that owns session state, so they may call back into the bus from a spawned task.
//! They must not block.

use peerbus_core::{SessionId, SessionLostReason, SessionOpts, SessionPort, TransportMask, UniqueName};

/// Accept policy and notifications for a bound session port.
pub trait SessionPortListener: Send + Sync {
    fn accept_session_joiner(&self, port: SessionPort, joiner: &UniqueName, opts: &SessionOpts) -> bool;

    fn session_joined(&self, _port: SessionPort, _id: SessionId, _joiner: &UniqueName) {}
}

/// Plain closures work as accept policies.
impl<F> SessionPortListener for F
where
    F: Fn(SessionPort, &UniqueName, &SessionOpts) -> bool + Send + Sync,
{
    fn accept_session_joiner(&self, port: SessionPort, joiner: &UniqueName, opts: &SessionOpts) -> bool {
        self(port, joiner, opts)
    }
}

pub trait SessionListener: Send + Sync {
    fn session_lost(&self, _id: SessionId, _reason: SessionLostReason) {}
    fn session_member_added(&self, _id: SessionId, _member: &UniqueName) {}
    fn session_member_removed(&self, _id: SessionId, _member: &UniqueName) {}
}

pub trait BusListener: Send + Sync {
    fn found_advertised_name(&self, _name: &str, _transport: TransportMask, _prefix: &str) {}
    fn lost_advertised_name(&self, _name: &str, _transport: TransportMask, _prefix: &str) {}
    fn name_owner_changed(&self, _name: &str, _previous: Option<&UniqueName>, _new: Option<&UniqueName>) {}
    fn bus_stopping(&self) {}
}
