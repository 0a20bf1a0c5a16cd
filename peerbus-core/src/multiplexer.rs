//! Host-driven session multiplexer: the host passes events in, the multiplexer returns actions.
//!
//! All session and name state lives here and is only mutated through these methods, so a host
//! that calls them from a single task gets serialized state transitions for free. Callbacks
//! (accept policy, listeners) are never run from inside; they surface as [`Action`]s.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;

use crate::identity::{NodeGuid, UniqueName};
use crate::names::{DiscoveryEvent, NameFlags, NameRegistry, OwnerChange, ReleaseNameReply, RequestNameReply};
use crate::protocol::Message;
use crate::session::{
    Participant, Session, SessionId, SessionOpts, SessionPort, SessionState, SESSION_PORT_ANY,
};
use crate::status::{SessionLostReason, Status};
use crate::transport::TransportMask;
use crate::wire::Frame;

/// Default join timeout in ticks.
pub const DEFAULT_JOIN_TIMEOUT_TICKS: u64 = 120;
/// Default interval between pings on every endpoint.
pub const DEFAULT_HEARTBEAT_TICKS: u64 = 20;
/// Default silence budget before an endpoint is declared dead.
pub const DEFAULT_LINK_TIMEOUT_TICKS: u64 = 160;
/// Default lifetime of a remote advertisement without refresh.
pub const DEFAULT_ADVERTISEMENT_TTL_TICKS: u64 = 160;

const FIRST_DYNAMIC_PORT: SessionPort = 0x8000;
const TOMBSTONES: usize = 1024;

/// Local handle for one connection, chosen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct EndpointId(pub u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{}", self.0)
    }
}

/// Correlates an inbound join with the host's accept decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JoinRequestId(pub u64);

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub join_timeout_ticks: u64,
    pub heartbeat_ticks: u64,
    pub link_timeout_ticks: u64,
    pub advertisement_ttl_ticks: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            join_timeout_ticks: DEFAULT_JOIN_TIMEOUT_TICKS,
            heartbeat_ticks: DEFAULT_HEARTBEAT_TICKS,
            link_timeout_ticks: DEFAULT_LINK_TIMEOUT_TICKS,
            advertisement_ttl_ticks: DEFAULT_ADVERTISEMENT_TTL_TICKS,
        }
    }
}

/// Why an endpoint went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Transport reported EOF or an I/O error.
    Disconnected,
    LinkTimeout,
    /// Malformed frame or a reference to a session that never existed.
    ProtocolError,
    /// The host closed it.
    Local,
}

impl CloseCause {
    fn reason(self) -> SessionLostReason {
        match self {
            CloseCause::Disconnected => SessionLostReason::RemoteEndClosedAbruptly,
            CloseCause::LinkTimeout => SessionLostReason::LinkTimeout,
            CloseCause::ProtocolError | CloseCause::Local => SessionLostReason::Unknown,
        }
    }
}

/// Notifications for listeners. The host dispatches these outside the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    SessionJoined {
        port: SessionPort,
        session_id: SessionId,
        joiner: UniqueName,
    },
    SessionLost {
        session_id: SessionId,
        reason: SessionLostReason,
    },
    SessionMemberAdded {
        session_id: SessionId,
        member: UniqueName,
    },
    SessionMemberRemoved {
        session_id: SessionId,
        member: UniqueName,
    },
    NameOwnerChanged {
        name: String,
        previous: Option<UniqueName>,
        new: Option<UniqueName>,
    },
    FoundAdvertisedName {
        name: String,
        transport: TransportMask,
        prefix: String,
    },
    LostAdvertisedName {
        name: String,
        transport: TransportMask,
        prefix: String,
    },
}

/// Work for the host.
#[derive(Debug, Clone)]
pub enum Action {
    Send(EndpointId, Frame),
    Close(EndpointId),
    /// Dial the node with `guid`; report `on_endpoint_connected` or `on_connect_failed`.
    Connect { guid: NodeGuid, address: String },
    /// Run the accept policy bound to `port`, then call `on_accept_decision`.
    AcceptJoiner {
        request: JoinRequestId,
        port: SessionPort,
        joiner: UniqueName,
        opts: SessionOpts,
    },
    JoinCompleted {
        serial: u32,
        result: Result<(SessionId, SessionOpts), Status>,
    },
    /// Outcome of `ping`, correlated by serial.
    PingCompleted {
        serial: u32,
        result: Result<(), Status>,
    },
    /// Session payload for the local attachment.
    Deliver {
        session_id: SessionId,
        sender: UniqueName,
        serial: u32,
        body: Vec<u8>,
    },
    Event(BusEvent),
}

#[derive(Debug, Clone)]
struct EndpointInfo {
    guid: NodeGuid,
    unique_name: UniqueName,
    transport: TransportMask,
    last_seen: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundState {
    AwaitingConnect(NodeGuid),
    Sent(EndpointId),
    /// Caller gave up or timed out; a late reply is consumed here.
    Abandoned,
}

#[derive(Debug, Clone)]
struct OutboundJoin {
    port: SessionPort,
    opts: SessionOpts,
    state: OutboundState,
    started: u64,
}

#[derive(Debug, Clone)]
struct InboundJoin {
    endpoint: EndpointId,
    serial: u32,
    port: SessionPort,
    opts: SessionOpts,
    started: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingPing {
    endpoint: EndpointId,
    started: u64,
}

enum Resolved {
    Endpoint(EndpointId),
    Dial(NodeGuid, String),
}

/// Session and name state for one bus attachment.
pub struct SessionMultiplexer {
    guid: NodeGuid,
    unique_name: UniqueName,
    config: CoreConfig,
    endpoints: BTreeMap<EndpointId, EndpointInfo>,
    names: NameRegistry,
    ports: BTreeMap<SessionPort, SessionOpts>,
    sessions: BTreeMap<SessionId, Session>,
    terminated: VecDeque<SessionId>,
    terminated_set: HashSet<SessionId>,
    outbound: HashMap<u32, OutboundJoin>,
    inbound: HashMap<JoinRequestId, InboundJoin>,
    pings: HashMap<u32, PendingPing>,
    next_session: u32,
    next_join_serial: u32,
    next_ping_serial: u32,
    next_control_serial: u32,
    next_request: u64,
    tick_count: u64,
}

impl SessionMultiplexer {
    pub fn new(guid: NodeGuid, config: CoreConfig) -> Self {
        Self::with_identity(guid, guid.unique_name(1), config)
    }

    pub fn with_identity(guid: NodeGuid, unique_name: UniqueName, config: CoreConfig) -> Self {
        Self {
            guid,
            unique_name,
            config,
            endpoints: BTreeMap::new(),
            names: NameRegistry::new(),
            ports: BTreeMap::new(),
            sessions: BTreeMap::new(),
            terminated: VecDeque::new(),
            terminated_set: HashSet::new(),
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            pings: HashMap::new(),
            next_session: 0,
            next_join_serial: 0,
            next_ping_serial: 0,
            next_control_serial: 0,
            next_request: 0,
            tick_count: 0,
        }
    }

    pub fn guid(&self) -> NodeGuid {
        self.guid
    }

    pub fn unique_name(&self) -> &UniqueName {
        &self.unique_name
    }

    pub fn names(&self) -> &NameRegistry {
        &self.names
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn endpoint_name(&self, ep: EndpointId) -> Option<&UniqueName> {
        self.endpoints.get(&ep).map(|e| &e.unique_name)
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    // ---- endpoint lifecycle -------------------------------------------------------------

    /// A connection finished its hello exchange. Parked joins waiting for this node are sent.
    pub fn on_endpoint_connected(
        &mut self,
        ep: EndpointId,
        guid: NodeGuid,
        unique_name: UniqueName,
        transport: TransportMask,
    ) -> Vec<Action> {
        tracing::debug!(%ep, %guid, name = %unique_name, "endpoint connected");
        self.endpoints.insert(
            ep,
            EndpointInfo {
                guid,
                unique_name,
                transport,
                last_seen: self.tick_count,
            },
        );
        let parked: Vec<u32> = self
            .outbound
            .iter()
            .filter(|(_, j)| j.state == OutboundState::AwaitingConnect(guid))
            .map(|(s, _)| *s)
            .collect();
        let mut actions = Vec::new();
        for serial in parked {
            if let Some(join) = self.outbound.get_mut(&serial) {
                join.state = OutboundState::Sent(ep);
                let msg = Message::JoinSession {
                    serial,
                    port: join.port,
                    opts: join.opts,
                };
                actions.extend(self.control(ep, &msg));
            }
        }
        actions
    }

    /// Dialing `guid` failed; joins parked on it fail with `ConnectFailed`.
    pub fn on_connect_failed(&mut self, guid: NodeGuid) -> Vec<Action> {
        let failed: Vec<u32> = self
            .outbound
            .iter()
            .filter(|(_, j)| j.state == OutboundState::AwaitingConnect(guid))
            .map(|(s, _)| *s)
            .collect();
        failed
            .into_iter()
            .map(|serial| {
                self.outbound.remove(&serial);
                Action::JoinCompleted {
                    serial,
                    result: Err(Status::ConnectFailed),
                }
            })
            .collect()
    }

    /// The endpoint is gone. Every session whose path ran through it is terminated or shrunk,
    /// names it owned are released. Calling this twice is harmless.
    pub fn on_endpoint_closed(&mut self, ep: EndpointId, cause: CloseCause) -> Vec<Action> {
        let Some(info) = self.endpoints.remove(&ep) else {
            return vec![];
        };
        tracing::debug!(%ep, name = %info.unique_name, ?cause, "endpoint closed");
        let reason = cause.reason();
        let peer = Participant::Remote(ep);
        let mut actions = Vec::new();

        let joined: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.host == peer)
            .map(|s| s.id)
            .collect();
        for id in joined {
            actions.extend(self.terminate_joined(id, reason));
        }
        let hosted: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_hosted_locally() && s.members.contains_key(&peer))
            .map(|s| s.id)
            .collect();
        for id in hosted {
            actions.extend(self.drop_member(id, peer, reason, false));
        }

        let broken: Vec<u32> = self
            .outbound
            .iter()
            .filter(|(_, j)| j.state == OutboundState::Sent(ep))
            .map(|(s, _)| *s)
            .collect();
        for serial in broken {
            self.outbound.remove(&serial);
            actions.push(Action::JoinCompleted {
                serial,
                result: Err(Status::EndpointClosed),
            });
        }
        self.inbound.retain(|_, r| r.endpoint != ep);
        let mut unanswered: Vec<u32> = self
            .pings
            .iter()
            .filter(|(_, p)| p.endpoint == ep)
            .map(|(s, _)| *s)
            .collect();
        unanswered.sort_unstable();
        for serial in unanswered {
            self.pings.remove(&serial);
            actions.push(Action::PingCompleted {
                serial,
                result: Err(Status::EndpointClosed),
            });
        }

        let still_connected = self
            .endpoints
            .values()
            .any(|e| e.unique_name == info.unique_name);
        if !still_connected {
            for change in self.names.release_all(&info.unique_name) {
                actions.push(owner_changed(change));
            }
        }
        actions
    }

    /// One frame read from `ep`, in arrival order.
    pub fn on_frame(&mut self, ep: EndpointId, frame: Frame) -> Vec<Action> {
        let Some(info) = self.endpoints.get_mut(&ep) else {
            tracing::debug!(%ep, "frame from unknown endpoint dropped");
            return vec![];
        };
        info.last_seen = self.tick_count;
        if frame.is_control() {
            match frame.message() {
                Ok(msg) => self.on_message(ep, msg),
                Err(e) => {
                    tracing::warn!(%ep, error = %e, "undecodable control frame");
                    self.protocol_violation(ep)
                }
            }
        } else {
            self.on_data(ep, frame)
        }
    }

    /// Periodic tick: join and accept timeouts, heartbeats, link timeouts, advertisement expiry.
    pub fn tick(&mut self) -> Vec<Action> {
        self.tick_count = self.tick_count.saturating_add(1);
        let now = self.tick_count;
        let join_timeout = self.config.join_timeout_ticks;
        let mut actions = Vec::new();

        let stale_inbound: Vec<JoinRequestId> = self
            .inbound
            .iter()
            .filter(|(_, r)| now.saturating_sub(r.started) > join_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in stale_inbound {
            if let Some(r) = self.inbound.remove(&id) {
                tracing::debug!(port = r.port, "accept decision timed out");
                let reply = Message::JoinSessionReply {
                    serial: r.serial,
                    result: Err(Status::JoinTimeout),
                };
                actions.extend(self.control(r.endpoint, &reply));
            }
        }

        let mut timed_out: Vec<u32> = Vec::new();
        self.outbound.retain(|serial, j| {
            let age = now.saturating_sub(j.started);
            match j.state {
                OutboundState::Abandoned => age <= join_timeout.saturating_mul(4),
                _ if age > join_timeout => {
                    timed_out.push(*serial);
                    true
                }
                _ => true,
            }
        });
        timed_out.sort_unstable();
        for serial in timed_out {
            if let Some(j) = self.outbound.get_mut(&serial) {
                j.state = OutboundState::Abandoned;
            }
            actions.push(Action::JoinCompleted {
                serial,
                result: Err(Status::JoinTimeout),
            });
        }

        let mut late_pings: Vec<u32> = self
            .pings
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.started) > join_timeout)
            .map(|(s, _)| *s)
            .collect();
        late_pings.sort_unstable();
        for serial in late_pings {
            self.pings.remove(&serial);
            actions.push(Action::PingCompleted {
                serial,
                result: Err(Status::Timeout),
            });
        }

        let heartbeat = self.config.heartbeat_ticks.max(1);
        if now % heartbeat == 0 {
            let eps: Vec<EndpointId> = self.endpoints.keys().copied().collect();
            for ep in eps {
                actions.extend(self.control(ep, &Message::Ping));
            }
        }

        let silent: Vec<EndpointId> = self
            .endpoints
            .iter()
            .filter(|(ep, info)| now.saturating_sub(info.last_seen) > self.link_timeout_for(**ep))
            .map(|(ep, _)| *ep)
            .collect();
        for ep in silent {
            tracing::info!(%ep, "link timeout");
            actions.push(Action::Close(ep));
            actions.extend(self.on_endpoint_closed(ep, CloseCause::LinkTimeout));
        }

        for event in self
            .names
            .expire_remote(now, self.config.advertisement_ttl_ticks)
        {
            actions.push(discovery_event(event));
        }
        actions
    }

    // ---- session ports and joins --------------------------------------------------------

    /// Bind `port` (or a free dynamic port for `SESSION_PORT_ANY`). Returns the bound port.
    pub fn bind_session_port(&mut self, port: SessionPort, opts: SessionOpts) -> Result<SessionPort, Status> {
        opts.validate()?;
        let port = if port == SESSION_PORT_ANY {
            (FIRST_DYNAMIC_PORT..=SessionPort::MAX)
                .find(|p| !self.ports.contains_key(p))
                .ok_or(Status::Fail)?
        } else if self.ports.contains_key(&port) {
            return Err(Status::PortAlreadyBound);
        } else {
            port
        };
        self.ports.insert(port, opts);
        tracing::debug!(port, "session port bound");
        Ok(port)
    }

    pub fn unbind_session_port(&mut self, port: SessionPort) -> Result<(), Status> {
        self.ports.remove(&port).map(|_| ()).ok_or(Status::NoSuchPort)
    }

    /// Start joining `port` on whoever `name` resolves to. Returns the correlation serial;
    /// the outcome arrives later as `Action::JoinCompleted` with that serial.
    pub fn join_session(
        &mut self,
        name: &str,
        port: SessionPort,
        opts: SessionOpts,
    ) -> Result<(u32, Vec<Action>), Status> {
        opts.validate()?;
        let target = self.resolve(name)?;
        self.next_join_serial = self.next_join_serial.wrapping_add(1).max(1);
        while self.outbound.contains_key(&self.next_join_serial) {
            self.next_join_serial = self.next_join_serial.wrapping_add(1).max(1);
        }
        let serial = self.next_join_serial;
        let mut actions = Vec::new();
        let state = match target {
            Resolved::Endpoint(ep) => {
                actions.extend(self.control(ep, &Message::JoinSession { serial, port, opts }));
                OutboundState::Sent(ep)
            }
            Resolved::Dial(guid, address) => {
                let dialing = self
                    .outbound
                    .values()
                    .any(|j| j.state == OutboundState::AwaitingConnect(guid));
                if !dialing {
                    actions.push(Action::Connect { guid, address });
                }
                OutboundState::AwaitingConnect(guid)
            }
        };
        self.outbound.insert(
            serial,
            OutboundJoin {
                port,
                opts,
                state,
                started: self.tick_count,
            },
        );
        tracing::debug!(serial, name, port, "join requested");
        Ok((serial, actions))
    }

    /// The caller stopped waiting for `serial`. A late accept is answered with a leave.
    pub fn cancel_join(&mut self, serial: u32) -> Vec<Action> {
        if let Some(j) = self.outbound.get_mut(&serial) {
            if let OutboundState::AwaitingConnect(_) = j.state {
                self.outbound.remove(&serial);
            } else {
                j.state = OutboundState::Abandoned;
            }
        }
        vec![]
    }

    /// Result of the accept policy for an `AcceptJoiner` action.
    pub fn on_accept_decision(&mut self, request: JoinRequestId, accept: bool) -> Vec<Action> {
        let Some(r) = self.inbound.remove(&request) else {
            return vec![];
        };
        let Some(joiner) = self.endpoints.get(&r.endpoint).map(|e| e.unique_name.clone()) else {
            return vec![];
        };
        let reply = |result| Message::JoinSessionReply {
            serial: r.serial,
            result,
        };
        if !accept {
            tracing::debug!(port = r.port, %joiner, "join refused");
            return self.control(r.endpoint, &reply(Err(Status::JoinRefused)));
        }
        if !self.ports.contains_key(&r.port) {
            return self.control(r.endpoint, &reply(Err(Status::NoSuchPort)));
        }

        let existing = if r.opts.multipoint {
            self.sessions
                .values()
                .find(|s| {
                    s.is_hosted_locally()
                        && s.port == r.port
                        && s.opts.multipoint
                        && s.state == SessionState::Established
                })
                .map(|s| s.id)
        } else {
            None
        };
        let id = match existing {
            Some(id) => id,
            None => {
                let id = self.allocate_session_id();
                self.sessions.insert(
                    id,
                    Session {
                        id,
                        port: r.port,
                        opts: r.opts,
                        host: Participant::Local,
                        host_name: self.unique_name.clone(),
                        host_present: true,
                        members: BTreeMap::new(),
                        remote_members: Vec::new(),
                        state: SessionState::Established,
                        link_timeout: 0,
                        next_serial: 0,
                    },
                );
                id
            }
        };

        let mut actions = Vec::new();
        let (opts, existing_members, host_present) = match self.sessions.get(&id) {
            Some(s) => (
                s.opts,
                s.members
                    .iter()
                    .map(|(p, n)| (*p, n.clone()))
                    .collect::<Vec<_>>(),
                s.host_present,
            ),
            None => return actions,
        };
        actions.extend(self.control(r.endpoint, &reply(Ok((id, opts)))));
        if opts.multipoint {
            for (p, name) in &existing_members {
                if let Participant::Remote(m) = p {
                    actions.extend(self.control(
                        *m,
                        &Message::MemberAdded {
                            session_id: id,
                            member: joiner.clone(),
                        },
                    ));
                }
                actions.extend(self.control(
                    r.endpoint,
                    &Message::MemberAdded {
                        session_id: id,
                        member: name.clone(),
                    },
                ));
            }
        }
        if let Some(s) = self.sessions.get_mut(&id) {
            s.members.insert(Participant::Remote(r.endpoint), joiner.clone());
        }
        tracing::debug!(%id, port = r.port, %joiner, "session joined");
        actions.push(Action::Event(BusEvent::SessionJoined {
            port: r.port,
            session_id: id,
            joiner: joiner.clone(),
        }));
        if opts.multipoint && host_present {
            actions.push(Action::Event(BusEvent::SessionMemberAdded {
                session_id: id,
                member: joiner,
            }));
        }
        actions
    }

    /// Leave a session this attachment hosts or joined.
    pub fn leave_session(&mut self, id: SessionId) -> Result<Vec<Action>, Status> {
        let session = self.sessions.get_mut(&id).ok_or(Status::NoSession)?;
        match session.host {
            Participant::Remote(ep) => {
                self.bury(id);
                Ok(self.control(ep, &Message::LeaveSession { session_id: id }))
            }
            Participant::Local => {
                if !session.host_present {
                    return Err(Status::NoSession);
                }
                session.host_present = false;
                if session.participant_count() < 2 {
                    return Ok(self.terminate_hosted(id, SessionLostReason::RemoteEndLeft));
                }
                let members: Vec<Participant> = session.members.keys().copied().collect();
                let mut actions = Vec::new();
                for p in members {
                    if let Participant::Remote(m) = p {
                        let msg = Message::MemberRemoved {
                            session_id: id,
                            member: self.unique_name.clone(),
                        };
                        actions.extend(self.control(m, &msg));
                    }
                }
                Ok(actions)
            }
        }
    }

    /// Host-side removal of a multipoint member.
    pub fn remove_session_member(&mut self, id: SessionId, member: &UniqueName) -> Result<Vec<Action>, Status> {
        let session = self.sessions.get(&id).ok_or(Status::NoSession)?;
        if !session.is_hosted_locally() {
            return Err(Status::NotBinder);
        }
        if !session.opts.multipoint {
            return Err(Status::NotMultipoint);
        }
        let participant = session
            .members
            .iter()
            .find(|(_, n)| *n == member)
            .map(|(p, _)| *p)
            .ok_or(Status::NoSuchMember)?;
        Ok(self.drop_member(id, participant, SessionLostReason::RemovedByBinder, true))
    }

    /// Set the link timeout for a session in ticks. 0 restores the default. Returns the
    /// effective value.
    pub fn set_link_timeout(&mut self, id: SessionId, ticks: u64) -> Result<u64, Status> {
        let floor = self.config.heartbeat_ticks.saturating_mul(2);
        let session = self.sessions.get_mut(&id).ok_or(Status::NoSession)?;
        if ticks == 0 {
            session.link_timeout = 0;
            return Ok(self.config.link_timeout_ticks);
        }
        session.link_timeout = ticks.max(floor);
        Ok(session.link_timeout)
    }

    /// Send an opaque payload to every other participant of `id`.
    pub fn send_on_session(&mut self, id: SessionId, body: Vec<u8>) -> Result<Vec<Action>, Status> {
        let session = self.sessions.get_mut(&id).ok_or(Status::NoSession)?;
        let targets: Vec<EndpointId> = match session.host {
            Participant::Remote(ep) => vec![ep],
            Participant::Local => {
                if !session.host_present {
                    return Err(Status::NoSession);
                }
                session
                    .members
                    .keys()
                    .filter_map(|p| match p {
                        Participant::Remote(ep) => Some(*ep),
                        Participant::Local => None,
                    })
                    .collect()
            }
        };
        let serial = session.take_serial();
        let mut actions = Vec::with_capacity(targets.len());
        for ep in targets {
            let frame = Frame::data(id, serial, body.clone()).map_err(|_| Status::Fail)?;
            actions.push(Action::Send(ep, frame));
        }
        Ok(actions)
    }

    // ---- names ------------------------------------------------------------------------------

    /// Unique name behind `name`: the name itself for this attachment or a connected peer,
    /// otherwise the primary owner of the well-known name.
    pub fn name_owner(&self, name: &str) -> Option<UniqueName> {
        if self.unique_name == name {
            return Some(self.unique_name.clone());
        }
        self.endpoints
            .values()
            .find(|e| e.unique_name == name)
            .map(|e| e.unique_name.clone())
            .or_else(|| self.names.owner(name).cloned())
    }

    /// Guid of the node that `name` lives on.
    pub fn peer_guid(&self, name: &str) -> Result<NodeGuid, Status> {
        if self.is_local(name) {
            return Ok(self.guid);
        }
        self.endpoint_for(name)
            .and_then(|ep| self.endpoints.get(&ep))
            .map(|e| e.guid)
            .ok_or(Status::Unreachable)
    }

    /// Ask the node behind `name` to answer. The outcome arrives as
    /// `Action::PingCompleted` with the returned serial; unanswered pings time out after
    /// the join timeout.
    pub fn ping(&mut self, name: &str) -> Result<(u32, Vec<Action>), Status> {
        let target = if self.is_local(name) {
            None
        } else {
            Some(self.endpoint_for(name).ok_or(Status::Unreachable)?)
        };
        self.next_ping_serial = self.next_ping_serial.wrapping_add(1).max(1);
        while self.pings.contains_key(&self.next_ping_serial) {
            self.next_ping_serial = self.next_ping_serial.wrapping_add(1).max(1);
        }
        let serial = self.next_ping_serial;
        let Some(ep) = target else {
            return Ok((serial, vec![Action::PingCompleted { serial, result: Ok(()) }]));
        };
        self.pings.insert(
            serial,
            PendingPing {
                endpoint: ep,
                started: self.tick_count,
            },
        );
        tracing::debug!(serial, name, %ep, "ping sent");
        Ok((serial, self.control(ep, &Message::PingRequest { serial })))
    }

    pub fn request_name(&mut self, name: &str, flags: NameFlags) -> Result<(RequestNameReply, Vec<Action>), Status> {
        let owner = self.unique_name.clone();
        let (reply, change) = self.names.request_name(&owner, name, flags)?;
        Ok((reply, change.into_iter().map(owner_changed).collect()))
    }

    pub fn release_name(&mut self, name: &str) -> Result<(ReleaseNameReply, Vec<Action>), Status> {
        let owner = self.unique_name.clone();
        let (reply, change) = self.names.release_name(&owner, name)?;
        Ok((reply, change.into_iter().map(owner_changed).collect()))
    }

    pub fn advertise_name(&mut self, name: &str, transports: TransportMask) -> Result<Vec<Action>, Status> {
        let owner = self.unique_name.clone();
        let events = self.names.advertise(&owner, name, transports)?;
        Ok(events.into_iter().map(discovery_event).collect())
    }

    pub fn cancel_advertise_name(&mut self, name: &str, transports: TransportMask) -> Result<Vec<Action>, Status> {
        let owner = self.unique_name.clone();
        let events = self.names.cancel_advertise(&owner, name, transports)?;
        Ok(events.into_iter().map(discovery_event).collect())
    }

    pub fn find_advertised_name(&mut self, prefix: &str, transports: TransportMask) -> Result<Vec<Action>, Status> {
        let events = self.names.find(prefix, transports)?;
        Ok(events.into_iter().map(discovery_event).collect())
    }

    pub fn cancel_find_advertised_name(&mut self, prefix: &str) -> Result<(), Status> {
        self.names.cancel_find(prefix)
    }

    /// A discovery beacon from another node.
    pub fn on_remote_advertisement(
        &mut self,
        guid: NodeGuid,
        address: &str,
        transports: TransportMask,
        names: Vec<String>,
    ) -> Vec<Action> {
        if guid == self.guid {
            return vec![];
        }
        self.names
            .on_remote_advertisement(guid, address, transports, names, self.tick_count)
            .into_iter()
            .map(discovery_event)
            .collect()
    }

    /// Leave every session and close every endpoint.
    pub fn shutdown(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut pings: Vec<u32> = self.pings.drain().map(|(s, _)| s).collect();
        pings.sort_unstable();
        for serial in pings {
            actions.push(Action::PingCompleted {
                serial,
                result: Err(Status::BusStopped),
            });
        }
        for id in self.session_ids() {
            let hosted_absent = self
                .sessions
                .get(&id)
                .map(|s| s.is_hosted_locally() && !s.host_present)
                .unwrap_or(false);
            if hosted_absent {
                actions.extend(self.terminate_hosted(id, SessionLostReason::RemoteEndLeft));
            } else if let Ok(a) = self.leave_session(id) {
                actions.extend(a);
            }
        }
        let eps: Vec<EndpointId> = self.endpoints.keys().copied().collect();
        for ep in eps {
            actions.push(Action::Close(ep));
            actions.extend(self.on_endpoint_closed(ep, CloseCause::Local));
        }
        for serial in self.outbound.keys().copied().collect::<Vec<_>>() {
            if let Some(j) = self.outbound.remove(&serial) {
                if j.state != OutboundState::Abandoned {
                    actions.push(Action::JoinCompleted {
                        serial,
                        result: Err(Status::BusStopped),
                    });
                }
            }
        }
        actions
    }

    // ---- internals ------------------------------------------------------------------------

    fn on_message(&mut self, ep: EndpointId, msg: Message) -> Vec<Action> {
        match msg {
            Message::Hello { .. } => {
                tracing::warn!(%ep, "hello after handshake");
                self.protocol_violation(ep)
            }
            Message::Advertisement { .. } => vec![],
            Message::JoinSession { serial, port, opts } => self.on_join_request(ep, serial, port, opts),
            Message::JoinSessionReply { serial, result } => self.on_join_reply(ep, serial, result),
            Message::LeaveSession { session_id } => self.on_remote_leave(ep, session_id),
            Message::SessionLost { session_id, reason } => {
                let from_host = self
                    .sessions
                    .get(&session_id)
                    .map(|s| s.host == Participant::Remote(ep))
                    .unwrap_or(false);
                if from_host {
                    self.terminate_joined(session_id, reason)
                } else {
                    vec![]
                }
            }
            Message::MemberAdded { session_id, member } => {
                let Some(s) = self.sessions.get_mut(&session_id) else {
                    return vec![];
                };
                if s.host != Participant::Remote(ep) || member == self.unique_name {
                    return vec![];
                }
                if !s.remote_members.contains(&member) {
                    s.remote_members.push(member.clone());
                }
                vec![Action::Event(BusEvent::SessionMemberAdded { session_id, member })]
            }
            Message::MemberRemoved { session_id, member } => {
                let Some(s) = self.sessions.get_mut(&session_id) else {
                    return vec![];
                };
                if s.host != Participant::Remote(ep) {
                    return vec![];
                }
                s.remote_members.retain(|m| *m != member);
                vec![Action::Event(BusEvent::SessionMemberRemoved { session_id, member })]
            }
            Message::RequestName { serial, name, flags } => {
                let Some(owner) = self.endpoint_name(ep).cloned() else {
                    return vec![];
                };
                let (result, change) = match self.names.request_name(&owner, &name, flags) {
                    Ok((reply, change)) => (Ok(reply), change),
                    Err(status) => (Err(status), None),
                };
                let mut actions = self.control(ep, &Message::RequestNameReply { serial, result });
                actions.extend(change.map(owner_changed));
                actions
            }
            Message::ReleaseName { serial, name } => {
                let Some(owner) = self.endpoint_name(ep).cloned() else {
                    return vec![];
                };
                let (result, change) = match self.names.release_name(&owner, &name) {
                    Ok((reply, change)) => (Ok(reply), change),
                    Err(status) => (Err(status), None),
                };
                let mut actions = self.control(ep, &Message::ReleaseNameReply { serial, result });
                actions.extend(change.map(owner_changed));
                actions
            }
            Message::PingRequest { serial } => self.control(ep, &Message::PingReply { serial }),
            Message::PingReply { serial } => match self.pings.get(&serial) {
                Some(p) if p.endpoint == ep => {
                    self.pings.remove(&serial);
                    vec![Action::PingCompleted { serial, result: Ok(()) }]
                }
                _ => vec![],
            },
            Message::RequestNameReply { .. } | Message::ReleaseNameReply { .. } | Message::Ping => vec![],
        }
    }

    fn on_join_request(&mut self, ep: EndpointId, serial: u32, port: SessionPort, opts: SessionOpts) -> Vec<Action> {
        let refuse = |status| Message::JoinSessionReply {
            serial,
            result: Err(status),
        };
        let Some(bound) = self.ports.get(&port).copied() else {
            return self.control(ep, &refuse(Status::NoSuchPort));
        };
        let Some(negotiated) = bound.negotiate(&opts) else {
            return self.control(ep, &refuse(Status::BadSessionOpts));
        };
        let already = negotiated.multipoint
            && self.sessions.values().any(|s| {
                s.is_hosted_locally()
                    && s.port == port
                    && s.opts.multipoint
                    && s.members.contains_key(&Participant::Remote(ep))
            });
        if already {
            return self.control(ep, &refuse(Status::AlreadyJoined));
        }
        if self
            .inbound
            .values()
            .any(|r| r.endpoint == ep && r.serial == serial)
        {
            return vec![];
        }
        let Some(joiner) = self.endpoint_name(ep).cloned() else {
            return vec![];
        };
        self.next_request += 1;
        let request = JoinRequestId(self.next_request);
        self.inbound.insert(
            request,
            InboundJoin {
                endpoint: ep,
                serial,
                port,
                opts: negotiated,
                started: self.tick_count,
            },
        );
        vec![Action::AcceptJoiner {
            request,
            port,
            joiner,
            opts: negotiated,
        }]
    }

    fn on_join_reply(
        &mut self,
        ep: EndpointId,
        serial: u32,
        result: Result<(SessionId, SessionOpts), Status>,
    ) -> Vec<Action> {
        let pending = match self.outbound.get(&serial) {
            Some(j) if j.state == OutboundState::Sent(ep) || j.state == OutboundState::Abandoned => {
                self.outbound.remove(&serial)
            }
            Some(_) => return vec![],
            None => None,
        };
        let live = matches!(&pending, Some(j) if j.state != OutboundState::Abandoned);
        if !live {
            // Nobody is waiting: give back a session the host created for us. The host may
            // already be sending on it, so its frames must be dropped, not treated as unknown.
            return match result {
                Ok((id, _)) if id.is_valid() && !self.sessions.contains_key(&id) => {
                    tracing::debug!(serial, %id, "late join reply, leaving");
                    self.tombstone(id);
                    self.control(ep, &Message::LeaveSession { session_id: id })
                }
                _ => vec![],
            };
        }
        let Some(join) = pending else {
            return vec![];
        };
        match result {
            Ok((id, opts)) => {
                if !id.is_valid() || self.sessions.contains_key(&id) {
                    // an id we already hold belongs to a live session; leaving would end it
                    tracing::warn!(serial, %id, "join reply reuses a session id");
                    return vec![Action::JoinCompleted {
                        serial,
                        result: Err(Status::Fail),
                    }];
                }
                let host_name = self
                    .endpoint_name(ep)
                    .cloned()
                    .unwrap_or_else(|| UniqueName::new(""));
                let mut members = BTreeMap::new();
                members.insert(Participant::Local, self.unique_name.clone());
                self.sessions.insert(
                    id,
                    Session {
                        id,
                        port: join.port,
                        opts,
                        host: Participant::Remote(ep),
                        host_name,
                        host_present: true,
                        members,
                        remote_members: Vec::new(),
                        state: SessionState::Established,
                        link_timeout: 0,
                        next_serial: 0,
                    },
                );
                tracing::debug!(serial, %id, "joined session");
                vec![Action::JoinCompleted {
                    serial,
                    result: Ok((id, opts)),
                }]
            }
            Err(status) => vec![Action::JoinCompleted {
                serial,
                result: Err(status),
            }],
        }
    }

    fn on_remote_leave(&mut self, ep: EndpointId, id: SessionId) -> Vec<Action> {
        let peer = Participant::Remote(ep);
        let Some(session) = self.sessions.get(&id) else {
            return vec![];
        };
        if session.is_hosted_locally() && session.members.contains_key(&peer) {
            self.drop_member(id, peer, SessionLostReason::RemoteEndLeft, false)
        } else if session.host == peer {
            self.terminate_joined(id, SessionLostReason::RemoteEndLeft)
        } else {
            vec![]
        }
    }

    fn on_data(&mut self, ep: EndpointId, frame: Frame) -> Vec<Action> {
        let id = frame.session_id();
        let Some(session) = self.sessions.get(&id) else {
            if self.terminated_set.contains(&id) {
                tracing::debug!(%ep, %id, "frame for finished session dropped");
                return vec![];
            }
            tracing::warn!(%ep, %id, "frame for unknown session");
            return self.protocol_violation(ep);
        };
        let peer = Participant::Remote(ep);
        if !session.involves(peer) {
            tracing::debug!(%ep, %id, "frame from non-participant dropped");
            return vec![];
        }
        let serial = frame.serial();
        if frame.is_relayed() {
            // only the host of a session we joined forwards on behalf of others
            if session.is_hosted_locally() || session.host != peer {
                tracing::warn!(%ep, %id, "relayed frame from a non-host");
                return self.protocol_violation(ep);
            }
            return match frame.relayed_parts() {
                Ok((sender, payload)) => vec![Action::Deliver {
                    session_id: id,
                    sender,
                    serial,
                    body: payload.to_vec(),
                }],
                Err(e) => {
                    tracing::warn!(%ep, %id, error = %e, "bad relayed frame");
                    self.protocol_violation(ep)
                }
            };
        }
        let sender = self
            .endpoints
            .get(&ep)
            .map(|e| e.unique_name.clone())
            .unwrap_or_else(|| UniqueName::new(""));
        let mut actions = Vec::new();
        if session.is_hosted_locally() {
            for p in session.members.keys() {
                let Participant::Remote(m) = p else {
                    continue;
                };
                if *m == ep {
                    continue;
                }
                match Frame::relayed(id, serial, &sender, frame.body()) {
                    Ok(f) => actions.push(Action::Send(*m, f)),
                    Err(e) => tracing::warn!(%id, error = %e, "frame too large to relay"),
                }
            }
            if !session.host_present {
                return actions;
            }
        }
        actions.push(Action::Deliver {
            session_id: id,
            sender,
            serial,
            body: frame.into_body(),
        });
        actions
    }

    fn protocol_violation(&mut self, ep: EndpointId) -> Vec<Action> {
        let mut actions = vec![Action::Close(ep)];
        actions.extend(self.on_endpoint_closed(ep, CloseCause::ProtocolError));
        actions
    }

    /// Remove one member from a locally hosted session; terminate when fewer than two remain.
    fn drop_member(
        &mut self,
        id: SessionId,
        participant: Participant,
        reason: SessionLostReason,
        notify_member: bool,
    ) -> Vec<Action> {
        let Some(session) = self.sessions.get_mut(&id) else {
            return vec![];
        };
        let Some(name) = session.members.remove(&participant) else {
            return vec![];
        };
        let multipoint = session.opts.multipoint;
        let host_present = session.host_present;
        let remaining = session.participant_count();
        let others: Vec<EndpointId> = session
            .members
            .keys()
            .filter_map(|p| match p {
                Participant::Remote(m) => Some(*m),
                Participant::Local => None,
            })
            .collect();

        let mut actions = Vec::new();
        if notify_member {
            if let Participant::Remote(m) = participant {
                actions.extend(self.control(m, &Message::SessionLost { session_id: id, reason }));
            }
        }
        if remaining < 2 {
            actions.extend(self.terminate_hosted(id, reason));
            return actions;
        }
        if multipoint {
            for m in others {
                let msg = Message::MemberRemoved {
                    session_id: id,
                    member: name.clone(),
                };
                actions.extend(self.control(m, &msg));
            }
            if host_present {
                actions.push(Action::Event(BusEvent::SessionMemberRemoved {
                    session_id: id,
                    member: name,
                }));
            }
        }
        actions
    }

    /// End a locally hosted session, telling every remaining participant exactly once.
    fn terminate_hosted(&mut self, id: SessionId, reason: SessionLostReason) -> Vec<Action> {
        let Some(session) = self.bury(id) else {
            return vec![];
        };
        let mut actions = Vec::new();
        for p in session.members.keys() {
            if let Participant::Remote(m) = p {
                actions.extend(self.control(*m, &Message::SessionLost { session_id: id, reason }));
            }
        }
        if session.host_present {
            actions.push(Action::Event(BusEvent::SessionLost {
                session_id: id,
                reason,
            }));
        }
        tracing::debug!(%id, ?reason, "hosted session terminated");
        actions
    }

    /// End a session this attachment joined.
    fn terminate_joined(&mut self, id: SessionId, reason: SessionLostReason) -> Vec<Action> {
        if self.bury(id).is_none() {
            return vec![];
        }
        tracing::debug!(%id, ?reason, "joined session lost");
        vec![Action::Event(BusEvent::SessionLost {
            session_id: id,
            reason,
        })]
    }

    fn bury(&mut self, id: SessionId) -> Option<Session> {
        let mut session = self.sessions.remove(&id)?;
        session.state = SessionState::Terminated;
        self.tombstone(id);
        Some(session)
    }

    /// Remember `id` so late frames for it are dropped quietly.
    fn tombstone(&mut self, id: SessionId) {
        if !self.terminated_set.insert(id) {
            return;
        }
        if self.terminated.len() >= TOMBSTONES {
            if let Some(old) = self.terminated.pop_front() {
                self.terminated_set.remove(&old);
            }
        }
        self.terminated.push_back(id);
    }

    fn allocate_session_id(&mut self) -> SessionId {
        loop {
            self.next_session = self.next_session.wrapping_add(1).max(1);
            let id = SessionId::compose(self.guid.short_id(), self.next_session);
            if !self.sessions.contains_key(&id) && !self.terminated_set.contains(&id) {
                return id;
            }
        }
    }

    fn resolve(&self, name: &str) -> Result<Resolved, Status> {
        if self.unique_name == name {
            return Err(Status::SelfJoin);
        }
        let by_unique = |n: &UniqueName| {
            self.endpoints
                .iter()
                .find(|(_, e)| e.unique_name == *n)
                .map(|(ep, _)| *ep)
        };
        if let Some(ep) = by_unique(&UniqueName::new(name)) {
            return Ok(Resolved::Endpoint(ep));
        }
        if let Some(owner) = self.names.owner(name) {
            if *owner == self.unique_name {
                return Err(Status::SelfJoin);
            }
            if let Some(ep) = by_unique(owner) {
                return Ok(Resolved::Endpoint(ep));
            }
        }
        if self.names.advertised_names().iter().any(|n| n == name) {
            return Err(Status::SelfJoin);
        }
        if let Some((guid, address)) = self.names.locate(name) {
            if guid == self.guid {
                return Err(Status::SelfJoin);
            }
            if let Some((ep, _)) = self.endpoints.iter().find(|(_, e)| e.guid == guid) {
                return Ok(Resolved::Endpoint(*ep));
            }
            return Ok(Resolved::Dial(guid, address.to_string()));
        }
        Err(Status::Unreachable)
    }

    /// `name` is this attachment's unique name, a name it owns, or one it advertises.
    fn is_local(&self, name: &str) -> bool {
        self.unique_name == name
            || self.names.owner(name) == Some(&self.unique_name)
            || self.names.advertised_names().iter().any(|n| n == name)
    }

    /// Connected endpoint reaching `name` by unique name, owner, or advertising node.
    fn endpoint_for(&self, name: &str) -> Option<EndpointId> {
        let by_unique = |n: &str| {
            self.endpoints
                .iter()
                .find(|(_, e)| e.unique_name == n)
                .map(|(ep, _)| *ep)
        };
        by_unique(name)
            .or_else(|| self.names.owner(name).and_then(|o| by_unique(o.as_str())))
            .or_else(|| {
                let (guid, _) = self.names.locate(name)?;
                self.endpoints
                    .iter()
                    .find(|(_, e)| e.guid == guid)
                    .map(|(ep, _)| *ep)
            })
    }

    fn link_timeout_for(&self, ep: EndpointId) -> u64 {
        let peer = Participant::Remote(ep);
        self.sessions
            .values()
            .filter(|s| s.link_timeout > 0 && (s.host == peer || s.members.contains_key(&peer)))
            .map(|s| s.link_timeout)
            .min()
            .unwrap_or(self.config.link_timeout_ticks)
    }

    fn control(&mut self, ep: EndpointId, msg: &Message) -> Vec<Action> {
        self.next_control_serial = self.next_control_serial.wrapping_add(1);
        match Frame::control(self.next_control_serial, msg) {
            Ok(frame) => vec![Action::Send(ep, frame)],
            Err(e) => {
                tracing::warn!(%ep, error = %e, "failed to encode control message");
                vec![]
            }
        }
    }
}

fn owner_changed(change: OwnerChange) -> Action {
    Action::Event(BusEvent::NameOwnerChanged {
        name: change.name,
        previous: change.previous,
        new: change.new,
    })
}

fn discovery_event(event: DiscoveryEvent) -> Action {
    Action::Event(match event {
        DiscoveryEvent::Found {
            name,
            transport,
            prefix,
        } => BusEvent::FoundAdvertisedName {
            name,
            transport,
            prefix,
        },
        DiscoveryEvent::Lost {
            name,
            transport,
            prefix,
        } => BusEvent::LostAdvertisedName {
            name,
            transport,
            prefix,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode_frame, encode_frame};

    type Policy = Box<dyn Fn(&UniqueName, SessionPort) -> bool>;

    struct Node {
        core: SessionMultiplexer,
        links: HashMap<EndpointId, (usize, EndpointId)>,
        policy: Option<Policy>,
        log: Vec<Action>,
    }

    /// In-memory network: frames go through the real codec, actions are applied in FIFO order.
    struct Net {
        nodes: Vec<Node>,
        next_ep: u64,
    }

    fn test_config() -> CoreConfig {
        CoreConfig {
            join_timeout_ticks: 10,
            heartbeat_ticks: 5,
            link_timeout_ticks: 30,
            advertisement_ttl_ticks: 20,
        }
    }

    impl Net {
        fn with_names(names: &[&str]) -> Self {
            let nodes = names
                .iter()
                .map(|n| Node {
                    core: SessionMultiplexer::with_identity(NodeGuid::generate(), UniqueName::new(*n), test_config()),
                    links: HashMap::new(),
                    policy: Some(Box::new(|_: &UniqueName, _: SessionPort| true)),
                    log: Vec::new(),
                })
                .collect();
            Net { nodes, next_ep: 1 }
        }

        fn name(&self, n: usize) -> UniqueName {
            self.nodes[n].core.unique_name().clone()
        }

        fn connect(&mut self, a: usize, b: usize) -> (EndpointId, EndpointId) {
            let ea = EndpointId(self.next_ep);
            let eb = EndpointId(self.next_ep + 1);
            self.next_ep += 2;
            self.nodes[a].links.insert(ea, (b, eb));
            self.nodes[b].links.insert(eb, (a, ea));
            let (ga, na) = (self.nodes[a].core.guid(), self.name(a));
            let (gb, nb) = (self.nodes[b].core.guid(), self.name(b));
            let actions = self.nodes[a].core.on_endpoint_connected(ea, gb, nb, TransportMask::TCP);
            self.run(a, actions);
            let actions = self.nodes[b].core.on_endpoint_connected(eb, ga, na, TransportMask::TCP);
            self.run(b, actions);
            (ea, eb)
        }

        fn kill(&mut self, n: usize, ep: EndpointId) {
            if let Some((peer, pep)) = self.nodes[n].links.remove(&ep) {
                self.nodes[peer].links.remove(&pep);
                let actions = self.nodes[n].core.on_endpoint_closed(ep, CloseCause::Disconnected);
                self.run(n, actions);
                let actions = self.nodes[peer].core.on_endpoint_closed(pep, CloseCause::Disconnected);
                self.run(peer, actions);
            }
        }

        fn run(&mut self, node: usize, actions: Vec<Action>) {
            let mut queue: VecDeque<(usize, Action)> = actions.into_iter().map(|a| (node, a)).collect();
            while let Some((n, action)) = queue.pop_front() {
                match action {
                    Action::Send(ep, frame) => {
                        let Some(&(peer, pep)) = self.nodes[n].links.get(&ep) else {
                            continue;
                        };
                        let (frame, _) = decode_frame(&encode_frame(&frame)).unwrap();
                        let out = self.nodes[peer].core.on_frame(pep, frame);
                        queue.extend(out.into_iter().map(|a| (peer, a)));
                    }
                    Action::Close(ep) => {
                        if let Some((peer, pep)) = self.nodes[n].links.remove(&ep) {
                            self.nodes[peer].links.remove(&pep);
                            let out = self.nodes[peer].core.on_endpoint_closed(pep, CloseCause::Disconnected);
                            queue.extend(out.into_iter().map(|a| (peer, a)));
                        }
                        self.nodes[n].log.push(Action::Close(ep));
                    }
                    Action::AcceptJoiner {
                        request, port, joiner, ..
                    } if self.nodes[n].policy.is_some() => {
                        let accept = self.nodes[n].policy.as_ref().map(|p| p(&joiner, port)).unwrap_or(false);
                        let out = self.nodes[n].core.on_accept_decision(request, accept);
                        queue.extend(out.into_iter().map(|a| (n, a)));
                    }
                    other => self.nodes[n].log.push(other),
                }
            }
        }

        fn tick(&mut self, n: usize, times: usize) {
            for _ in 0..times {
                let actions = self.nodes[n].core.tick();
                self.run(n, actions);
            }
        }

        fn join(&mut self, n: usize, name: &str, port: SessionPort, opts: SessionOpts) -> Result<(SessionId, SessionOpts), Status> {
            let (serial, actions) = self.nodes[n].core.join_session(name, port, opts)?;
            self.run(n, actions);
            self.take_join(n, serial).expect("join did not complete")
        }

        fn take_join(&mut self, n: usize, serial: u32) -> Option<Result<(SessionId, SessionOpts), Status>> {
            let log = &mut self.nodes[n].log;
            let pos = log
                .iter()
                .position(|a| matches!(a, Action::JoinCompleted { serial: s, .. } if *s == serial))?;
            match log.remove(pos) {
                Action::JoinCompleted { result, .. } => Some(result),
                _ => None,
            }
        }

        fn take_ping(&mut self, n: usize, serial: u32) -> Option<Result<(), Status>> {
            let log = &mut self.nodes[n].log;
            let pos = log
                .iter()
                .position(|a| matches!(a, Action::PingCompleted { serial: s, .. } if *s == serial))?;
            match log.remove(pos) {
                Action::PingCompleted { result, .. } => Some(result),
                _ => None,
            }
        }

        fn send(&mut self, n: usize, id: SessionId, body: &[u8]) {
            let actions = self.nodes[n].core.send_on_session(id, body.to_vec()).unwrap();
            self.run(n, actions);
        }

        fn events(&mut self, n: usize) -> Vec<BusEvent> {
            let log = std::mem::take(&mut self.nodes[n].log);
            let mut events = Vec::new();
            for a in log {
                match a {
                    Action::Event(e) => events.push(e),
                    other => self.nodes[n].log.push(other),
                }
            }
            events
        }

        fn deliveries(&mut self, n: usize) -> Vec<(SessionId, UniqueName, Vec<u8>)> {
            let log = std::mem::take(&mut self.nodes[n].log);
            let mut out = Vec::new();
            for a in log {
                match a {
                    Action::Deliver {
                        session_id, sender, body, ..
                    } => out.push((session_id, sender, body)),
                    other => self.nodes[n].log.push(other),
                }
            }
            out
        }
    }

    fn lost(events: &[BusEvent]) -> Vec<(SessionId, SessionLostReason)> {
        events
            .iter()
            .filter_map(|e| match e {
                BusEvent::SessionLost { session_id, reason } => Some((*session_id, *reason)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn accept_policy_filters_joiners() {
        let mut net = Net::with_names(&["host", "peerA", "peerB"]);
        net.connect(1, 0);
        net.connect(2, 0);
        net.nodes[0].core.bind_session_port(42, SessionOpts::default()).unwrap();
        net.nodes[0].policy = Some(Box::new(|joiner: &UniqueName, _: SessionPort| *joiner == "peerA"));

        assert_eq!(net.join(2, "host", 42, SessionOpts::default()), Err(Status::JoinRefused));
        assert!(net.nodes[0].core.session_ids().is_empty());
        assert!(net.nodes[2].core.session_ids().is_empty());

        let (id, _) = net.join(1, "host", 42, SessionOpts::default()).unwrap();
        assert!(id.is_valid());
        assert_eq!(net.nodes[0].core.session_ids(), vec![id]);
        assert_eq!(net.nodes[1].core.session_ids(), vec![id]);
        let events = net.events(0);
        assert_eq!(
            events,
            vec![BusEvent::SessionJoined {
                port: 42,
                session_id: id,
                joiner: UniqueName::new("peerA"),
            }]
        );
    }

    #[test]
    fn join_errors_from_host() {
        let mut net = Net::with_names(&["host", "joiner"]);
        net.connect(1, 0);
        assert_eq!(net.join(1, "host", 9, SessionOpts::default()), Err(Status::NoSuchPort));
        net.nodes[0].core.bind_session_port(9, SessionOpts::default()).unwrap();
        let raw = SessionOpts {
            traffic: crate::session::TrafficType::RawReliable,
            ..SessionOpts::default()
        };
        assert_eq!(net.join(1, "host", 9, raw), Err(Status::BadSessionOpts));
        assert_eq!(net.join(1, "nobody", 9, SessionOpts::default()).unwrap_err(), Status::Unreachable);
        assert_eq!(net.join(1, "joiner", 9, SessionOpts::default()).unwrap_err(), Status::SelfJoin);
    }

    #[test]
    fn accepted_joins_get_fresh_ids() {
        let mut net = Net::with_names(&["host", "joiner"]);
        net.connect(1, 0);
        net.nodes[0].core.bind_session_port(42, SessionOpts::default()).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..5 {
            let (id, _) = net.join(1, "host", 42, SessionOpts::default()).unwrap();
            assert!(seen.insert(id), "session id {id} reused");
            let actions = net.nodes[1].core.leave_session(id).unwrap();
            net.run(1, actions);
        }
        assert!(net.nodes[0].core.session_ids().is_empty());
        let host_lost = lost(&net.events(0));
        assert_eq!(host_lost.len(), 5);
        assert!(host_lost.iter().all(|(_, r)| *r == SessionLostReason::RemoteEndLeft));
        // the side that left gets no notification
        assert!(lost(&net.events(1)).is_empty());
    }

    #[test]
    fn frames_keep_per_session_order() {
        let mut net = Net::with_names(&["host", "joiner"]);
        net.connect(1, 0);
        net.nodes[0].core.bind_session_port(42, SessionOpts::default()).unwrap();
        let (s1, _) = net.join(1, "host", 42, SessionOpts::default()).unwrap();
        let (s2, _) = net.join(1, "host", 42, SessionOpts::default()).unwrap();
        for (id, body) in [(s1, "a1"), (s2, "b1"), (s1, "a2"), (s2, "b2"), (s1, "a3")] {
            net.send(1, id, body.as_bytes());
        }
        let got = net.deliveries(0);
        let bodies = |id| {
            got.iter()
                .filter(|(s, _, _)| *s == id)
                .map(|(_, _, b)| String::from_utf8(b.clone()).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(bodies(s1), vec!["a1", "a2", "a3"]);
        assert_eq!(bodies(s2), vec!["b1", "b2"]);
        assert!(got.iter().all(|(_, sender, _)| *sender == "joiner"));
    }

    #[test]
    fn killing_the_endpoint_loses_each_session_once() {
        let mut net = Net::with_names(&["host", "joiner"]);
        let (ep_joiner, _) = net.connect(1, 0);
        net.nodes[0].core.bind_session_port(42, SessionOpts::default()).unwrap();
        let (s1, _) = net.join(1, "host", 42, SessionOpts::default()).unwrap();
        let (s2, _) = net.join(1, "host", 42, SessionOpts::default()).unwrap();
        net.events(0);

        net.kill(1, ep_joiner);
        // killing again is a no-op
        net.kill(1, ep_joiner);
        for n in [0, 1] {
            let mut got = lost(&net.events(n));
            got.sort_by_key(|(id, _)| *id);
            assert_eq!(
                got,
                vec![
                    (s1, SessionLostReason::RemoteEndClosedAbruptly),
                    (s2, SessionLostReason::RemoteEndClosedAbruptly),
                ]
            );
            assert!(net.nodes[n].core.session(s1).is_none());
            assert!(net.nodes[n].core.session(s2).is_none());
        }
    }

    #[test]
    fn late_frames_are_dropped_and_unknown_sessions_close_the_endpoint() {
        let mut net = Net::with_names(&["host", "joiner"]);
        let (ep_joiner, _) = net.connect(1, 0);
        net.nodes[0].core.bind_session_port(42, SessionOpts::default()).unwrap();
        let (s1, _) = net.join(1, "host", 42, SessionOpts::default()).unwrap();
        net.kill(1, ep_joiner);
        let (_, ep_host) = net.connect(1, 0);

        let late = Frame::data(s1, 9, b"late".to_vec()).unwrap();
        assert!(net.nodes[0].core.on_frame(ep_host, late).is_empty());

        let bogus = Frame::data(SessionId::compose(7, 7), 1, vec![]).unwrap();
        let actions = net.nodes[0].core.on_frame(ep_host, bogus);
        assert!(matches!(actions.first(), Some(Action::Close(ep)) if *ep == ep_host));
        assert_eq!(net.nodes[0].core.endpoint_count(), 0);
    }

    #[test]
    fn multipoint_membership_and_relay() {
        let mut net = Net::with_names(&["host", "m1", "m2"]);
        net.connect(1, 0);
        net.connect(2, 0);
        net.nodes[0].core.bind_session_port(7, SessionOpts::multipoint()).unwrap();
        let (s, opts) = net.join(1, "host", 7, SessionOpts::multipoint()).unwrap();
        assert!(opts.multipoint);
        let (s_again, _) = net.join(2, "host", 7, SessionOpts::multipoint()).unwrap();
        assert_eq!(s, s_again);

        assert!(net.events(1).contains(&BusEvent::SessionMemberAdded {
            session_id: s,
            member: UniqueName::new("m2"),
        }));
        assert!(net.events(2).contains(&BusEvent::SessionMemberAdded {
            session_id: s,
            member: UniqueName::new("m1"),
        }));
        let host_events = net.events(0);
        assert_eq!(
            host_events
                .iter()
                .filter(|e| matches!(e, BusEvent::SessionMemberAdded { .. }))
                .count(),
            2
        );

        net.send(1, s, b"hi all");
        assert_eq!(net.deliveries(0), vec![(s, UniqueName::new("m1"), b"hi all".to_vec())]);
        assert_eq!(net.deliveries(2), vec![(s, UniqueName::new("m1"), b"hi all".to_vec())]);
        assert!(net.deliveries(1).is_empty());

        // a second join from the same member is rejected
        assert_eq!(net.join(1, "host", 7, SessionOpts::multipoint()), Err(Status::AlreadyJoined));

        let actions = net.nodes[0]
            .core
            .remove_session_member(s, &UniqueName::new("m2"))
            .unwrap();
        net.run(0, actions);
        assert_eq!(lost(&net.events(2)), vec![(s, SessionLostReason::RemovedByBinder)]);
        assert!(net.events(1).contains(&BusEvent::SessionMemberRemoved {
            session_id: s,
            member: UniqueName::new("m2"),
        }));
        assert!(net.nodes[0].core.session(s).is_some());

        let actions = net.nodes[0].core.leave_session(s).unwrap();
        net.run(0, actions);
        assert_eq!(lost(&net.events(1)), vec![(s, SessionLostReason::RemoteEndLeft)]);
        assert!(lost(&net.events(0)).is_empty());
        assert!(net.nodes[0].core.session(s).is_none());
    }

    #[test]
    fn remove_member_preconditions() {
        let mut net = Net::with_names(&["host", "joiner"]);
        net.connect(1, 0);
        net.nodes[0].core.bind_session_port(42, SessionOpts::default()).unwrap();
        let (s, _) = net.join(1, "host", 42, SessionOpts::default()).unwrap();
        let member = UniqueName::new("joiner");
        assert_eq!(
            net.nodes[1].core.remove_session_member(s, &member).unwrap_err(),
            Status::NotBinder
        );
        assert_eq!(
            net.nodes[0].core.remove_session_member(s, &member).unwrap_err(),
            Status::NotMultipoint
        );
        assert_eq!(
            net.nodes[0]
                .core
                .remove_session_member(SessionId::compose(1, 1), &member)
                .unwrap_err(),
            Status::NoSession
        );
    }

    #[test]
    fn timed_out_join_leaves_a_late_acceptance() {
        let mut net = Net::with_names(&["host", "joiner"]);
        net.connect(1, 0);
        net.nodes[0].core.bind_session_port(42, SessionOpts::default()).unwrap();
        net.nodes[0].policy = None;

        let (serial, actions) = net.nodes[1].core.join_session("host", 42, SessionOpts::default()).unwrap();
        net.run(1, actions);
        assert!(net.take_join(1, serial).is_none());
        net.tick(1, 11);
        assert_eq!(net.take_join(1, serial), Some(Err(Status::JoinTimeout)));

        let request = net.nodes[0]
            .log
            .iter()
            .find_map(|a| match a {
                Action::AcceptJoiner { request, .. } => Some(*request),
                _ => None,
            })
            .unwrap();
        let actions = net.nodes[0].core.on_accept_decision(request, true);
        net.run(0, actions);
        assert!(net.nodes[1].core.session_ids().is_empty());
        assert!(net.nodes[0].core.session_ids().is_empty());
        assert_eq!(lost(&net.events(0)).len(), 1);
    }

    #[test]
    fn host_data_racing_a_late_leave_is_dropped() {
        let mut net = Net::with_names(&["host", "joiner"]);
        net.connect(1, 0);
        net.nodes[0].core.bind_session_port(42, SessionOpts::default()).unwrap();
        net.nodes[0].core.bind_session_port(43, SessionOpts::default()).unwrap();
        let (healthy, _) = net.join(1, "host", 43, SessionOpts::default()).unwrap();
        net.events(1);
        net.nodes[0].policy = None;

        let (serial, actions) = net.nodes[1].core.join_session("host", 42, SessionOpts::default()).unwrap();
        net.run(1, actions);
        net.tick(1, 11);
        assert_eq!(net.take_join(1, serial), Some(Err(Status::JoinTimeout)));

        let request = net.nodes[0]
            .log
            .iter()
            .find_map(|a| match a {
                Action::AcceptJoiner { request, .. } => Some(*request),
                _ => None,
            })
            .unwrap();
        // accept, then send at once: reply and data both reach the joiner before its leave
        let mut actions = net.nodes[0].core.on_accept_decision(request, true);
        let late = net.nodes[0]
            .core
            .session_ids()
            .into_iter()
            .find(|id| *id != healthy)
            .unwrap();
        actions.extend(net.nodes[0].core.send_on_session(late, b"welcome".to_vec()).unwrap());
        net.run(0, actions);

        assert!(!net.nodes[1].log.iter().any(|a| matches!(a, Action::Close(_))));
        assert!(lost(&net.events(1)).is_empty());
        assert!(net.deliveries(1).is_empty());
        assert_eq!(net.nodes[1].core.session_ids(), vec![healthy]);
        assert_eq!(net.nodes[0].core.session_ids(), vec![healthy]);
        net.send(1, healthy, b"still here");
        assert_eq!(net.deliveries(0), vec![(healthy, UniqueName::new("joiner"), b"still here".to_vec())]);
    }

    #[test]
    fn relayed_frames_name_their_origin() {
        let mut net = Net::with_names(&["host", "m1", "m2"]);
        net.connect(1, 0);
        net.connect(2, 0);
        net.nodes[0].core.bind_session_port(7, SessionOpts::multipoint()).unwrap();
        let (s, _) = net.join(1, "host", 7, SessionOpts::multipoint()).unwrap();
        net.join(2, "host", 7, SessionOpts::multipoint()).unwrap();

        net.send(2, s, b"from m2");
        net.send(0, s, b"from host");
        assert_eq!(
            net.deliveries(1),
            vec![
                (s, UniqueName::new("m2"), b"from m2".to_vec()),
                (s, UniqueName::new("host"), b"from host".to_vec()),
            ]
        );
        assert_eq!(net.deliveries(2), vec![(s, UniqueName::new("host"), b"from host".to_vec())]);
        assert_eq!(net.deliveries(0), vec![(s, UniqueName::new("m2"), b"from m2".to_vec())]);
    }

    #[test]
    fn relayed_frame_from_a_member_closes_its_endpoint() {
        let mut net = Net::with_names(&["host", "m1"]);
        let (_, host_side) = net.connect(1, 0);
        net.nodes[0].core.bind_session_port(7, SessionOpts::multipoint()).unwrap();
        let (s, _) = net.join(1, "host", 7, SessionOpts::multipoint()).unwrap();
        net.events(0);

        let forged = Frame::relayed(s, 1, &UniqueName::new("someone"), b"x").unwrap();
        let actions = net.nodes[0].core.on_frame(host_side, forged);
        assert!(actions.iter().any(|a| matches!(a, Action::Close(ep) if *ep == host_side)));
        assert!(net.nodes[0].core.session(s).is_none());
    }

    #[test]
    fn abandoned_joins_survive_an_unbounded_join_timeout() {
        let mut net = Net::with_names(&["host", "joiner"]);
        net.nodes[1].core.config.join_timeout_ticks = u64::MAX;
        net.connect(1, 0);
        // request never delivered, so the join stays outstanding
        let (serial, _) = net.nodes[1]
            .core
            .join_session("host", 42, SessionOpts::default())
            .unwrap();
        net.nodes[1].core.cancel_join(serial);
        net.tick(1, 3);
        assert!(net.nodes[1].core.outbound.contains_key(&serial));
        assert_eq!(net.take_join(1, serial), None);
    }

    #[test]
    fn pings_complete_once() {
        let mut net = Net::with_names(&["a", "b"]);
        let (ab, _) = net.connect(0, 1);

        let (serial, actions) = net.nodes[0].core.ping("b").unwrap();
        net.run(0, actions);
        assert_eq!(net.take_ping(0, serial), Some(Ok(())));
        assert_eq!(net.take_ping(0, serial), None);

        // this attachment answers for itself without touching the network
        let (serial, actions) = net.nodes[0].core.ping("a").unwrap();
        assert!(!actions.iter().any(|a| matches!(a, Action::Send(..))));
        net.run(0, actions);
        assert_eq!(net.take_ping(0, serial), Some(Ok(())));
        assert_eq!(net.nodes[0].core.ping("nobody").unwrap_err(), Status::Unreachable);

        // request never delivered
        let (serial, _) = net.nodes[0].core.ping("b").unwrap();
        net.tick(0, 10);
        assert_eq!(net.take_ping(0, serial), None);
        net.tick(0, 1);
        assert_eq!(net.take_ping(0, serial), Some(Err(Status::Timeout)));

        let (serial, _) = net.nodes[0].core.ping("b").unwrap();
        net.kill(0, ab);
        assert_eq!(net.take_ping(0, serial), Some(Err(Status::EndpointClosed)));
    }

    #[test]
    fn owners_and_peer_guids_resolve_through_endpoints() {
        let mut net = Net::with_names(&["router", "leaf"]);
        let (_, at_router) = net.connect(1, 0);
        net.nodes[0]
            .core
            .request_name("com.example.Router", NameFlags::NONE)
            .unwrap();
        let claim = Frame::control(
            1,
            &Message::RequestName {
                serial: 1,
                name: "com.example.Leaf".into(),
                flags: NameFlags::NONE,
            },
        )
        .unwrap();
        let actions = net.nodes[0].core.on_frame(at_router, claim);
        net.run(0, actions);

        let leaf_guid = net.nodes[1].core.guid();
        let core = &net.nodes[0].core;
        assert_eq!(core.name_owner("com.example.Leaf"), Some(UniqueName::new("leaf")));
        assert_eq!(core.name_owner("leaf"), Some(UniqueName::new("leaf")));
        assert_eq!(core.name_owner("com.example.Router"), Some(UniqueName::new("router")));
        assert_eq!(core.name_owner("com.example.Nobody"), None);
        assert_eq!(core.peer_guid("com.example.Leaf"), Ok(leaf_guid));
        assert_eq!(core.peer_guid("com.example.Router"), Ok(core.guid()));
        assert_eq!(core.peer_guid("com.example.Nobody"), Err(Status::Unreachable));

        let (serial, actions) = net.nodes[0].core.ping("com.example.Leaf").unwrap();
        net.run(0, actions);
        assert_eq!(net.take_ping(0, serial), Some(Ok(())));
    }

    #[test]
    fn join_through_discovery_dials_then_sends() {
        let mut net = Net::with_names(&["host", "joiner"]);
        net.nodes[0].core.bind_session_port(42, SessionOpts::default()).unwrap();
        let guid = net.nodes[0].core.guid();
        net.nodes[1].core.on_remote_advertisement(
            guid,
            "tcp:addr=127.0.0.1,port=9955",
            TransportMask::TCP,
            vec!["com.example.Svc".into()],
        );
        let (serial, actions) = net.nodes[1]
            .core
            .join_session("com.example.Svc", 42, SessionOpts::default())
            .unwrap();
        assert!(matches!(
            actions.as_slice(),
            [Action::Connect { guid: g, .. }] if *g == guid
        ));
        net.run(1, actions);
        net.connect(0, 1);
        let (id, _) = net.take_join(1, serial).unwrap().unwrap();
        assert_eq!(id.host_short_id(), guid.short_id());
    }

    #[test]
    fn failed_dial_fails_parked_join() {
        let mut net = Net::with_names(&["joiner"]);
        let guid = NodeGuid::generate();
        net.nodes[0]
            .core
            .on_remote_advertisement(guid, "tcp:addr=10.9.9.9,port=1", TransportMask::TCP, vec!["com.example.Gone".into()]);
        let (serial, _) = net.nodes[0]
            .core
            .join_session("com.example.Gone", 1, SessionOpts::default())
            .unwrap();
        let actions = net.nodes[0].core.on_connect_failed(guid);
        net.run(0, actions);
        assert_eq!(net.take_join(0, serial), Some(Err(Status::ConnectFailed)));
    }

    #[test]
    fn own_name_is_self_join() {
        let mut net = Net::with_names(&["me"]);
        net.nodes[0]
            .core
            .request_name("com.example.Me", NameFlags::NONE)
            .unwrap();
        assert_eq!(
            net.nodes[0]
                .core
                .join_session("com.example.Me", 1, SessionOpts::default())
                .unwrap_err(),
            Status::SelfJoin
        );
    }

    #[test]
    fn remote_name_requests_conflict() {
        let mut net = Net::with_names(&["router", "leaf1", "leaf2"]);
        let (_, ep1) = net.connect(1, 0);
        let (_, ep2) = net.connect(2, 0);
        let request = |serial| {
            Frame::control(
                serial,
                &Message::RequestName {
                    serial,
                    name: "com.example.X".into(),
                    flags: NameFlags::NONE,
                },
            )
            .unwrap()
        };
        let reply_of = |actions: Vec<Action>| {
            actions.into_iter().find_map(|a| match a {
                Action::Send(_, f) => match f.message().unwrap() {
                    Message::RequestNameReply { result, .. } => Some(result),
                    _ => None,
                },
                _ => None,
            })
        };
        let first = net.nodes[0].core.on_frame(ep1, request(1));
        assert!(first.iter().any(|a| matches!(a, Action::Event(BusEvent::NameOwnerChanged { .. }))));
        assert_eq!(reply_of(first), Some(Ok(RequestNameReply::PrimaryOwner)));
        let second = net.nodes[0].core.on_frame(ep2, request(2));
        assert_eq!(reply_of(second), Some(Err(Status::NameInUse)));
        assert_eq!(net.nodes[0].core.names().owner("com.example.X"), Some(&UniqueName::new("leaf1")));

        // the owner's endpoint going away releases the name
        let actions = net.nodes[0].core.on_endpoint_closed(ep1, CloseCause::Disconnected);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Event(BusEvent::NameOwnerChanged { new: None, .. })
        )));
        assert!(net.nodes[0].core.names().owner("com.example.X").is_none());
    }

    #[test]
    fn silent_endpoint_times_out() {
        let mut net = Net::with_names(&["host", "joiner"]);
        net.connect(1, 0);
        net.nodes[0].core.bind_session_port(42, SessionOpts::default()).unwrap();
        let (s, _) = net.join(1, "host", 42, SessionOpts::default()).unwrap();
        assert_eq!(net.nodes[0].core.set_link_timeout(s, 12), Ok(12));
        assert_eq!(net.nodes[0].core.set_link_timeout(s, 1), Ok(10));
        net.events(0);

        net.tick(0, 10);
        assert!(lost(&net.events(0)).is_empty());
        net.tick(0, 1);
        assert_eq!(lost(&net.events(0)), vec![(s, SessionLostReason::LinkTimeout)]);
        assert_eq!(lost(&net.events(1)), vec![(s, SessionLostReason::RemoteEndClosedAbruptly)]);
    }

    #[test]
    fn dynamic_ports_and_unbind() {
        let mut core = SessionMultiplexer::new(NodeGuid::generate(), CoreConfig::default());
        let a = core.bind_session_port(SESSION_PORT_ANY, SessionOpts::default()).unwrap();
        let b = core.bind_session_port(SESSION_PORT_ANY, SessionOpts::default()).unwrap();
        assert_eq!((a, b), (0x8000, 0x8001));
        core.bind_session_port(42, SessionOpts::default()).unwrap();
        assert_eq!(
            core.bind_session_port(42, SessionOpts::default()),
            Err(Status::PortAlreadyBound)
        );
        core.unbind_session_port(42).unwrap();
        assert_eq!(core.unbind_session_port(42), Err(Status::NoSuchPort));
    }

    #[test]
    fn remote_advertisements_expire() {
        let mut net = Net::with_names(&["watcher"]);
        net.nodes[0]
            .core
            .find_advertised_name("com.example", TransportMask::ANY)
            .unwrap();
        let actions = net.nodes[0].core.on_remote_advertisement(
            NodeGuid::generate(),
            "tcp:addr=10.0.0.3,port=9955",
            TransportMask::TCP,
            vec!["com.example.Printer".into()],
        );
        assert!(matches!(
            actions.as_slice(),
            [Action::Event(BusEvent::FoundAdvertisedName { name, .. })] if name == "com.example.Printer"
        ));
        net.tick(0, 20);
        assert!(net.events(0).is_empty());
        net.tick(0, 1);
        assert!(matches!(
            net.events(0).as_slice(),
            [BusEvent::LostAdvertisedName { name, .. }] if name == "com.example.Printer"
        ));
    }
}
