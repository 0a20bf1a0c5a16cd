//! Bus attachment: the context object every operation goes through.
//!
//! One actor task owns the [`SessionMultiplexer`]; API calls, endpoint frames, discovery
//! reports and ticks reach it over channels. Listener callbacks run on a separate dispatcher
//! task, so a callback may call back into the bus (from a spawned task) without deadlocking.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use peerbus_core::interface::InterfaceRegistry;
use peerbus_core::{
    Action, BusEvent, EndpointId, InterfaceBuilder, InterfaceDescription, JoinRequestId, NameFlags,
    NodeGuid, ReleaseNameReply, RequestNameReply, SessionId, SessionLostReason, SessionMultiplexer, SessionOpts,
    SessionPort, Status, TransportMask, UniqueName,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::discovery::{beacon_names, run_discovery, DiscoveryReport, DiscoverySettings};
use crate::endpoint::{handshake, Endpoint, EndpointError, EndpointEvent, PeerHello};
use crate::listener::{BusListener, SessionListener, SessionPortListener};
use crate::transport::{driver_for, AutoAccept, BoxedStream, BusAddress, ConnectionApproval, TransportListener};

/// One message received on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMessage {
    pub sender: UniqueName,
    pub serial: u32,
    pub body: Vec<u8>,
}

type Reply<T> = oneshot::Sender<Result<T, Status>>;

enum Command {
    BindPort {
        port: SessionPort,
        opts: SessionOpts,
        listener: Arc<dyn SessionPortListener>,
        reply: Reply<SessionPort>,
    },
    UnbindPort {
        port: SessionPort,
        reply: Reply<()>,
    },
    Join {
        name: String,
        port: SessionPort,
        opts: SessionOpts,
        listener: Option<Arc<dyn SessionListener>>,
        reply: Reply<(SessionId, SessionOpts)>,
    },
    AcceptDecision {
        request: JoinRequestId,
        accept: bool,
    },
    Leave {
        id: SessionId,
        reply: Reply<()>,
    },
    RemoveMember {
        id: SessionId,
        member: UniqueName,
        reply: Reply<()>,
    },
    SetLinkTimeout {
        id: SessionId,
        secs: u64,
        reply: Reply<u64>,
    },
    Send {
        id: SessionId,
        body: Vec<u8>,
        reply: Reply<()>,
    },
    TakeReceiver {
        id: SessionId,
        reply: Reply<mpsc::UnboundedReceiver<SessionMessage>>,
    },
    SetSessionListener {
        id: SessionId,
        listener: Arc<dyn SessionListener>,
        reply: Reply<()>,
    },
    RegisterBusListener(Arc<dyn BusListener>),
    RequestName {
        name: String,
        flags: NameFlags,
        reply: Reply<RequestNameReply>,
    },
    ReleaseName {
        name: String,
        reply: Reply<ReleaseNameReply>,
    },
    Advertise {
        name: String,
        transports: TransportMask,
        reply: Reply<()>,
    },
    CancelAdvertise {
        name: String,
        transports: TransportMask,
        reply: Reply<()>,
    },
    Find {
        prefix: String,
        transports: TransportMask,
        reply: Reply<()>,
    },
    CancelFind {
        prefix: String,
        reply: Reply<()>,
    },
    NameOwner {
        name: String,
        reply: Reply<Option<UniqueName>>,
    },
    PeerGuid {
        name: String,
        reply: Reply<NodeGuid>,
    },
    Ping {
        name: String,
        reply: Reply<()>,
    },
    Connect {
        address: BusAddress,
        reply: Reply<UniqueName>,
    },
    EndpointUp {
        stream: BoxedStream,
        peer: PeerHello,
        leftover: Vec<u8>,
        transport: TransportMask,
        expected: Option<NodeGuid>,
        reply: Option<Reply<UniqueName>>,
    },
    DialFailed {
        guid: Option<NodeGuid>,
        reply: Option<Reply<UniqueName>>,
    },
    Discovered(DiscoveryReport),
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Work for the dispatcher task.
enum Dispatch {
    Accept {
        listener: Arc<dyn SessionPortListener>,
        request: JoinRequestId,
        port: SessionPort,
        joiner: UniqueName,
        opts: SessionOpts,
    },
    Joined {
        listener: Arc<dyn SessionPortListener>,
        port: SessionPort,
        id: SessionId,
        joiner: UniqueName,
    },
    Lost {
        listener: Arc<dyn SessionListener>,
        id: SessionId,
        reason: SessionLostReason,
    },
    MemberAdded {
        listener: Arc<dyn SessionListener>,
        id: SessionId,
        member: UniqueName,
    },
    MemberRemoved {
        listener: Arc<dyn SessionListener>,
        id: SessionId,
        member: UniqueName,
    },
    Bus {
        listeners: Vec<Arc<dyn BusListener>>,
        event: BusEvent,
    },
    Stopping {
        listeners: Vec<Arc<dyn BusListener>>,
    },
}

#[derive(Debug, Clone)]
struct LocalIdentity {
    guid: NodeGuid,
    unique_name: UniqueName,
}

/// Builds and starts a [`BusAttachment`].
pub struct BusAttachmentBuilder {
    config: Config,
    approval: Arc<dyn ConnectionApproval>,
    guid: Option<NodeGuid>,
}

impl BusAttachmentBuilder {
    /// Platform hook for inbound connections. Defaults to [`AutoAccept`].
    pub fn connection_approval(mut self, approval: Arc<dyn ConnectionApproval>) -> Self {
        self.approval = approval;
        self
    }

    pub fn guid(mut self, guid: NodeGuid) -> Self {
        self.guid = Some(guid);
        self
    }

    /// Bind listeners, start discovery and the actor. Fails with `Fail` when a listen
    /// address is malformed or cannot be bound.
    pub async fn start(self) -> Result<BusAttachment, Status> {
        let guid = self.guid.unwrap_or_else(NodeGuid::generate);
        let local = LocalIdentity {
            guid,
            unique_name: guid.unique_name(1),
        };
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (endpoint_tx, endpoint_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (adverts_tx, adverts_rx) = watch::channel(Vec::new());

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut listen_addrs = Vec::new();
        for text in &self.config.listen {
            let (listener, mask) = match bind_listener(text).await {
                Ok(bound) => bound,
                Err(status) => {
                    tasks.iter().for_each(JoinHandle::abort);
                    return Err(status);
                }
            };
            let address = listener.local_address();
            tracing::info!(%address, "listening");
            listen_addrs.push(address);
            tasks.push(tokio::spawn(accept_loop(
                listener,
                mask,
                self.approval.clone(),
                local.clone(),
                self.config.handshake_timeout(),
                commands_tx.clone(),
            )));
        }

        if self.config.discovery_enabled {
            let tcp_port = listen_addrs.iter().find_map(|a| match a {
                BusAddress::Tcp(s) => Some(s.port()),
                #[allow(unreachable_patterns)]
                _ => None,
            });
            match tcp_port {
                Some(listen_port) => {
                    let settings = DiscoverySettings {
                        guid,
                        port: self.config.discovery_port,
                        group: self.config.multicast_group,
                        interval: self.config.beacon_interval(),
                        ttl: std::time::Duration::from_secs(self.config.advertisement_ttl_secs),
                        listen_port,
                    };
                    let (report_tx, mut report_rx) = mpsc::unbounded_channel();
                    tasks.push(tokio::spawn(async move {
                        if let Err(e) = run_discovery(settings, adverts_rx, report_tx).await {
                            tracing::warn!(error = %e, "discovery unavailable");
                        }
                    }));
                    let forward = commands_tx.clone();
                    tasks.push(tokio::spawn(async move {
                        while let Some(report) = report_rx.recv().await {
                            if forward.send(Command::Discovered(report)).is_err() {
                                break;
                            }
                        }
                    }));
                }
                None => tracing::warn!("discovery needs a tcp listen address, disabled"),
            }
        }

        let core = SessionMultiplexer::with_identity(guid, local.unique_name.clone(), self.config.core_config());
        let actor = BusActor {
            core,
            config: self.config,
            local: local.clone(),
            endpoints: HashMap::new(),
            next_endpoint: 0,
            joins: HashMap::new(),
            pings: HashMap::new(),
            port_listeners: HashMap::new(),
            session_listeners: HashMap::new(),
            queues: HashMap::new(),
            bus_listeners: Vec::new(),
            dispatch: dispatch_tx,
            endpoint_events: endpoint_tx,
            commands: commands_tx.clone(),
            adverts: adverts_tx,
        };
        tokio::spawn(actor.run(commands_rx, endpoint_rx));
        tokio::spawn(dispatch_loop(dispatch_rx, commands_tx.clone()));
        tracing::info!(guid = %local.guid, name = %local.unique_name, "bus attachment started");

        Ok(BusAttachment {
            inner: Arc::new(Inner {
                local,
                commands: commands_tx,
                listen_addrs,
                interfaces: Mutex::new(InterfaceRegistry::new()),
                tasks: Mutex::new(tasks),
            }),
        })
    }
}

async fn bind_listener(text: &str) -> Result<(Box<dyn TransportListener>, TransportMask), Status> {
    let address: BusAddress = text.parse().map_err(|e| {
        tracing::warn!(address = text, error = %e, "bad listen address");
        Status::Fail
    })?;
    let driver = driver_for(&address);
    let listener = driver.listen(&address).await.map_err(|e| {
        tracing::warn!(%address, error = %e, "cannot listen");
        Status::Fail
    })?;
    Ok((listener, driver.mask()))
}

struct Inner {
    local: LocalIdentity,
    commands: mpsc::UnboundedSender<Command>,
    listen_addrs: Vec<BusAddress>,
    interfaces: Mutex<InterfaceRegistry>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for t in tasks.drain(..) {
                t.abort();
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.abort_tasks();
        let (reply, _) = oneshot::channel();
        let _ = self.commands.send(Command::Stop { reply });
    }
}

/// Handle to a running bus attachment. Cheap to clone.
#[derive(Clone)]
pub struct BusAttachment {
    inner: Arc<Inner>,
}

impl BusAttachment {
    pub fn builder(config: Config) -> BusAttachmentBuilder {
        BusAttachmentBuilder {
            config,
            approval: Arc::new(AutoAccept),
            guid: None,
        }
    }

    pub fn guid(&self) -> NodeGuid {
        self.inner.local.guid
    }

    pub fn unique_name(&self) -> &UniqueName {
        &self.inner.local.unique_name
    }

    /// Bound listen addresses, with any port 0 resolved.
    pub fn listen_addresses(&self) -> &[BusAddress] {
        &self.inner.listen_addrs
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, Status> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send(make(tx))
            .map_err(|_| Status::BusStopped)?;
        rx.await.map_err(|_| Status::BusStopped)?
    }

    /// Bind `port` (`SESSION_PORT_ANY` picks one) with `listener` as accept policy.
    pub async fn bind_session_port(
        &self,
        port: SessionPort,
        opts: SessionOpts,
        listener: Arc<dyn SessionPortListener>,
    ) -> Result<SessionPort, Status> {
        self.call(|reply| Command::BindPort {
            port,
            opts,
            listener,
            reply,
        })
        .await
    }

    pub async fn unbind_session_port(&self, port: SessionPort) -> Result<(), Status> {
        self.call(|reply| Command::UnbindPort { port, reply }).await
    }

    /// Join the session bound on `port` by whoever owns or advertises `name`.
    pub async fn join_session(
        &self,
        name: &str,
        port: SessionPort,
        opts: SessionOpts,
        listener: Option<Arc<dyn SessionListener>>,
    ) -> Result<(SessionId, SessionOpts), Status> {
        self.call(|reply| Command::Join {
            name: name.to_string(),
            port,
            opts,
            listener,
            reply,
        })
        .await
    }

    pub async fn leave_session(&self, id: SessionId) -> Result<(), Status> {
        self.call(|reply| Command::Leave { id, reply }).await
    }

    pub async fn remove_session_member(&self, id: SessionId, member: &UniqueName) -> Result<(), Status> {
        self.call(|reply| Command::RemoveMember {
            id,
            member: member.clone(),
            reply,
        })
        .await
    }

    /// Returns the effective timeout in seconds. 0 restores the default.
    pub async fn set_link_timeout(&self, id: SessionId, secs: u64) -> Result<u64, Status> {
        self.call(|reply| Command::SetLinkTimeout { id, secs, reply }).await
    }

    pub async fn send(&self, id: SessionId, body: Vec<u8>) -> Result<(), Status> {
        self.call(|reply| Command::Send { id, body, reply }).await
    }

    /// Messages received on `id`, in order per sender. Can be claimed once per session.
    pub async fn session_receiver(&self, id: SessionId) -> Result<mpsc::UnboundedReceiver<SessionMessage>, Status> {
        self.call(|reply| Command::TakeReceiver { id, reply }).await
    }

    pub async fn set_session_listener(&self, id: SessionId, listener: Arc<dyn SessionListener>) -> Result<(), Status> {
        self.call(|reply| Command::SetSessionListener { id, listener, reply })
            .await
    }

    pub fn register_bus_listener(&self, listener: Arc<dyn BusListener>) -> Result<(), Status> {
        self.inner
            .commands
            .send(Command::RegisterBusListener(listener))
            .map_err(|_| Status::BusStopped)
    }

    pub async fn request_name(&self, name: &str, flags: NameFlags) -> Result<RequestNameReply, Status> {
        self.call(|reply| Command::RequestName {
            name: name.to_string(),
            flags,
            reply,
        })
        .await
    }

    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply, Status> {
        self.call(|reply| Command::ReleaseName {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn advertise_name(&self, name: &str, transports: TransportMask) -> Result<(), Status> {
        self.call(|reply| Command::Advertise {
            name: name.to_string(),
            transports,
            reply,
        })
        .await
    }

    pub async fn cancel_advertise_name(&self, name: &str, transports: TransportMask) -> Result<(), Status> {
        self.call(|reply| Command::CancelAdvertise {
            name: name.to_string(),
            transports,
            reply,
        })
        .await
    }

    pub async fn find_advertised_name(&self, prefix: &str, transports: TransportMask) -> Result<(), Status> {
        self.call(|reply| Command::Find {
            prefix: prefix.to_string(),
            transports,
            reply,
        })
        .await
    }

    pub async fn cancel_find_advertised_name(&self, prefix: &str) -> Result<(), Status> {
        self.call(|reply| Command::CancelFind {
            prefix: prefix.to_string(),
            reply,
        })
        .await
    }

    /// Unique name that currently owns `name`, as far as this attachment knows.
    pub async fn get_name_owner(&self, name: &str) -> Result<Option<UniqueName>, Status> {
        self.call(|reply| Command::NameOwner {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn name_has_owner(&self, name: &str) -> Result<bool, Status> {
        Ok(self.get_name_owner(name).await?.is_some())
    }

    /// Guid of the node hosting `name`. Only names on this node or a connected peer resolve.
    pub async fn get_peer_guid(&self, name: &str) -> Result<NodeGuid, Status> {
        self.call(|reply| Command::PeerGuid {
            name: name.to_string(),
            reply,
        })
        .await
    }

    /// Round trip to the node behind `name`. Fails with `Timeout` when no answer arrives
    /// within the join timeout.
    pub async fn ping(&self, name: &str) -> Result<(), Status> {
        self.call(|reply| Command::Ping {
            name: name.to_string(),
            reply,
        })
        .await
    }

    /// Dial a bus address directly. Returns the peer's unique name once the hello exchange
    /// completed.
    pub async fn connect(&self, address: &str) -> Result<UniqueName, Status> {
        let address: BusAddress = address.parse().map_err(|_| Status::Fail)?;
        self.call(|reply| Command::Connect { address, reply }).await
    }

    pub fn create_interface(&self, builder: InterfaceBuilder) -> Result<Arc<InterfaceDescription>, Status> {
        let desc = builder.build().map_err(|e| {
            tracing::debug!(error = %e, "interface rejected");
            Status::from(e)
        })?;
        let mut interfaces = self.inner.interfaces.lock().map_err(|_| Status::Fail)?;
        interfaces.register(desc)
    }

    pub fn interface(&self, name: &str) -> Option<Arc<InterfaceDescription>> {
        self.inner.interfaces.lock().ok().and_then(|i| i.get(name))
    }

    /// Leave every session, close every endpoint and stop background tasks. Later calls
    /// fail with `BusStopped`.
    pub async fn stop(&self) -> Result<(), Status> {
        self.inner.abort_tasks();
        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Stop { reply: tx })
            .map_err(|_| Status::BusStopped)?;
        rx.await.map_err(|_| Status::BusStopped)
    }
}

async fn accept_loop(
    mut listener: Box<dyn TransportListener>,
    mask: TransportMask,
    approval: Arc<dyn ConnectionApproval>,
    local: LocalIdentity,
    timeout: std::time::Duration,
    commands: mpsc::UnboundedSender<Command>,
) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed, listener stopped");
                break;
            }
        };
        if !approval.approve(mask, &peer) {
            tracing::info!(%peer, "inbound connection not approved");
            continue;
        }
        let commands = commands.clone();
        let local = local.clone();
        tokio::spawn(async move {
            match handshake(&mut stream, local.guid, &local.unique_name, timeout).await {
                Ok((hello, leftover)) => {
                    let _ = commands.send(Command::EndpointUp {
                        stream,
                        peer: hello,
                        leftover,
                        transport: mask,
                        expected: None,
                        reply: None,
                    });
                }
                Err(e) => tracing::warn!(%peer, error = %e, "inbound handshake failed"),
            }
        });
    }
}

async fn dial(
    address: &BusAddress,
    local: &LocalIdentity,
    timeout: std::time::Duration,
) -> Result<(BoxedStream, PeerHello, Vec<u8>), EndpointError> {
    let driver = driver_for(address);
    let mut stream = driver.connect(address).await?;
    let (peer, leftover) = handshake(&mut stream, local.guid, &local.unique_name, timeout).await?;
    Ok((stream, peer, leftover))
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Dispatch>, commands: mpsc::UnboundedSender<Command>) {
    while let Some(work) = rx.recv().await {
        match work {
            Dispatch::Accept {
                listener,
                request,
                port,
                joiner,
                opts,
            } => {
                let accept = listener.accept_session_joiner(port, &joiner, &opts);
                tracing::debug!(port, %joiner, accept, "accept policy");
                if commands.send(Command::AcceptDecision { request, accept }).is_err() {
                    break;
                }
            }
            Dispatch::Joined {
                listener,
                port,
                id,
                joiner,
            } => listener.session_joined(port, id, &joiner),
            Dispatch::Lost { listener, id, reason } => listener.session_lost(id, reason),
            Dispatch::MemberAdded { listener, id, member } => listener.session_member_added(id, &member),
            Dispatch::MemberRemoved { listener, id, member } => listener.session_member_removed(id, &member),
            Dispatch::Bus { listeners, event } => {
                for l in &listeners {
                    match &event {
                        BusEvent::FoundAdvertisedName {
                            name,
                            transport,
                            prefix,
                        } => l.found_advertised_name(name, *transport, prefix),
                        BusEvent::LostAdvertisedName {
                            name,
                            transport,
                            prefix,
                        } => l.lost_advertised_name(name, *transport, prefix),
                        BusEvent::NameOwnerChanged { name, previous, new } => {
                            l.name_owner_changed(name, previous.as_ref(), new.as_ref())
                        }
                        _ => {}
                    }
                }
            }
            Dispatch::Stopping { listeners } => {
                for l in &listeners {
                    l.bus_stopping();
                }
            }
        }
    }
}

struct SessionQueue {
    tx: mpsc::UnboundedSender<SessionMessage>,
    rx: Option<mpsc::UnboundedReceiver<SessionMessage>>,
}

struct PendingJoin {
    reply: Reply<(SessionId, SessionOpts)>,
    listener: Option<Arc<dyn SessionListener>>,
}

enum Next {
    Continue,
    Stop(Option<oneshot::Sender<()>>),
}

/// Owns the multiplexer and everything keyed by its ids.
struct BusActor {
    core: SessionMultiplexer,
    config: Config,
    local: LocalIdentity,
    endpoints: HashMap<EndpointId, Endpoint>,
    next_endpoint: u64,
    joins: HashMap<u32, PendingJoin>,
    pings: HashMap<u32, Reply<()>>,
    port_listeners: HashMap<SessionPort, Arc<dyn SessionPortListener>>,
    session_listeners: HashMap<SessionId, Arc<dyn SessionListener>>,
    queues: HashMap<SessionId, SessionQueue>,
    bus_listeners: Vec<Arc<dyn BusListener>>,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    endpoint_events: mpsc::UnboundedSender<EndpointEvent>,
    commands: mpsc::UnboundedSender<Command>,
    adverts: watch::Sender<Vec<String>>,
}

impl BusActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut endpoint_events: mpsc::UnboundedReceiver<EndpointEvent>,
    ) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let next = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Stop { reply }) => Next::Stop(Some(reply)),
                    Some(cmd) => {
                        self.on_command(cmd);
                        Next::Continue
                    }
                    None => Next::Stop(None),
                },
                Some(event) = endpoint_events.recv() => {
                    self.on_endpoint_event(event);
                    Next::Continue
                }
                _ = ticker.tick() => {
                    self.on_tick();
                    Next::Continue
                }
            };
            if let Next::Stop(reply) = next {
                self.shutdown();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                break;
            }
        }
        tracing::info!(name = %self.local.unique_name, "bus attachment stopped");
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::BindPort {
                port,
                opts,
                listener,
                reply,
            } => {
                let result = self.core.bind_session_port(port, opts);
                if let Ok(bound) = result {
                    self.port_listeners.insert(bound, listener);
                }
                let _ = reply.send(result);
            }
            Command::UnbindPort { port, reply } => {
                let result = self.core.unbind_session_port(port);
                if result.is_ok() {
                    self.port_listeners.remove(&port);
                }
                let _ = reply.send(result);
            }
            Command::Join {
                name,
                port,
                opts,
                listener,
                reply,
            } => match self.core.join_session(&name, port, opts) {
                Ok((serial, actions)) => {
                    self.joins.insert(serial, PendingJoin { reply, listener });
                    self.apply(actions);
                }
                Err(status) => {
                    let _ = reply.send(Err(status));
                }
            },
            Command::AcceptDecision { request, accept } => {
                let actions = self.core.on_accept_decision(request, accept);
                self.apply(actions);
            }
            Command::Leave { id, reply } => {
                let result = self.core.leave_session(id).map(|actions| {
                    self.forget_session(id);
                    self.apply(actions);
                });
                let _ = reply.send(result);
            }
            Command::RemoveMember { id, member, reply } => {
                let result = self
                    .core
                    .remove_session_member(id, &member)
                    .map(|actions| self.apply(actions));
                let _ = reply.send(result);
            }
            Command::SetLinkTimeout { id, secs, reply } => {
                let ticks = if secs == 0 { 0 } else { self.config.secs_to_ticks(secs) };
                let result = self
                    .core
                    .set_link_timeout(id, ticks)
                    .map(|t| self.config.ticks_to_secs(t));
                let _ = reply.send(result);
            }
            Command::Send { id, body, reply } => {
                let result = self.core.send_on_session(id, body).map(|actions| self.apply(actions));
                let _ = reply.send(result);
            }
            Command::TakeReceiver { id, reply } => {
                let result = match self.queues.get_mut(&id) {
                    Some(q) => q.rx.take().ok_or(Status::Fail),
                    None => Err(Status::NoSession),
                };
                let _ = reply.send(result);
            }
            Command::SetSessionListener { id, listener, reply } => {
                let result = match self.core.session(id) {
                    Some(_) => {
                        self.session_listeners.insert(id, listener);
                        Ok(())
                    }
                    None => Err(Status::NoSession),
                };
                let _ = reply.send(result);
            }
            Command::RegisterBusListener(listener) => self.bus_listeners.push(listener),
            Command::RequestName { name, flags, reply } => {
                let result = self
                    .core
                    .request_name(&name, flags)
                    .map(|(r, actions)| {
                        self.apply(actions);
                        r
                    });
                let _ = reply.send(result);
            }
            Command::ReleaseName { name, reply } => {
                let result = self.core.release_name(&name).map(|(r, actions)| {
                    self.apply(actions);
                    r
                });
                let _ = reply.send(result);
            }
            Command::Advertise {
                name,
                transports,
                reply,
            } => {
                let result = self
                    .core
                    .advertise_name(&name, transports)
                    .map(|actions| self.apply(actions));
                self.publish_adverts();
                let _ = reply.send(result);
            }
            Command::CancelAdvertise {
                name,
                transports,
                reply,
            } => {
                let result = self
                    .core
                    .cancel_advertise_name(&name, transports)
                    .map(|actions| self.apply(actions));
                self.publish_adverts();
                let _ = reply.send(result);
            }
            Command::Find {
                prefix,
                transports,
                reply,
            } => {
                let result = self
                    .core
                    .find_advertised_name(&prefix, transports)
                    .map(|actions| self.apply(actions));
                let _ = reply.send(result);
            }
            Command::CancelFind { prefix, reply } => {
                let _ = reply.send(self.core.cancel_find_advertised_name(&prefix));
            }
            Command::NameOwner { name, reply } => {
                let _ = reply.send(Ok(self.core.name_owner(&name)));
            }
            Command::PeerGuid { name, reply } => {
                let _ = reply.send(self.core.peer_guid(&name));
            }
            Command::Ping { name, reply } => match self.core.ping(&name) {
                Ok((serial, actions)) => {
                    self.pings.insert(serial, reply);
                    self.apply(actions);
                }
                Err(status) => {
                    let _ = reply.send(Err(status));
                }
            },
            Command::Connect { address, reply } => self.spawn_dial(address, None, Some(reply)),
            Command::EndpointUp {
                stream,
                peer,
                leftover,
                transport,
                expected,
                reply,
            } => self.on_endpoint_up(stream, peer, leftover, transport, expected, reply),
            Command::DialFailed { guid, reply } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(Status::ConnectFailed));
                }
                if let Some(guid) = guid {
                    let actions = self.core.on_connect_failed(guid);
                    self.apply(actions);
                }
            }
            Command::Discovered(report) => {
                let actions = self.core.on_remote_advertisement(
                    report.guid,
                    &report.address.to_string(),
                    report.transports,
                    report.names,
                );
                self.apply(actions);
            }
            // handled by the run loop
            Command::Stop { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn on_endpoint_up(
        &mut self,
        stream: BoxedStream,
        peer: PeerHello,
        leftover: Vec<u8>,
        transport: TransportMask,
        expected: Option<NodeGuid>,
        reply: Option<Reply<UniqueName>>,
    ) {
        self.next_endpoint += 1;
        let id = EndpointId(self.next_endpoint);
        let endpoint = Endpoint::spawn(id, stream, peer, leftover, self.endpoint_events.clone());
        let guid = endpoint.peer().guid;
        let name = endpoint.peer().unique_name.clone();
        self.endpoints.insert(id, endpoint);
        tracing::info!(%id, %guid, peer = %name, "endpoint up");
        let actions = self.core.on_endpoint_connected(id, guid, name.clone(), transport);
        self.apply(actions);
        if let Some(expected) = expected.filter(|g| *g != guid) {
            tracing::warn!(%expected, %guid, "dialed node answered with another guid");
            let actions = self.core.on_connect_failed(expected);
            self.apply(actions);
        }
        if let Some(reply) = reply {
            let _ = reply.send(Ok(name));
        }
    }

    fn on_endpoint_event(&mut self, event: EndpointEvent) {
        match event {
            EndpointEvent::Frame(id, frame) => {
                if self.endpoints.contains_key(&id) {
                    let actions = self.core.on_frame(id, frame);
                    self.apply(actions);
                }
            }
            EndpointEvent::Closed(id, cause) => {
                if self.endpoints.remove(&id).is_some() {
                    tracing::info!(%id, ?cause, "endpoint down");
                    let actions = self.core.on_endpoint_closed(id, cause);
                    self.apply(actions);
                }
            }
        }
    }

    fn on_tick(&mut self) {
        let abandoned: Vec<u32> = self
            .joins
            .iter()
            .filter(|(_, j)| j.reply.is_closed())
            .map(|(s, _)| *s)
            .collect();
        for serial in abandoned {
            self.joins.remove(&serial);
            let actions = self.core.cancel_join(serial);
            self.apply(actions);
        }
        let actions = self.core.tick();
        self.apply(actions);
    }

    fn shutdown(&mut self) {
        let actions = self.core.shutdown();
        self.apply(actions);
        for (_, pending) in self.joins.drain() {
            let _ = pending.reply.send(Err(Status::BusStopped));
        }
        for (_, reply) in self.pings.drain() {
            let _ = reply.send(Err(Status::BusStopped));
        }
        for (_, endpoint) in self.endpoints.drain() {
            endpoint.close();
        }
        self.queues.clear();
        self.adverts.send_replace(Vec::new());
        if !self.bus_listeners.is_empty() {
            let _ = self.dispatch.send(Dispatch::Stopping {
                listeners: self.bus_listeners.clone(),
            });
        }
    }

    fn spawn_dial(&self, address: BusAddress, guid: Option<NodeGuid>, reply: Option<Reply<UniqueName>>) {
        let local = self.local.clone();
        let timeout = self.config.handshake_timeout();
        let commands = self.commands.clone();
        let transport = address.transport();
        tokio::spawn(async move {
            match dial(&address, &local, timeout).await {
                Ok((stream, peer, leftover)) => {
                    let _ = commands.send(Command::EndpointUp {
                        stream,
                        peer,
                        leftover,
                        transport,
                        expected: guid,
                        reply,
                    });
                }
                Err(e) => {
                    tracing::warn!(%address, error = %e, "dial failed");
                    let _ = commands.send(Command::DialFailed { guid, reply });
                }
            }
        });
    }

    fn publish_adverts(&self) {
        let names = beacon_names(self.core.names());
        self.adverts.send_if_modified(|current| {
            if *current == names {
                false
            } else {
                *current = names;
                true
            }
        });
    }

    fn open_queue(&mut self, id: SessionId) {
        self.queues.entry(id).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            SessionQueue { tx, rx: Some(rx) }
        });
    }

    fn forget_session(&mut self, id: SessionId) {
        self.queues.remove(&id);
        self.session_listeners.remove(&id);
    }

    fn apply(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send(ep, frame) => {
                    if let Some(endpoint) = self.endpoints.get(&ep) {
                        if endpoint.send(frame).is_err() {
                            tracing::debug!(%ep, "send on closed endpoint dropped");
                        }
                    }
                }
                Action::Close(ep) => {
                    if let Some(endpoint) = self.endpoints.remove(&ep) {
                        endpoint.close();
                    }
                }
                Action::Connect { guid, address } => match address.parse::<BusAddress>() {
                    Ok(address) => self.spawn_dial(address, Some(guid), None),
                    Err(e) => {
                        tracing::warn!(%address, error = %e, "advertised address unusable");
                        queue.extend(self.core.on_connect_failed(guid));
                    }
                },
                Action::AcceptJoiner {
                    request,
                    port,
                    joiner,
                    opts,
                } => match self.port_listeners.get(&port) {
                    Some(listener) => {
                        let _ = self.dispatch.send(Dispatch::Accept {
                            listener: listener.clone(),
                            request,
                            port,
                            joiner,
                            opts,
                        });
                    }
                    None => queue.extend(self.core.on_accept_decision(request, false)),
                },
                Action::JoinCompleted { serial, result } => self.complete_join(serial, result, &mut queue),
                Action::PingCompleted { serial, result } => {
                    if let Some(reply) = self.pings.remove(&serial) {
                        let _ = reply.send(result);
                    }
                }
                Action::Deliver {
                    session_id,
                    sender,
                    serial,
                    body,
                } => {
                    if let Some(q) = self.queues.get(&session_id) {
                        let _ = q.tx.send(SessionMessage { sender, serial, body });
                    }
                }
                Action::Event(event) => self.on_bus_event(event),
            }
        }
    }

    fn complete_join(
        &mut self,
        serial: u32,
        result: Result<(SessionId, SessionOpts), Status>,
        queue: &mut VecDeque<Action>,
    ) {
        let joined = result.as_ref().ok().map(|(id, _)| *id);
        let Some(pending) = self.joins.remove(&serial) else {
            // nobody is waiting any more
            if let Some(id) = joined {
                if let Ok(actions) = self.core.leave_session(id) {
                    queue.extend(actions);
                }
            }
            return;
        };
        if let Some(id) = joined {
            self.open_queue(id);
            if let Some(listener) = pending.listener {
                self.session_listeners.insert(id, listener);
            }
        }
        if pending.reply.send(result).is_err() {
            if let Some(id) = joined {
                tracing::debug!(%id, "joiner went away, leaving");
                self.forget_session(id);
                if let Ok(actions) = self.core.leave_session(id) {
                    queue.extend(actions);
                }
            }
        }
    }

    fn on_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::SessionJoined {
                port,
                session_id,
                joiner,
            } => {
                self.open_queue(session_id);
                if let Some(listener) = self.port_listeners.get(&port) {
                    let _ = self.dispatch.send(Dispatch::Joined {
                        listener: listener.clone(),
                        port,
                        id: session_id,
                        joiner,
                    });
                }
            }
            BusEvent::SessionLost { session_id, reason } => {
                self.queues.remove(&session_id);
                if let Some(listener) = self.session_listeners.remove(&session_id) {
                    let _ = self.dispatch.send(Dispatch::Lost {
                        listener,
                        id: session_id,
                        reason,
                    });
                }
            }
            BusEvent::SessionMemberAdded { session_id, member } => {
                if let Some(listener) = self.session_listeners.get(&session_id) {
                    let _ = self.dispatch.send(Dispatch::MemberAdded {
                        listener: listener.clone(),
                        id: session_id,
                        member,
                    });
                }
            }
            BusEvent::SessionMemberRemoved { session_id, member } => {
                if let Some(listener) = self.session_listeners.get(&session_id) {
                    let _ = self.dispatch.send(Dispatch::MemberRemoved {
                        listener: listener.clone(),
                        id: session_id,
                        member,
                    });
                }
            }
            event => {
                if !self.bus_listeners.is_empty() {
                    let _ = self.dispatch.send(Dispatch::Bus {
                        listeners: self.bus_listeners.clone(),
                        event,
                    });
                }
            }
        }
    }
}
