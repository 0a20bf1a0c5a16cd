//! LAN discovery: UDP multicast beacons carrying the names this node advertises, and
//! reports of beacons heard from other nodes.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use peerbus_core::names::NameRegistry;
use peerbus_core::{decode_frame, encode_frame, Frame, Message, NodeGuid, TransportMask, PROTOCOL_VERSION};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::transport::BusAddress;

/// One beacon heard from another node: its full advertised name list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub guid: NodeGuid,
    pub address: BusAddress,
    pub transports: TransportMask,
    pub names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub guid: NodeGuid,
    pub port: u16,
    pub group: Ipv4Addr,
    pub interval: Duration,
    /// How long a sender counts as known before it gets a direct reply again.
    pub ttl: Duration,
    /// TCP port other nodes dial to reach us.
    pub listen_port: u16,
}

pub async fn run_discovery(
    settings: DiscoverySettings,
    names: watch::Receiver<Vec<String>>,
    reports: mpsc::UnboundedSender<DiscoveryReport>,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(settings.port, settings.group)?);
    tracing::info!(port = settings.port, group = %settings.group, "discovery started");

    let beacon = tokio::spawn(beacon_loop(socket.clone(), settings.clone(), names.clone()));
    let recv = tokio::spawn(recv_loop(socket, settings, names, reports));
    let (b, r) = tokio::join!(beacon, recv);
    for result in [b, r] {
        if let Ok(Err(e)) = result {
            tracing::warn!(error = %e, "discovery loop ended");
        }
    }
    Ok(())
}

fn make_multicast_socket(port: u16, group: Ipv4Addr) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Transports a beacon offers: peers dial the listen port over TCP.
pub const BEACON_TRANSPORTS: TransportMask = TransportMask::TCP;

/// Advertised names that belong in a beacon. Names advertised only on other
/// transports, such as `LOCAL`, never leave the node.
pub fn beacon_names(names: &NameRegistry) -> Vec<String> {
    names.advertised_names_over(BEACON_TRANSPORTS)
}

/// Encoded advertisement beacon for the current name list.
pub fn beacon_bytes(guid: NodeGuid, listen_port: u16, names: Vec<String>) -> std::io::Result<Vec<u8>> {
    let msg = Message::Advertisement {
        protocol_version: PROTOCOL_VERSION,
        guid,
        listen_port,
        transports: BEACON_TRANSPORTS,
        names,
    };
    let frame = Frame::control(0, &msg).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(encode_frame(&frame))
}

/// Parse a datagram into a report, ignoring our own beacons and other versions.
pub fn parse_beacon(bytes: &[u8], from: SocketAddr, own: NodeGuid) -> Option<DiscoveryReport> {
    let (frame, _) = decode_frame(bytes).ok()?;
    match frame.message().ok()? {
        Message::Advertisement {
            protocol_version,
            guid,
            listen_port,
            transports,
            names,
        } if protocol_version == PROTOCOL_VERSION && guid != own => Some(DiscoveryReport {
            guid,
            address: BusAddress::Tcp(SocketAddr::new(from.ip(), listen_port)),
            transports,
            names,
        }),
        _ => None,
    }
}

/// `interval` plus up to a quarter of it, so nodes started together drift apart.
fn jittered(interval: Duration) -> Duration {
    let spread = (interval.as_millis() / 4) as u64;
    interval + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    settings: DiscoverySettings,
    mut names: watch::Receiver<Vec<String>>,
) -> std::io::Result<()> {
    let dest = SocketAddr::V4(SocketAddrV4::new(settings.group, settings.port));
    loop {
        let current = names.borrow_and_update().clone();
        let bytes = beacon_bytes(settings.guid, settings.listen_port, current)?;
        if let Err(e) = socket.send_to(&bytes, dest).await {
            tracing::debug!(error = %e, "beacon send failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(jittered(settings.interval)) => {}
            changed = names.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    settings: DiscoverySettings,
    names: watch::Receiver<Vec<String>>,
    reports: mpsc::UnboundedSender<DiscoveryReport>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 65536];
    let mut known: HashMap<NodeGuid, Instant> = HashMap::new();
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Some(report) = parse_beacon(&buf[..n], from, settings.guid) else {
            continue;
        };
        let now = Instant::now();
        known.retain(|_, seen| now.duration_since(*seen) < settings.ttl);
        let is_new = known.insert(report.guid, now).is_none();
        if reports.send(report).is_err() {
            return Ok(());
        }
        // answer newcomers directly so they need not wait a full interval
        if is_new {
            let current = names.borrow().clone();
            let bytes = beacon_bytes(settings.guid, settings.listen_port, current)?;
            let _ = socket.send_to(&bytes, from).await;
        }
    }
}
