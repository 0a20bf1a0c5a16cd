//! Transports: bus address parsing, stream drivers (TCP, Unix sockets) and inbound
//! connection approval.

use std::fmt;
use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use peerbus_core::TransportMask;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Where a node listens or is dialed, e.g. `tcp:addr=192.168.1.4,port=9955` or
/// `unix:path=/run/peerbus.sock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusAddress {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("missing transport prefix in {0:?}")]
    MissingScheme(String),
    #[error("unsupported transport {0:?}")]
    UnknownScheme(String),
    #[error("missing key {0}")]
    MissingKey(&'static str),
    #[error("bad value {value:?} for {key}")]
    BadValue { key: &'static str, value: String },
}

impl BusAddress {
    pub fn transport(&self) -> TransportMask {
        match self {
            BusAddress::Tcp(_) => TransportMask::TCP,
            #[cfg(unix)]
            BusAddress::Unix(_) => TransportMask::LOCAL,
        }
    }
}

fn key<'a>(pairs: &[(&'a str, &'a str)], name: &'static str) -> Option<&'a str> {
    pairs.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
}

impl FromStr for BusAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| AddressParseError::MissingScheme(s.to_string()))?;
        let pairs: Vec<(&str, &str)> = rest
            .split(',')
            .filter(|p| !p.is_empty())
            .filter_map(|p| p.split_once('='))
            .collect();
        match scheme {
            "tcp" => {
                let addr = key(&pairs, "addr").ok_or(AddressParseError::MissingKey("addr"))?;
                let port = key(&pairs, "port").ok_or(AddressParseError::MissingKey("port"))?;
                let ip = addr.parse().map_err(|_| AddressParseError::BadValue {
                    key: "addr",
                    value: addr.to_string(),
                })?;
                let port = port.parse().map_err(|_| AddressParseError::BadValue {
                    key: "port",
                    value: port.to_string(),
                })?;
                Ok(BusAddress::Tcp(SocketAddr::new(ip, port)))
            }
            #[cfg(unix)]
            "unix" => {
                let path = key(&pairs, "path").ok_or(AddressParseError::MissingKey("path"))?;
                Ok(BusAddress::Unix(PathBuf::from(path)))
            }
            other => Err(AddressParseError::UnknownScheme(other.to_string())),
        }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusAddress::Tcp(a) => write!(f, "tcp:addr={},port={}", a.ip(), a.port()),
            #[cfg(unix)]
            BusAddress::Unix(p) => write!(f, "unix:path={}", p.display()),
        }
    }
}

/// Byte stream an endpoint runs over.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

#[async_trait]
pub trait TransportListener: Send {
    /// Address actually bound (port 0 resolved).
    fn local_address(&self) -> BusAddress;
    /// Next inbound stream and a printable peer description.
    async fn accept(&mut self) -> io::Result<(BoxedStream, String)>;
}

#[async_trait]
pub trait TransportDriver: Send + Sync {
    fn mask(&self) -> TransportMask;
    async fn listen(&self, addr: &BusAddress) -> io::Result<Box<dyn TransportListener>>;
    async fn connect(&self, addr: &BusAddress) -> io::Result<BoxedStream>;
}

fn wrong_transport(addr: &BusAddress) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("address {addr} is for another transport"))
}

pub struct TcpDriver;

struct TcpTransportListener {
    listener: TcpListener,
    local: SocketAddr,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    fn local_address(&self) -> BusAddress {
        BusAddress::Tcp(self.local)
    }

    async fn accept(&mut self) -> io::Result<(BoxedStream, String)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), peer.to_string()))
    }
}

#[async_trait]
impl TransportDriver for TcpDriver {
    fn mask(&self) -> TransportMask {
        TransportMask::TCP
    }

    async fn listen(&self, addr: &BusAddress) -> io::Result<Box<dyn TransportListener>> {
        let BusAddress::Tcp(a) = addr else {
            return Err(wrong_transport(addr));
        };
        let listener = TcpListener::bind(a).await?;
        let local = listener.local_addr()?;
        Ok(Box::new(TcpTransportListener { listener, local }))
    }

    async fn connect(&self, addr: &BusAddress) -> io::Result<BoxedStream> {
        let BusAddress::Tcp(a) = addr else {
            return Err(wrong_transport(addr));
        };
        let stream = TcpStream::connect(a).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(unix)]
pub struct UnixDriver;

#[cfg(unix)]
struct UnixTransportListener {
    listener: tokio::net::UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
#[async_trait]
impl TransportListener for UnixTransportListener {
    fn local_address(&self) -> BusAddress {
        BusAddress::Unix(self.path.clone())
    }

    async fn accept(&mut self) -> io::Result<(BoxedStream, String)> {
        let (stream, _) = self.listener.accept().await?;
        Ok((Box::new(stream), format!("unix:{}", self.path.display())))
    }
}

#[cfg(unix)]
#[async_trait]
impl TransportDriver for UnixDriver {
    fn mask(&self) -> TransportMask {
        TransportMask::LOCAL
    }

    async fn listen(&self, addr: &BusAddress) -> io::Result<Box<dyn TransportListener>> {
        let BusAddress::Unix(path) = addr else {
            return Err(wrong_transport(addr));
        };
        // a stale socket file from a previous run blocks bind
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = tokio::net::UnixListener::bind(path)?;
        Ok(Box::new(UnixTransportListener {
            listener,
            path: path.clone(),
        }))
    }

    async fn connect(&self, addr: &BusAddress) -> io::Result<BoxedStream> {
        let BusAddress::Unix(path) = addr else {
            return Err(wrong_transport(addr));
        };
        Ok(Box::new(tokio::net::UnixStream::connect(path).await?))
    }
}

/// Driver that handles `addr`.
pub fn driver_for(addr: &BusAddress) -> Arc<dyn TransportDriver> {
    match addr {
        BusAddress::Tcp(_) => Arc::new(TcpDriver),
        #[cfg(unix)]
        BusAddress::Unix(_) => Arc::new(UnixDriver),
    }
}

/// Platform hook consulted for every inbound connection before the hello exchange.
pub trait ConnectionApproval: Send + Sync {
    fn approve(&self, transport: TransportMask, peer: &str) -> bool;
}

/// Approves everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAccept;

impl ConnectionApproval for AutoAccept {
    fn approve(&self, _transport: TransportMask, _peer: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_address() {
        let a: BusAddress = "tcp:addr=192.168.1.4,port=9955".parse().unwrap();
        assert_eq!(a, BusAddress::Tcp("192.168.1.4:9955".parse().unwrap()));
        assert_eq!(a.to_string(), "tcp:addr=192.168.1.4,port=9955");
        assert_eq!(a.transport(), TransportMask::TCP);
        // key order does not matter
        let b: BusAddress = "tcp:port=9955,addr=192.168.1.4".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(matches!(
            "192.168.1.4:9955".parse::<BusAddress>(),
            Err(AddressParseError::UnknownScheme(_))
        ));
        assert_eq!(
            "tcp:addr=10.0.0.1".parse::<BusAddress>(),
            Err(AddressParseError::MissingKey("port"))
        );
        assert!(matches!(
            "tcp:addr=10.0.0.1,port=99999".parse::<BusAddress>(),
            Err(AddressParseError::BadValue { key: "port", .. })
        ));
        assert!(matches!(
            "bluetooth:mac=00:11".parse::<BusAddress>(),
            Err(AddressParseError::UnknownScheme(_))
        ));
        assert!(matches!(
            "nocolon".parse::<BusAddress>(),
            Err(AddressParseError::MissingScheme(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn parses_unix_address() {
        let a: BusAddress = "unix:path=/run/peerbus.sock".parse().unwrap();
        assert_eq!(a, BusAddress::Unix(PathBuf::from("/run/peerbus.sock")));
        assert_eq!(a.transport(), TransportMask::LOCAL);
    }

    #[tokio::test]
    async fn tcp_driver_listens_and_connects() {
        let driver = TcpDriver;
        let mut listener = driver
            .listen(&"tcp:addr=127.0.0.1,port=0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_address();
        let (client, server) = tokio::join!(driver.connect(&addr), listener.accept());
        assert!(client.is_ok());
        assert!(server.unwrap().1.starts_with("127.0.0.1:"));
    }
}
