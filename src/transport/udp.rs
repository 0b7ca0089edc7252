use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle};

use super::{ConnectError, SMP_HEADER_SIZE, SendError, Transport};

/// Total IPv4 + UDP header overhead to subtract from the link MTU to get
/// the maximum UDP payload, per RFC 8085 section 3.2.
const IPV4_UDP_OVERHEAD: usize = 20 + 8;

/// Total IPv6 + UDP header overhead to subtract from the link MTU.
const IPV6_UDP_OVERHEAD: usize = 40 + 8;

/// Configuration of a [`UdpTransport`].
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Address of the SMP server
    pub address: IpAddr,
    /// UDP port of the SMP server
    pub port: u16,
    /// Link MTU; IP and UDP header overhead is subtracted to size datagrams
    pub mtu: usize,
    /// Timeout for socket setup
    pub connect_timeout: Duration,
    /// Default per-request timeout
    pub request_timeout: Duration,
}

impl UdpConfig {
    /// Creates a configuration for the SMP server at `address` with default
    /// parameters.
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            port: 1337,
            mtu: 1500,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_millis(2500),
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, frames: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; u16::MAX as usize];
    let mut message: Vec<u8> = Vec::new();
    let mut expected = 0;

    loop {
        let len = match socket.recv(&mut buf).await {
            Ok(len) => len,
            Err(err) => {
                log::warn!("UDP receive failed: {err}");
                break;
            }
        };
        let packet = &buf[..len];

        if message.is_empty() {
            if packet.len() < SMP_HEADER_SIZE {
                log::warn!("dropping runt UDP packet of {len} bytes");
                continue;
            }
            expected = SMP_HEADER_SIZE + u16::from_be_bytes([packet[2], packet[3]]) as usize;
        }
        message.extend_from_slice(packet);

        if message.len() > expected {
            log::warn!(
                "received more data than expected, {} > {expected} bytes; dropping message",
                message.len()
            );
            message.clear();
        } else if message.len() == expected {
            if frames.send(std::mem::take(&mut message)).await.is_err() {
                break;
            }
        }
    }
}

/// An SMP transport over UDP.
///
/// Each SMP datagram is sent as a single UDP datagram; sends that exceed
/// the payload budget fail instead of fragmenting. Responses larger than
/// one packet are reassembled using the SMP header's length field.
pub struct UdpTransport {
    config: UdpConfig,
    socket: Option<Arc<UdpSocket>>,
    reader: Option<JoinHandle<()>>,
    frames: Option<mpsc::Receiver<Vec<u8>>>,
    server_buffer_size: Option<usize>,
}

impl UdpTransport {
    /// Creates a new, not yet connected UDP transport.
    pub fn new(config: UdpConfig) -> Self {
        Self {
            config,
            socket: None,
            reader: None,
            frames: None,
            server_buffer_size: None,
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn connect(&mut self) -> Result<(), ConnectError> {
        self.disconnect().await;

        // Bind to the IP version of the target; a dual-stack wildcard bind
        // fails for IPv4 targets on platforms that set IPV6_V6ONLY.
        let bind_addr = match self.config.address {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let remote = SocketAddr::new(self.config.address, self.config.port);

        let socket = tokio::time::timeout(self.config.connect_timeout, async {
            let socket = UdpSocket::bind(bind_addr).await?;
            socket.connect(remote).await?;
            Ok::<_, std::io::Error>(socket)
        })
        .await
        .map_err(|_| ConnectError::Timeout)??;
        log::debug!("connected to {remote}");

        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(32);
        self.reader = Some(tokio::spawn(recv_loop(socket.clone(), tx)));
        self.socket = Some(socket);
        self.frames = Some(rx);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.socket = None;
        self.frames = None;
    }

    async fn send(&mut self, datagram: &[u8]) -> Result<(), SendError> {
        if datagram.len() > self.max_unencoded_size() {
            return Err(SendError::DataTooBig);
        }
        let socket = self.socket.as_ref().ok_or(SendError::NotConnected)?;
        socket.send(datagram).await?;
        Ok(())
    }

    fn frames(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, ConnectError> {
        self.frames.take().ok_or(ConnectError::NotConnected)
    }

    fn initialize(&mut self, smp_server_buffer_size: usize) {
        self.server_buffer_size = Some(smp_server_buffer_size);
    }

    fn mtu(&self) -> usize {
        self.config.mtu
    }

    fn max_unencoded_size(&self) -> usize {
        let overhead = match self.config.address {
            IpAddr::V4(_) => IPV4_UDP_OVERHEAD,
            IpAddr::V6(_) => IPV6_UDP_OVERHEAD,
        };
        let payload = self.config.mtu.saturating_sub(overhead);
        match self.server_buffer_size {
            Some(buffer_size) => payload.min(buffer_size),
            None => payload,
        }
    }

    fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }
}
