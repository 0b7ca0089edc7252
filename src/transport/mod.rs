use std::{io, time::Duration};

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::mpsc;

/// Serial (UART, USB CDC ACM) transport
pub mod serial;

/// Bluetooth Low Energy (GATT) transport
pub mod ble;

/// UDP transport
pub mod udp;

/// Size of the SMP header in bytes.
pub const SMP_HEADER_SIZE: usize = 8;

/// SMP operation codes, the `op` field of [`SmpHeader`].
pub mod smp_op {
    /// Read request
    pub const READ: u8 = 0;
    /// Read response
    pub const READ_RSP: u8 = 1;
    /// Write request
    pub const WRITE: u8 = 2;
    /// Write response
    pub const WRITE_RSP: u8 = 3;
}

/// The 8-byte header that starts every SMP datagram.
///
/// Multi-byte fields are big-endian on the wire.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SmpHeader {
    /// Protocol version (0 legacy, 1 current)
    pub ver: u8,
    /// Operation, see [`smp_op`]
    pub op: u8,
    /// Reserved flags, must be zero
    pub flags: u8,
    /// Length of the CBOR payload that follows the header
    pub data_length: u16,
    /// Management group, see [`SmpGroup`](crate::SmpGroup)
    pub group_id: u16,
    /// Client-chosen correlation tag, wraps modulo 256
    pub sequence_num: u8,
    /// Command within the group
    pub command_id: u8,
}

impl SmpHeader {
    /// Parses a header from its wire representation.
    pub fn from_bytes(data: [u8; SMP_HEADER_SIZE]) -> Self {
        Self {
            ver: (data[0] >> 3) & 0b11,
            op: data[0] & 0b111,
            flags: data[1],
            data_length: u16::from_be_bytes([data[2], data[3]]),
            group_id: u16::from_be_bytes([data[4], data[5]]),
            sequence_num: data[6],
            command_id: data[7],
        }
    }

    /// Serializes the header to its wire representation.
    pub fn to_bytes(self) -> [u8; SMP_HEADER_SIZE] {
        let [length_0, length_1] = self.data_length.to_be_bytes();
        let [group_id_0, group_id_1] = self.group_id.to_be_bytes();
        [
            ((self.ver & 0b11) << 3) | (self.op & 0b111),
            self.flags,
            length_0,
            length_1,
            group_id_0,
            group_id_1,
            self.sequence_num,
            self.command_id,
        ]
    }
}

/// Errors that can happen while connecting a transport
#[derive(Error, Debug, Diagnostic)]
pub enum ConnectError {
    /// The underlying link could not be established
    #[error("transport error")]
    #[diagnostic(code(smp_client::transport::connect::transport))]
    TransportError(#[from] io::Error),
    /// The connection attempt did not complete within the configured timeout
    #[error("connection attempt timed out")]
    #[diagnostic(code(smp_client::transport::connect::timeout))]
    Timeout,
    /// No device matched the configured address or name
    #[error("device '{0}' not found")]
    #[diagnostic(code(smp_client::transport::connect::not_found))]
    DeviceNotFound(String),
    /// The device does not expose the SMP GATT service
    #[error("device does not have the SMP service")]
    #[diagnostic(code(smp_client::transport::connect::not_smp_server))]
    NotSmpServer,
    /// The transport is not connected
    #[error("transport is not connected")]
    #[diagnostic(code(smp_client::transport::connect::not_connected))]
    NotConnected,
}

/// Errors that can happen while sending a datagram
#[derive(Error, Debug, Diagnostic)]
pub enum SendError {
    /// The underlying link reported a write error
    #[error("transport error")]
    #[diagnostic(code(smp_client::transport::send::transport))]
    TransportError(#[from] io::Error),
    /// The datagram exceeds what the transport can carry in one message
    #[error("given data slice was too big")]
    #[diagnostic(code(smp_client::transport::send::too_big))]
    DataTooBig,
    /// The transport is not connected
    #[error("transport is not connected")]
    #[diagnostic(code(smp_client::transport::send::not_connected))]
    NotConnected,
}

/// Errors that can happen while receiving a response
#[derive(Error, Debug, Diagnostic)]
pub enum ReceiveError {
    /// The underlying link reported a read error
    #[error("transport error")]
    #[diagnostic(code(smp_client::transport::recv::transport))]
    TransportError(#[from] io::Error),
    /// The transport disconnected while a response was outstanding
    #[error("transport disconnected")]
    #[diagnostic(code(smp_client::transport::recv::disconnected))]
    Disconnected,
    /// A received datagram was shorter than an SMP header
    #[error("received truncated datagram")]
    #[diagnostic(code(smp_client::transport::recv::truncated))]
    Truncated,
    /// The device answered with something other than the expected response
    #[error("received unexpected response")]
    #[diagnostic(code(smp_client::transport::recv::unexpected))]
    UnexpectedResponse,
}

/// A byte-oriented SMP transport.
///
/// A transport accepts complete SMP datagrams for sending, handling any
/// fragmentation internally, and surfaces complete reassembled datagrams
/// through the channel returned by [`Transport::frames`]. This is the only
/// contract the protocol layer relies on; everything else (line framing,
/// GATT writes, datagram sockets) is transport-private.
#[async_trait]
pub trait Transport: Send {
    /// Establishes the underlying link.
    ///
    /// Reconnecting an already connected transport tears down the previous
    /// link first.
    async fn connect(&mut self) -> Result<(), ConnectError>;

    /// Releases the link. Idempotent.
    async fn disconnect(&mut self);

    /// Sends one complete SMP datagram (header plus payload).
    ///
    /// Returns once the bytes have been handed to the wire. Concurrent
    /// callers must serialize externally; the protocol layer does.
    async fn send(&mut self, datagram: &[u8]) -> Result<(), SendError>;

    /// Takes the stream of complete received datagrams.
    ///
    /// Each item is one reassembled SMP datagram (header plus payload).
    /// The channel closes when the link goes down. Must be called after
    /// [`Transport::connect`]; a second call before reconnecting fails.
    fn frames(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, ConnectError>;

    /// Applies the SMP server's transport buffer size, as reported by the
    /// MCUmgr parameters command, to this transport's sizing.
    fn initialize(&mut self, smp_server_buffer_size: usize);

    /// The largest chunk this transport emits per physical write.
    fn mtu(&self) -> usize;

    /// The largest SMP datagram the remote accepts in one logical message.
    ///
    /// May change after [`Transport::initialize`]; the protocol layer
    /// re-reads it for every request.
    fn max_unencoded_size(&self) -> usize;

    /// The default per-request timeout for this transport.
    fn request_timeout(&self) -> Duration;
}
