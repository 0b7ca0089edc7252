use std::{io, time::Duration};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use miette::Diagnostic;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_serial::SerialStream;

use super::{ConnectError, SendError, Transport};

/// First packet of a frame starts with these two bytes.
const START_MARKER: [u8; 2] = [0x06, 0x09];
/// Every following packet of the same frame starts with these two bytes.
const CONTINUE_MARKER: [u8; 2] = [0x04, 0x14];

const MARKER_SIZE: usize = 2;
const FRAME_LENGTH_SIZE: usize = 2;
const CRC16_SIZE: usize = 2;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration of a [`SerialTransport`].
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Path of the serial port, e.g. `/dev/ttyACM0` or `COM42`
    pub port: String,
    /// Baud rate. Ignored by USB CDC ACM devices.
    pub baud_rate: u32,
    /// The maximum on-wire packet (line) size, including marker and newline
    pub line_length: usize,
    /// The maximum size of an encoded SMP frame the server can buffer.
    ///
    /// Matches Zephyr's `MCUMGR_TRANSPORT_UART_MTU`.
    pub max_smp_encoded_frame_size: usize,
    /// How long to keep retrying to open the port
    pub connect_timeout: Duration,
    /// Default per-request timeout
    pub request_timeout: Duration,
}

impl SerialConfig {
    /// Creates a configuration for `port` with default parameters.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: 115200,
            line_length: 128,
            max_smp_encoded_frame_size: 256,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(20),
        }
    }
}

/// Errors produced while decoding the serial line framing
#[derive(Error, Debug, Diagnostic)]
pub enum FramingError {
    /// A packet payload was not valid base64
    #[error("invalid base64 in SMP packet")]
    #[diagnostic(code(smp_client::transport::serial::base64))]
    Base64(#[from] base64::DecodeError),
    /// The frame checksum did not match its contents
    #[error("CRC mismatch, expected {expected:#06x} but computed {actual:#06x}")]
    #[diagnostic(code(smp_client::transport::serial::crc))]
    BadCrc {
        /// CRC announced by the frame trailer
        expected: u16,
        /// CRC computed over the received datagram
        actual: u16,
    },
    /// A continuation packet arrived with no frame in progress
    #[error("continuation packet without a start packet")]
    #[diagnostic(code(smp_client::transport::serial::unexpected_continuation))]
    UnexpectedContinuation,
    /// The announced frame length cannot hold a checksum
    #[error("announced frame length is invalid")]
    #[diagnostic(code(smp_client::transport::serial::bad_length))]
    BadLength,
    /// More bytes arrived than the announced frame length
    #[error("received more data than the announced frame length")]
    #[diagnostic(code(smp_client::transport::serial::overflow))]
    Overflow,
}

/// CRC-16/XMODEM: polynomial 0x1021, initial value 0x0000, no reflection.
fn crc16_xmodem(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Worst case base64-encoded size of `size` bytes.
fn base64_cost(size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    (4 * size).div_ceil(3) + 2
}

/// How many bytes can be base64-encoded into at most `size` bytes.
fn base64_max(size: usize) -> usize {
    if size < 4 {
        return 0;
    }
    3 * size / 4 - 2
}

/// Encodes one SMP datagram into newline-terminated wire packets.
///
/// The body `frame_length || datagram || crc16` is base64 encoded and split
/// so that no packet exceeds `line_length` bytes including its marker and
/// trailing newline. Base64 chunks are kept aligned to 4 characters so
/// every packet is independently decodable.
fn encode_frame(datagram: &[u8], line_length: usize) -> Result<Vec<Vec<u8>>, SendError> {
    let frame_length = datagram.len() + CRC16_SIZE;
    if frame_length > u16::MAX as usize {
        return Err(SendError::DataTooBig);
    }

    let mut body = Vec::with_capacity(FRAME_LENGTH_SIZE + frame_length);
    body.extend_from_slice(&(frame_length as u16).to_be_bytes());
    body.extend_from_slice(datagram);
    body.extend_from_slice(&crc16_xmodem(datagram).to_be_bytes());

    let encoded = BASE64.encode(&body).into_bytes();

    let capacity = (line_length.saturating_sub(MARKER_SIZE + 1) / 4) * 4;
    if capacity == 0 {
        return Err(SendError::DataTooBig);
    }

    let mut packets = Vec::with_capacity(encoded.len().div_ceil(capacity));
    for (index, chunk) in encoded.chunks(capacity).enumerate() {
        let marker = if index == 0 {
            START_MARKER
        } else {
            CONTINUE_MARKER
        };
        let mut packet = Vec::with_capacity(MARKER_SIZE + chunk.len() + 1);
        packet.extend_from_slice(&marker);
        packet.extend_from_slice(chunk);
        packet.push(b'\n');
        packets.push(packet);
    }

    Ok(packets)
}

/// Reassembles SMP datagrams from received lines.
///
/// Lines that do not start with an SMP marker are regular console output
/// and are skipped. A decode error drops the frame in progress; reassembly
/// restarts at the next start marker.
#[derive(Default)]
struct FrameDecoder {
    body: Vec<u8>,
    announced: Option<usize>,
    in_frame: bool,
}

impl FrameDecoder {
    fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.body.clear();
        self.announced = None;
        self.in_frame = false;
    }

    /// Feeds one received line (without the trailing newline). Returns a
    /// complete SMP datagram once the announced length has been received
    /// and the CRC checks out.
    fn feed_line(&mut self, line: &[u8]) -> Result<Option<Vec<u8>>, FramingError> {
        let payload = if line.starts_with(&START_MARKER) {
            self.reset();
            self.in_frame = true;
            &line[MARKER_SIZE..]
        } else if line.starts_with(&CONTINUE_MARKER) {
            if !self.in_frame {
                return Err(FramingError::UnexpectedContinuation);
            }
            &line[MARKER_SIZE..]
        } else {
            // Console output interleaved with SMP frames; not ours.
            return Ok(None);
        };

        let decoded = match BASE64.decode(payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.reset();
                return Err(err.into());
            }
        };
        self.body.extend_from_slice(&decoded);

        if self.announced.is_none() && self.body.len() >= FRAME_LENGTH_SIZE {
            let announced =
                u16::from_be_bytes([self.body[0], self.body[1]]) as usize;
            if announced < CRC16_SIZE {
                self.reset();
                return Err(FramingError::BadLength);
            }
            self.announced = Some(announced);
        }

        let Some(announced) = self.announced else {
            return Ok(None);
        };

        let received = self.body.len() - FRAME_LENGTH_SIZE;
        if received < announced {
            return Ok(None);
        }
        if received > announced {
            self.reset();
            return Err(FramingError::Overflow);
        }

        let datagram_end = FRAME_LENGTH_SIZE + announced - CRC16_SIZE;
        let datagram = self.body[FRAME_LENGTH_SIZE..datagram_end].to_vec();
        let expected = u16::from_be_bytes([self.body[datagram_end], self.body[datagram_end + 1]]);
        let actual = crc16_xmodem(&datagram);
        self.reset();

        if expected != actual {
            return Err(FramingError::BadCrc { expected, actual });
        }

        Ok(Some(datagram))
    }
}

async fn read_loop(read_half: ReadHalf<SerialStream>, frames: mpsc::Sender<Vec<u8>>) {
    let mut reader = BufReader::new(read_half);
    let mut decoder = FrameDecoder::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let stripped = line.strip_suffix(b"\n").unwrap_or(&line);
                match decoder.feed_line(stripped) {
                    Ok(Some(datagram)) => {
                        if frames.send(datagram).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => log::warn!("discarding corrupt SMP frame: {err}"),
                }
            }
            Err(err) => {
                log::warn!("serial read failed: {err}");
                break;
            }
        }
    }
}

/// An SMP transport over a serial port, using the SMP console line framing.
pub struct SerialTransport {
    config: SerialConfig,
    writer: Option<WriteHalf<SerialStream>>,
    reader: Option<JoinHandle<()>>,
    frames: Option<mpsc::Receiver<Vec<u8>>>,
    server_buffer_size: Option<usize>,
}

impl SerialTransport {
    /// Creates a new, not yet connected serial transport.
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            writer: None,
            reader: None,
            frames: None,
            server_buffer_size: None,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn connect(&mut self) -> Result<(), ConnectError> {
        self.disconnect().await;

        let builder = tokio_serial::new(&self.config.port, self.config.baud_rate);
        let start = tokio::time::Instant::now();
        let stream = loop {
            match SerialStream::open(&builder) {
                Ok(stream) => break stream,
                Err(err) if start.elapsed() < self.config.connect_timeout => {
                    log::debug!(
                        "failed to open {}: {err}, retrying in {}ms",
                        self.config.port,
                        CONNECT_RETRY_INTERVAL.as_millis()
                    );
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(err) => return Err(io::Error::other(err).into()),
            }
        };
        log::debug!("connected to {}", self.config.port);

        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(32);
        self.reader = Some(tokio::spawn(read_loop(read_half, tx)));
        self.writer = Some(write_half);
        self.frames = Some(rx);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer = None;
        self.frames = None;
    }

    async fn send(&mut self, datagram: &[u8]) -> Result<(), SendError> {
        if datagram.len() > self.max_unencoded_size() {
            return Err(SendError::DataTooBig);
        }
        let packets = encode_frame(datagram, self.config.line_length)?;
        let writer = self.writer.as_mut().ok_or(SendError::NotConnected)?;
        for packet in packets {
            writer.write_all(&packet).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    fn frames(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, ConnectError> {
        self.frames.take().ok_or(ConnectError::NotConnected)
    }

    fn initialize(&mut self, smp_server_buffer_size: usize) {
        self.server_buffer_size = Some(smp_server_buffer_size);
    }

    fn mtu(&self) -> usize {
        self.config.line_length
    }

    fn max_unencoded_size(&self) -> usize {
        // Each line carries its share of the base64-encoded length and CRC
        // fields plus a marker, and the last line a newline; what remains of
        // the encoded frame budget is available for the datagram itself.
        let line_buffers =
            (self.config.max_smp_encoded_frame_size / self.config.line_length).max(1);
        let framing_cost =
            (base64_cost(FRAME_LENGTH_SIZE + CRC16_SIZE) + MARKER_SIZE) * line_buffers + 1;
        let from_encoding = base64_max(self.config.max_smp_encoded_frame_size)
            .saturating_sub(framing_cost);

        match self.server_buffer_size {
            Some(buffer_size) => from_encoding.min(buffer_size),
            None => from_encoding,
        }
    }

    fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }
}
