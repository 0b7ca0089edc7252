use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};

use crate::{
    commands::{ErrResponse, ErrResponseV2, McuMgrCommand},
    smp_errors::DeviceError,
    transport::{
        ConnectError, ReceiveError, SMP_HEADER_SIZE, SendError, SmpHeader, Transport, smp_op,
    },
};

const SMP_VERSION: u8 = 0b01;

/// The sequence number is a single byte, so at most 256 requests can be
/// outstanding at any time.
const MAX_IN_FLIGHT: usize = 256;

/// Errors that can happen on the SMP protocol level
#[derive(Error, Debug, Diagnostic)]
pub enum ExecuteError {
    /// An error happened on SMP transport level while sending a request
    #[error("sending failed")]
    #[diagnostic(code(smp_client::connection::execute::send))]
    SendFailed(#[from] SendError),
    /// An error happened on SMP transport level while receiving a response
    #[error("receiving failed")]
    #[diagnostic(code(smp_client::connection::execute::receive))]
    ReceiveFailed(#[from] ReceiveError),
    /// An error happened while CBOR encoding the request payload
    #[error("cbor encoding failed")]
    #[diagnostic(code(smp_client::connection::execute::encode))]
    EncodeFailed,
    /// An error happened while CBOR decoding the response payload
    #[error("cbor decoding failed")]
    #[diagnostic(code(smp_client::connection::execute::decode))]
    DecodeFailed,
    /// No response arrived within the request timeout
    #[error("timeout waiting for response")]
    #[diagnostic(code(smp_client::connection::execute::timeout))]
    Timeout,
    /// The response sequence number does not match the request
    #[error("response sequence {actual} does not match request sequence {expected}")]
    #[diagnostic(code(smp_client::connection::execute::bad_sequence))]
    BadSequence {
        /// sequence number of the request
        expected: u8,
        /// sequence number carried by the response
        actual: u8,
    },
    /// The response group does not match the request
    #[error("response group {actual} does not match request group {expected}")]
    #[diagnostic(code(smp_client::connection::execute::bad_group))]
    BadGroup {
        /// group of the request
        expected: u16,
        /// group carried by the response
        actual: u16,
    },
    /// The response command does not match the request
    #[error("response command {actual} does not match request command {expected}")]
    #[diagnostic(code(smp_client::connection::execute::bad_command))]
    BadCommand {
        /// command of the request
        expected: u8,
        /// command carried by the response
        actual: u8,
    },
    /// The response operation does not match the request
    #[error("response operation {actual} is not the expected {expected}")]
    #[diagnostic(code(smp_client::connection::execute::bad_operation))]
    BadOperation {
        /// response operation matching the request operation
        expected: u8,
        /// operation carried by the response
        actual: u8,
    },
    /// The header length field disagrees with the payload size
    #[error("response length field does not match its payload size")]
    #[diagnostic(code(smp_client::connection::execute::length_mismatch))]
    LengthMismatch,
    /// The device returned an SMP error
    #[error("device returned error {0}")]
    #[diagnostic(code(smp_client::connection::execute::device_error))]
    ErrorResponse(DeviceError),
}

impl ExecuteError {
    /// Whether the device rejected the command as not supported.
    pub fn command_not_supported(&self) -> bool {
        matches!(self, ExecuteError::ErrorResponse(err) if err.command_not_supported())
    }

    /// Whether the device rejected the request as too large for its
    /// transport buffers.
    pub fn request_too_large(&self) -> bool {
        matches!(self, ExecuteError::ErrorResponse(err) if err.request_too_large())
    }

    /// Whether the error indicates a broken link rather than a protocol
    /// level failure.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            ExecuteError::SendFailed(_) | ExecuteError::ReceiveFailed(_) | ExecuteError::Timeout
        )
    }
}

struct PendingState {
    records: HashMap<u8, oneshot::Sender<Vec<u8>>>,
    next_sequence: u8,
}

/// The mapping from sequence number to in-flight request record.
struct Inflight {
    pending: StdMutex<PendingState>,
    freed: Notify,
}

impl Inflight {
    fn new() -> Self {
        Self {
            pending: StdMutex::new(PendingState {
                records: HashMap::new(),
                next_sequence: rand::random(),
            }),
            freed: Notify::new(),
        }
    }

    /// Allocates the next free sequence number and registers a completion
    /// sink for it. Waits cooperatively while all 256 sequence numbers are
    /// in flight.
    async fn register(self: &Arc<Self>) -> (SequenceGuard, oneshot::Receiver<Vec<u8>>) {
        loop {
            let freed = self.freed.notified();
            {
                let mut state = self.pending.lock().unwrap();
                if state.records.len() < MAX_IN_FLIGHT {
                    let mut sequence = state.next_sequence;
                    while state.records.contains_key(&sequence) {
                        sequence = sequence.wrapping_add(1);
                    }
                    state.next_sequence = sequence.wrapping_add(1);

                    let (sender, receiver) = oneshot::channel();
                    state.records.insert(sequence, sender);
                    let guard = SequenceGuard {
                        inflight: self.clone(),
                        sequence,
                    };
                    return (guard, receiver);
                }
            }
            freed.await;
        }
    }

    /// Delivers a response frame to the matching record, if any.
    fn complete(&self, sequence: u8, frame: Vec<u8>) -> bool {
        let sender = self.pending.lock().unwrap().records.remove(&sequence);
        match sender {
            Some(sender) => {
                self.freed.notify_waiters();
                sender.send(frame).is_ok()
            }
            None => false,
        }
    }

    fn remove(&self, sequence: u8) {
        if self
            .pending
            .lock()
            .unwrap()
            .records
            .remove(&sequence)
            .is_some()
        {
            self.freed.notify_waiters();
        }
    }

    /// Drops every outstanding record; their callers observe a closed
    /// completion sink.
    fn abort_all(&self) {
        self.pending.lock().unwrap().records.clear();
        self.freed.notify_waiters();
    }
}

/// Releases the registered sequence number when the issuing context goes
/// away, whether by completion, timeout or cancellation.
struct SequenceGuard {
    inflight: Arc<Inflight>,
    sequence: u8,
}

impl Drop for SequenceGuard {
    fn drop(&mut self) {
        self.inflight.remove(self.sequence);
    }
}

/// Drains the transport's receive stream and correlates responses with
/// in-flight requests by sequence number. Responses nobody waits for
/// anymore, such as replies arriving after their request timed out, are
/// dropped.
async fn dispatch(mut frames: mpsc::Receiver<Vec<u8>>, inflight: Arc<Inflight>) {
    while let Some(frame) = frames.recv().await {
        if frame.len() < SMP_HEADER_SIZE {
            log::warn!("dropping truncated datagram of {} bytes", frame.len());
            continue;
        }
        let sequence = frame[6];
        if !inflight.complete(sequence, frame) {
            log::debug!("dropping response with unmatched sequence number {sequence}");
        }
    }
    // The stream ended, so the link is gone; fail everything outstanding.
    inflight.abort_all();
}

/// An SMP protocol layer connection to a device.
///
/// Encodes requests, splits them across the transport's MTU, and matches
/// responses to concurrent requests by sequence number. In most cases this
/// struct is used indirectly through [`SmpClient`](crate::SmpClient).
pub struct Connection {
    transport: Mutex<Box<dyn Transport>>,
    inflight: Arc<Inflight>,
    dispatcher: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Connection {
    /// Creates a new connection over `transport`.
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self {
            transport: Mutex::new(Box::new(transport)),
            inflight: Arc::new(Inflight::new()),
            dispatcher: StdMutex::new(None),
        }
    }

    /// Connects the transport and starts the background receive task.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let mut transport = self.transport.lock().await;
        if let Some(old) = self.dispatcher.lock().unwrap().take() {
            old.abort();
        }
        self.inflight.abort_all();

        transport.connect().await?;
        let frames = transport.frames()?;
        *self.dispatcher.lock().unwrap() =
            Some(tokio::spawn(dispatch(frames, self.inflight.clone())));
        Ok(())
    }

    /// Disconnects the transport. Outstanding requests fail. Idempotent.
    pub async fn disconnect(&self) {
        let mut transport = self.transport.lock().await;
        transport.disconnect().await;
        if let Some(dispatcher) = self.dispatcher.lock().unwrap().take() {
            dispatcher.abort();
        }
        self.inflight.abort_all();
    }

    /// Executes an SMP command with the transport's default timeout.
    pub async fn request<R: McuMgrCommand>(
        &self,
        request: &R,
    ) -> Result<R::Response, ExecuteError> {
        let timeout = self.transport.lock().await.request_timeout();
        self.request_with_timeout(request, timeout).await
    }

    /// Executes an SMP command, waiting at most `timeout` for the response.
    ///
    /// A response arriving after the timeout is dropped silently; its
    /// sequence number is free for reuse as soon as this method returns.
    pub async fn request_with_timeout<R: McuMgrCommand>(
        &self,
        request: &R,
        timeout: Duration,
    ) -> Result<R::Response, ExecuteError> {
        let mut payload = Vec::new();
        ciborium::into_writer(request, &mut payload).map_err(|_| ExecuteError::EncodeFailed)?;
        log::debug!("TX data: {}", hex::encode(&payload));

        let (guard, response) = self.inflight.register().await;

        let header = SmpHeader {
            ver: SMP_VERSION,
            op: if R::WRITE_OPERATION {
                smp_op::WRITE
            } else {
                smp_op::READ
            },
            flags: 0,
            data_length: payload
                .len()
                .try_into()
                .map_err(|_| ExecuteError::SendFailed(SendError::DataTooBig))?,
            group_id: R::GROUP_ID,
            sequence_num: guard.sequence,
            command_id: R::COMMAND_ID,
        };

        let mut datagram = Vec::with_capacity(SMP_HEADER_SIZE + payload.len());
        datagram.extend_from_slice(&header.to_bytes());
        datagram.extend_from_slice(&payload);

        {
            let mut transport = self.transport.lock().await;
            transport.send(&datagram).await?;
        }

        let frame = match tokio::time::timeout(timeout, response).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => return Err(ExecuteError::ReceiveFailed(ReceiveError::Disconnected)),
            Err(_) => {
                log::debug!(
                    "request with sequence {} timed out after {timeout:?}",
                    guard.sequence
                );
                return Err(ExecuteError::Timeout);
            }
        };
        drop(guard);

        log::debug!("RX data: {}", hex::encode(&frame));
        Self::decode_response::<R>(&header, &frame)
    }

    /// Executes a pipelined sequence of requests of the same command type.
    ///
    /// `next_request` receives the previous response (or `None` for the
    /// first call) and produces the next request, or `None` to finish.
    /// Memory stays bounded to one request/response pair regardless of how
    /// many requests the sequence issues, which is what chunked uploads
    /// need.
    pub async fn request_all<R, F>(&self, mut next_request: F) -> Result<(), ExecuteError>
    where
        R: McuMgrCommand,
        F: FnMut(Option<&R::Response>) -> Option<R>,
    {
        let mut last: Option<R::Response> = None;
        while let Some(request) = next_request(last.as_ref()) {
            last = Some(self.request(&request).await?);
        }
        Ok(())
    }

    /// The largest datagram the remote currently accepts; re-read this
    /// before sizing each chunked request.
    pub async fn max_unencoded_size(&self) -> usize {
        self.transport.lock().await.max_unencoded_size()
    }

    /// The transport's default per-request timeout.
    pub async fn request_timeout(&self) -> Duration {
        self.transport.lock().await.request_timeout()
    }

    /// Forwards the server's reported transport buffer size to the
    /// transport.
    pub async fn initialize_transport(&self, smp_server_buffer_size: usize) {
        self.transport
            .lock()
            .await
            .initialize(smp_server_buffer_size);
    }

    fn decode_response<R: McuMgrCommand>(
        request_header: &SmpHeader,
        frame: &[u8],
    ) -> Result<R::Response, ExecuteError> {
        let Some((header_bytes, payload)) = frame.split_first_chunk::<SMP_HEADER_SIZE>() else {
            return Err(ExecuteError::ReceiveFailed(ReceiveError::Truncated));
        };
        let header = SmpHeader::from_bytes(*header_bytes);

        if header.sequence_num != request_header.sequence_num {
            return Err(ExecuteError::BadSequence {
                expected: request_header.sequence_num,
                actual: header.sequence_num,
            });
        }
        if header.group_id != request_header.group_id {
            return Err(ExecuteError::BadGroup {
                expected: request_header.group_id,
                actual: header.group_id,
            });
        }
        if header.command_id != request_header.command_id {
            return Err(ExecuteError::BadCommand {
                expected: request_header.command_id,
                actual: header.command_id,
            });
        }
        let expected_op = request_header.op | 1;
        if header.op != expected_op {
            return Err(ExecuteError::BadOperation {
                expected: expected_op,
                actual: header.op,
            });
        }
        if usize::from(header.data_length) != payload.len() {
            return Err(ExecuteError::LengthMismatch);
        }

        // Some servers answer parameterless writes with no payload at all;
        // treat that like an empty map.
        let payload: &[u8] = if payload.is_empty() { &[0xA0] } else { payload };

        let err: ErrResponse =
            ciborium::from_reader(payload).map_err(|_| ExecuteError::DecodeFailed)?;
        if let Some(ErrResponseV2 { group, rc }) = err.err {
            return Err(ExecuteError::ErrorResponse(DeviceError::V2 { group, rc }));
        }
        if let Some(rc) = err.rc {
            // rc 0 or its absence means success
            if rc != 0 {
                return Err(ExecuteError::ErrorResponse(DeviceError::V1 { rc }));
            }
        }

        ciborium::from_reader(payload).map_err(|_| ExecuteError::DecodeFailed)
    }
}
