//! A scripted in-memory transport for driving the protocol layer in tests.

#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use smp_client::transport::{
    ConnectError, SMP_HEADER_SIZE, SendError, SmpHeader, Transport,
};
use tokio::sync::mpsc;

/// Handle the responder uses to push frames towards the client.
#[derive(Clone)]
pub struct Emitter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Emitter {
    /// Emits one complete datagram immediately.
    pub fn emit(&self, frame: Vec<u8>) {
        let _ = self.tx.try_send(frame);
    }

    /// Emits one complete datagram after `delay`.
    pub fn emit_delayed(&self, frame: Vec<u8>, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(frame).await;
        });
    }
}

/// Called for every datagram the client sends while the link is up.
pub type Responder = Box<dyn FnMut(Vec<u8>, Emitter) + Send>;

struct LinkState {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    connect_failures_remaining: usize,
}

/// Shared handle for inspecting and manipulating a [`MockTransport`] from
/// the test body.
#[derive(Clone)]
pub struct MockController {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    connects: Arc<AtomicUsize>,
    link: Arc<Mutex<LinkState>>,
}

impl MockController {
    /// All datagrams sent so far, in order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Number of datagrams sent so far.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Kills the link: subsequent sends fail and the frame stream ends.
    pub fn drop_link(&self) {
        self.link.lock().unwrap().tx = None;
    }

    /// Makes the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.link.lock().unwrap().connect_failures_remaining = n;
    }

    /// Emits a datagram towards the client, as if the device had sent it
    /// unprompted.
    pub fn emit(&self, frame: Vec<u8>) {
        if let Some(tx) = self.link.lock().unwrap().tx.clone() {
            let _ = tx.try_send(frame);
        }
    }
}

/// A [`Transport`] whose remote side is a closure.
pub struct MockTransport {
    responder: Arc<Mutex<Responder>>,
    controller: MockController,
    frames: Option<mpsc::Receiver<Vec<u8>>>,
    pub max_unencoded_size: usize,
    pub request_timeout: Duration,
}

impl MockTransport {
    pub fn new<F>(responder: F) -> (Self, MockController)
    where
        F: FnMut(Vec<u8>, Emitter) + Send + 'static,
    {
        let controller = MockController {
            sent: Arc::new(Mutex::new(Vec::new())),
            connects: Arc::new(AtomicUsize::new(0)),
            link: Arc::new(Mutex::new(LinkState {
                tx: None,
                connect_failures_remaining: 0,
            })),
        };
        let transport = Self {
            responder: Arc::new(Mutex::new(Box::new(responder))),
            controller: controller.clone(),
            frames: None,
            max_unencoded_size: 512,
            request_timeout: Duration::from_secs(2),
        };
        (transport, controller)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<(), ConnectError> {
        let mut link = self.controller.link.lock().unwrap();
        if link.connect_failures_remaining > 0 {
            link.connect_failures_remaining -= 1;
            return Err(ConnectError::Timeout);
        }
        let (tx, rx) = mpsc::channel(512);
        link.tx = Some(tx);
        drop(link);

        self.frames = Some(rx);
        self.controller.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.controller.link.lock().unwrap().tx = None;
        self.frames = None;
    }

    async fn send(&mut self, datagram: &[u8]) -> Result<(), SendError> {
        if datagram.len() > self.max_unencoded_size {
            return Err(SendError::DataTooBig);
        }
        let tx = self
            .controller
            .link
            .lock()
            .unwrap()
            .tx
            .clone()
            .ok_or(SendError::NotConnected)?;

        self.controller
            .sent
            .lock()
            .unwrap()
            .push(datagram.to_vec());
        let mut responder = self.responder.lock().unwrap();
        responder(datagram.to_vec(), Emitter { tx });
        Ok(())
    }

    fn frames(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, ConnectError> {
        self.frames.take().ok_or(ConnectError::NotConnected)
    }

    fn initialize(&mut self, smp_server_buffer_size: usize) {
        self.max_unencoded_size = self.max_unencoded_size.min(smp_server_buffer_size);
    }

    fn mtu(&self) -> usize {
        self.max_unencoded_size
    }

    fn max_unencoded_size(&self) -> usize {
        self.max_unencoded_size
    }

    fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

/// Splits a datagram into its header and decoded CBOR payload.
pub fn split_frame(frame: &[u8]) -> (SmpHeader, ciborium::Value) {
    let (header, payload) = frame.split_at(SMP_HEADER_SIZE);
    let header = SmpHeader::from_bytes(header.try_into().unwrap());
    assert_eq!(usize::from(header.data_length), payload.len());
    let payload = if payload.is_empty() {
        ciborium::Value::Map(Vec::new())
    } else {
        ciborium::from_reader(payload).unwrap()
    };
    (header, payload)
}

/// Builds a response datagram matching `request`.
pub fn response_frame(request: &SmpHeader, payload: &ciborium::Value) -> Vec<u8> {
    let mut encoded = Vec::new();
    ciborium::into_writer(payload, &mut encoded).unwrap();

    let header = SmpHeader {
        op: request.op | 1,
        data_length: encoded.len() as u16,
        ..*request
    };

    let mut frame = header.to_bytes().to_vec();
    frame.extend_from_slice(&encoded);
    frame
}

/// Looks up a key in a CBOR map value.
pub fn map_get<'a>(value: &'a ciborium::Value, key: &str) -> Option<&'a ciborium::Value> {
    value.as_map().and_then(|entries| {
        entries
            .iter()
            .find(|(k, _)| k.as_text() == Some(key))
            .map(|(_, v)| v)
    })
}

/// Waits until `predicate` holds, yielding to the runtime in between.
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if predicate() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
