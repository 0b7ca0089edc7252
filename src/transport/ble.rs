use std::{io, pin::Pin, time::Duration};

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
    WriteType,
};
use btleplug::platform::{Manager, Peripheral};
use futures::{Stream, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

use super::{ConnectError, SMP_HEADER_SIZE, SendError, Transport};

/// UUID of the standard SMP GATT service.
pub const SMP_SERVICE_UUID: Uuid = Uuid::from_u128(0x8D53DC1D_1DB7_4CD3_868B_8A527460AA84);

/// UUID of the SMP GATT characteristic used for both directions.
pub const SMP_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xDA2E7828_FBCE_4E01_AE9E_261174997C48);

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration of a [`BleTransport`].
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Peripheral ID (platform specific) or advertised device name
    pub address: String,
    /// Outgoing GATT write size.
    ///
    /// The negotiated ATT MTU is not observable on every platform, so the
    /// chunk defaults to 244 bytes, which fits the common 247-byte ATT MTU
    /// minus its 3-byte header.
    pub chunk_size: usize,
    /// Largest SMP datagram assumed to fit the server's buffer until the
    /// device reports its real buffer size
    pub default_max_unencoded_size: usize,
    /// Timeout covering scan and connection establishment
    pub connect_timeout: Duration,
    /// Default per-request timeout
    pub request_timeout: Duration,
}

impl BleConfig {
    /// Creates a configuration for the device `address` (ID or name) with
    /// default parameters.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            chunk_size: 244,
            default_max_unencoded_size: 256,
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(40),
        }
    }
}

fn ble_io(err: btleplug::Error) -> io::Error {
    io::Error::other(err)
}

async fn notification_loop(
    mut notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
    frames: mpsc::Sender<Vec<u8>>,
) {
    // Reassembly buffer; a datagram is complete once the total announced by
    // the header's length field has arrived.
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(notification) = notifications.next().await {
        if notification.uuid != SMP_CHARACTERISTIC_UUID {
            continue;
        }
        buffer.extend_from_slice(&notification.value);

        while buffer.len() >= SMP_HEADER_SIZE {
            let data_length = u16::from_be_bytes([buffer[2], buffer[3]]) as usize;
            let total = SMP_HEADER_SIZE + data_length;
            if buffer.len() < total {
                break;
            }
            let datagram: Vec<u8> = buffer.drain(..total).collect();
            if frames.send(datagram).await.is_err() {
                return;
            }
        }
    }
    log::debug!("BLE notification stream ended");
}

/// An SMP transport over the Bluetooth Low Energy SMP GATT service.
///
/// Outbound datagrams are written with response in MTU-sized fragments;
/// inbound fragments arrive as notifications on the same characteristic and
/// are reassembled using the SMP header's length field.
pub struct BleTransport {
    config: BleConfig,
    peripheral: Option<Peripheral>,
    characteristic: Option<Characteristic>,
    reader: Option<JoinHandle<()>>,
    frames: Option<mpsc::Receiver<Vec<u8>>>,
    server_buffer_size: Option<usize>,
}

impl BleTransport {
    /// Creates a new, not yet connected BLE transport.
    pub fn new(config: BleConfig) -> Self {
        Self {
            config,
            peripheral: None,
            characteristic: None,
            reader: None,
            frames: None,
            server_buffer_size: None,
        }
    }

    async fn scan_for_device(&self) -> Result<Peripheral, ConnectError> {
        let manager = Manager::new().await.map_err(ble_io)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(ble_io)?
            .into_iter()
            .next()
            .ok_or_else(|| io::Error::other("no BLE adapter available"))?;

        adapter
            .start_scan(ScanFilter {
                services: vec![SMP_SERVICE_UUID],
            })
            .await
            .map_err(ble_io)?;
        log::debug!("scanning for '{}'", self.config.address);

        let start = tokio::time::Instant::now();
        let found = loop {
            if let Ok(peripherals) = adapter.peripherals().await {
                let mut matched = None;
                for peripheral in peripherals {
                    if peripheral.id().to_string() == self.config.address {
                        matched = Some(peripheral);
                        break;
                    }
                    let props = peripheral.properties().await.ok().flatten();
                    if props
                        .and_then(|p| p.local_name)
                        .is_some_and(|name| name == self.config.address)
                    {
                        matched = Some(peripheral);
                        break;
                    }
                }
                if matched.is_some() {
                    break matched;
                }
            }
            if start.elapsed() >= self.config.connect_timeout {
                break None;
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        };

        let _ = adapter.stop_scan().await;
        found.ok_or_else(|| ConnectError::DeviceNotFound(self.config.address.clone()))
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&mut self) -> Result<(), ConnectError> {
        self.disconnect().await;

        let peripheral = self.scan_for_device().await?;

        log::debug!("connecting to '{}'", self.config.address);
        match tokio::time::timeout(self.config.connect_timeout, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(ble_io(err).into()),
            Err(_) => {
                let _ = peripheral.disconnect().await;
                return Err(ConnectError::Timeout);
            }
        }

        if let Err(err) = peripheral.discover_services().await {
            let _ = peripheral.disconnect().await;
            return Err(ble_io(err).into());
        }

        let Some(characteristic) = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == SMP_CHARACTERISTIC_UUID)
        else {
            let _ = peripheral.disconnect().await;
            return Err(ConnectError::NotSmpServer);
        };

        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(ble_io)?;
        let notifications = peripheral.notifications().await.map_err(ble_io)?;
        log::debug!("connected to '{}'", self.config.address);

        let (tx, rx) = mpsc::channel(32);
        self.reader = Some(tokio::spawn(notification_loop(notifications, tx)));
        self.frames = Some(rx);
        self.characteristic = Some(characteristic);
        self.peripheral = Some(peripheral);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.characteristic = None;
        self.frames = None;
        if let Some(peripheral) = self.peripheral.take() {
            let _ = peripheral.disconnect().await;
        }
    }

    async fn send(&mut self, datagram: &[u8]) -> Result<(), SendError> {
        let (Some(peripheral), Some(characteristic)) =
            (self.peripheral.as_ref(), self.characteristic.as_ref())
        else {
            return Err(SendError::NotConnected);
        };

        for chunk in datagram.chunks(self.config.chunk_size) {
            peripheral
                .write(characteristic, chunk, WriteType::WithResponse)
                .await
                .map_err(|err| SendError::TransportError(ble_io(err)))?;
        }
        Ok(())
    }

    fn frames(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, ConnectError> {
        self.frames.take().ok_or(ConnectError::NotConnected)
    }

    fn initialize(&mut self, smp_server_buffer_size: usize) {
        self.server_buffer_size = Some(smp_server_buffer_size);
    }

    fn mtu(&self) -> usize {
        self.config.chunk_size
    }

    fn max_unencoded_size(&self) -> usize {
        self.server_buffer_size
            .unwrap_or(self.config.default_max_unencoded_size)
    }

    fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }
}
