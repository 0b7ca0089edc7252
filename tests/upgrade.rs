//! Firmware upgrade workflow tests against a scripted SMP device model.

mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use ciborium::{Value, cbor};
use common::{Emitter, MockTransport, map_get, response_frame, split_frame};
use sha2::{Digest, Sha256};
use smp_client::{
    SmpClient,
    transport::smp_op,
    upgrade::{UpgradeError, UpgradeSettings, UpgradeStep},
};

fn value_as_u64(value: &Value) -> u64 {
    u64::try_from(value.as_integer().unwrap()).unwrap()
}

fn value_as_hash(value: &Value) -> [u8; 32] {
    value.as_bytes().unwrap().as_slice().try_into().unwrap()
}

#[derive(Clone)]
struct Slot {
    hash: [u8; 32],
    version: String,
    confirmed: bool,
}

struct UploadSession {
    len: u64,
    sha: [u8; 32],
    off: u64,
    data: Vec<u8>,
}

/// A minimal SMP device model: one image with two slots, MCUboot-style
/// test/confirm semantics and resumable uploads.
struct FakeDevice {
    slot0: Slot,
    slot1: Option<Slot>,
    upload: Option<UploadSession>,
    pending_test: Option<[u8; 32]>,
    /// Swallow the upload request that crosses this offset, once.
    silent_drop_at: Option<u64>,
    /// Ignore the pending test image on reset.
    break_swap: bool,
}

impl FakeDevice {
    fn new(slot0_hash: [u8; 32]) -> Self {
        Self {
            slot0: Slot {
                hash: slot0_hash,
                version: "1.0.0".to_string(),
                confirmed: true,
            },
            slot1: None,
            upload: None,
            pending_test: None,
            silent_drop_at: None,
            break_swap: false,
        }
    }

    fn image_state(&self) -> Value {
        let mut images = Vec::new();
        images.push(
            cbor!({
                "image" => 0,
                "slot" => 0,
                "version" => self.slot0.version.clone(),
                "hash" => Value::Bytes(self.slot0.hash.to_vec()),
                "bootable" => true,
                "confirmed" => self.slot0.confirmed,
                "active" => true,
            })
            .unwrap(),
        );
        if let Some(slot1) = &self.slot1 {
            images.push(
                cbor!({
                    "image" => 0,
                    "slot" => 1,
                    "version" => slot1.version.clone(),
                    "hash" => Value::Bytes(slot1.hash.to_vec()),
                    "bootable" => true,
                    "pending" => self.pending_test.is_some(),
                })
                .unwrap(),
            );
        }
        cbor!({ "images" => images }).unwrap()
    }

    fn handle_upload(&mut self, payload: &Value) -> Option<Value> {
        let off = value_as_u64(map_get(payload, "off").unwrap());
        let data = map_get(payload, "data").unwrap().as_bytes().unwrap().clone();

        if off == 0 {
            let len = value_as_u64(map_get(payload, "len").unwrap());
            let sha = value_as_hash(map_get(payload, "sha").unwrap());

            // A matching hash continues the previous broken session.
            if let Some(session) = &self.upload {
                if session.sha == sha && session.off < session.len {
                    return Some(cbor!({ "off" => session.off }).unwrap());
                }
            }
            self.upload = Some(UploadSession {
                len,
                sha,
                off: 0,
                data: Vec::new(),
            });
        }

        let session = self.upload.as_mut().unwrap();
        if off != session.off {
            return Some(cbor!({ "off" => session.off }).unwrap());
        }

        if let Some(threshold) = self.silent_drop_at {
            if off + data.len() as u64 > threshold {
                // Simulate the link going down: no response at all.
                self.silent_drop_at = None;
                return None;
            }
        }

        session.data.extend_from_slice(&data);
        session.off += data.len() as u64;

        if session.off >= session.len {
            let matches = <[u8; 32]>::from(Sha256::digest(&session.data)) == session.sha;
            self.slot1 = Some(Slot {
                hash: session.sha,
                version: "2.0.0".to_string(),
                confirmed: false,
            });
            Some(cbor!({ "off" => session.off, "match" => matches }).unwrap())
        } else {
            Some(cbor!({ "off" => session.off }).unwrap())
        }
    }

    fn handle_set_state(&mut self, payload: &Value) -> Value {
        let confirm = map_get(payload, "confirm").unwrap().as_bool().unwrap();
        let hash = map_get(payload, "hash").map(value_as_hash);

        if confirm {
            if hash.is_none() || hash == Some(self.slot0.hash) {
                self.slot0.confirmed = true;
            }
        } else {
            self.pending_test = hash;
        }
        self.image_state()
    }

    fn handle_reset(&mut self) {
        if self.break_swap {
            return;
        }
        if let (Some(pending), Some(slot1)) = (self.pending_test.take(), self.slot1.clone()) {
            if slot1.hash == pending {
                let old = std::mem::replace(
                    &mut self.slot0,
                    Slot {
                        confirmed: false,
                        ..slot1
                    },
                );
                self.slot1 = Some(old);
            }
        }
    }
}

fn device_responder(
    device: Arc<Mutex<FakeDevice>>,
    buf_size: u32,
) -> impl FnMut(Vec<u8>, Emitter) + Send {
    move |frame, emitter| {
        let (header, payload) = split_frame(&frame);
        let mut device = device.lock().unwrap();

        let response = match (header.group_id, header.command_id, header.op) {
            (0, 6, smp_op::READ) => {
                Some(cbor!({ "buf_size" => buf_size, "buf_count" => 4 }).unwrap())
            }
            (1, 0, smp_op::READ) => Some(device.image_state()),
            (1, 0, smp_op::WRITE) => Some(device.handle_set_state(&payload)),
            (1, 1, smp_op::WRITE) => device.handle_upload(&payload),
            (0, 5, smp_op::WRITE) => {
                // The device reboots without answering.
                device.handle_reset();
                None
            }
            other => panic!("unexpected request {other:?}"),
        };

        if let Some(response) = response {
            emitter.emit(response_frame(&header, &response));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn upgrade_happy_path() {
    let firmware: Vec<u8> = (0..32u8).collect();
    let new_hash: [u8; 32] = Sha256::digest(&firmware).into();

    let device = Arc::new(Mutex::new(FakeDevice::new([0xAA; 32])));
    let (transport, _controller) = MockTransport::new(device_responder(device.clone(), 512));

    let client = SmpClient::new(transport);
    client.connect().await.unwrap();

    let mut steps = Vec::new();
    let mut progress = |step: UpgradeStep, prog: Option<(u64, u64)>| {
        steps.push((step, prog));
        true
    };
    client
        .firmware_upgrade(&firmware, UpgradeSettings::default(), Some(&mut progress))
        .await
        .unwrap();

    let device = device.lock().unwrap();
    assert_eq!(device.slot0.hash, new_hash);
    assert!(device.slot0.confirmed);
    assert_eq!(device.upload.as_ref().unwrap().data, firmware);

    // The 32 byte image goes up in a single chunk.
    assert!(steps.contains(&(UpgradeStep::UploadingFirmware, Some((32, 32)))));
    let named_steps: Vec<UpgradeStep> = steps.iter().map(|(step, _)| *step).collect();
    let expect_order = [
        UpgradeStep::QueryingDeviceState,
        UpgradeStep::UploadingFirmware,
        UpgradeStep::ActivatingFirmware,
        UpgradeStep::TriggeringReboot,
        UpgradeStep::Reconnecting,
        UpgradeStep::ConfirmingFirmware,
    ];
    let mut last_index = 0;
    for step in expect_order {
        let index = named_steps
            .iter()
            .position(|s| *s == step)
            .unwrap_or_else(|| panic!("missing step {step:?}"));
        assert!(index >= last_index, "step {step:?} out of order");
        last_index = index;
    }
}

#[tokio::test(start_paused = true)]
async fn upload_resumes_after_link_loss() {
    let firmware: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
    let new_hash: [u8; 32] = Sha256::digest(&firmware).into();

    let device = Arc::new(Mutex::new(FakeDevice::new([0xAA; 32])));
    device.lock().unwrap().silent_drop_at = Some(512);

    // A 128 byte buffer forces many chunks.
    let (transport, controller) = MockTransport::new(device_responder(device.clone(), 128));

    let client = SmpClient::new(transport);
    client.connect().await.unwrap();

    // Exercise the back-off: the first reconnect attempt fails.
    controller.fail_next_connects(1);

    client
        .firmware_upgrade(&firmware, UpgradeSettings::default(), None)
        .await
        .unwrap();

    let device = device.lock().unwrap();
    assert_eq!(device.slot0.hash, new_hash);
    assert!(device.slot0.confirmed);
    assert_eq!(device.upload.as_ref().unwrap().data, firmware);

    // Initial connect, reconnect after the dropped upload, reconnect after
    // the reset.
    assert_eq!(controller.connect_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn upgrade_detects_missing_swap() {
    let firmware: Vec<u8> = (0..64u8).collect();

    let device = Arc::new(Mutex::new(FakeDevice::new([0xAA; 32])));
    device.lock().unwrap().break_swap = true;

    let (transport, _controller) = MockTransport::new(device_responder(device.clone(), 512));

    let client = SmpClient::new(transport);
    client.connect().await.unwrap();

    let err = client
        .firmware_upgrade(&firmware, UpgradeSettings::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, UpgradeError::HashMismatch));
}

#[tokio::test(start_paused = true)]
async fn upgrade_refuses_installed_firmware() {
    let firmware: Vec<u8> = (0..64u8).collect();
    let hash: [u8; 32] = Sha256::digest(&firmware).into();

    let device = Arc::new(Mutex::new(FakeDevice::new(hash)));
    let (transport, _controller) = MockTransport::new(device_responder(device, 512));

    let client = SmpClient::new(transport);
    client.connect().await.unwrap();

    let err = client
        .firmware_upgrade(&firmware, UpgradeSettings::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, UpgradeError::AlreadyInstalled));
}

#[tokio::test(start_paused = true)]
async fn progress_callback_cancels_the_upgrade() {
    let firmware: Vec<u8> = (0..64u8).collect();

    let device = Arc::new(Mutex::new(FakeDevice::new([0xAA; 32])));
    let (transport, _controller) = MockTransport::new(device_responder(device, 512));

    let client = SmpClient::new(transport);
    client.connect().await.unwrap();

    let mut progress =
        |step: UpgradeStep, _: Option<(u64, u64)>| step != UpgradeStep::UploadingFirmware;
    let err = client
        .firmware_upgrade(&firmware, UpgradeSettings::default(), Some(&mut progress))
        .await
        .unwrap_err();
    assert!(matches!(err, UpgradeError::ProgressCallbackError));
}
