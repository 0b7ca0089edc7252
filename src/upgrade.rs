use std::{fmt::Display, time::Duration};

use miette::Diagnostic;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    SmpClient,
    client::ImageUploadError,
    commands::os::SystemReset,
    connection::ExecuteError,
};

/// How long to wait for the response to the reset request. The device
/// usually drops the link before answering, which is not an error.
const RESET_RESPONSE_GRACE: Duration = Duration::from_secs(5);

/// Possible error values of [`SmpClient::firmware_upgrade`].
#[derive(Error, Debug, Diagnostic)]
pub enum UpgradeError {
    /// The progress callback returned an error.
    #[error("Progress callback returned an error")]
    #[diagnostic(code(smp_client::upgrade::progress_cb_error))]
    ProgressCallbackError,
    /// Fetching the image state returned an error.
    #[error("Failed to fetch image state from device")]
    #[diagnostic(code(smp_client::upgrade::get_state))]
    GetStateFailed(#[source] ExecuteError),
    /// The given firmware is already installed on the device.
    #[error("The device is already running the given firmware")]
    #[diagnostic(code(smp_client::upgrade::already_installed))]
    AlreadyInstalled,
    /// Uploading the firmware image failed.
    #[error("Failed to upload firmware image to device")]
    #[diagnostic(code(smp_client::upgrade::upload))]
    UploadFailed(#[from] ImageUploadError),
    /// Marking the new image for the swap failed.
    #[error("Failed to activate new firmware image")]
    #[diagnostic(code(smp_client::upgrade::activate))]
    ActivateFailed(#[source] ExecuteError),
    /// Triggering the device reset failed.
    #[error("Failed to trigger device reboot")]
    #[diagnostic(code(smp_client::upgrade::reset))]
    ResetFailed(#[source] ExecuteError),
    /// The device did not come back within the reconnect deadline.
    #[error("Could not reconnect to the device within the deadline")]
    #[diagnostic(code(smp_client::upgrade::reconnect_deadline))]
    DeadlineExceeded,
    /// Confirming the swapped image failed.
    #[error("Failed to confirm new firmware image")]
    #[diagnostic(code(smp_client::upgrade::confirm))]
    ConfirmFailed(#[source] ExecuteError),
    /// After the swap, the active slot does not hold the uploaded image.
    #[error("Device reports a different image hash after the swap")]
    #[diagnostic(code(smp_client::upgrade::hash_mismatch))]
    HashMismatch,
}

/// Configurable parameters for [`SmpClient::firmware_upgrade`].
#[derive(Clone, Debug)]
pub struct UpgradeSettings {
    /// The image number to upload to. Image 0 if `None`.
    pub image: Option<u32>,
    /// Hash identifying the image in device state, if the caller knows it,
    /// e.g. from an MCUboot image parser. The SHA256 of the firmware file
    /// is used when `None`.
    pub image_hash: Option<[u8; 32]>,
    /// Reject the upload unless the firmware version is an upgrade.
    pub upgrade_only: bool,
    /// Skip the test boot and confirm the image before the reset.
    ///
    /// Unsafe: a broken image cannot be rolled back by the bootloader.
    pub force_confirm: bool,
    /// Back-off before the first reconnect attempt; doubles per attempt.
    pub backoff_initial: Duration,
    /// Upper bound of the reconnect back-off.
    pub backoff_cap: Duration,
    /// Total time budget for regaining the connection after the reset or
    /// after a mid-upload link loss.
    pub reconnect_deadline: Duration,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            image: None,
            image_hash: None,
            upgrade_only: false,
            force_confirm: false,
            backoff_initial: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            reconnect_deadline: Duration::from_secs(60),
        }
    }
}

/// The step of the firmware upgrade that is currently being performed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradeStep {
    /// Querying the current firmware state of the device
    QueryingDeviceState,
    /// Uploading the new firmware to the device
    UploadingFirmware,
    /// Marking the new firmware to be swapped to active during next boot
    ActivatingFirmware,
    /// Triggering a system reset so the bootloader swaps to the new image
    TriggeringReboot,
    /// Waiting for the device to come back after the reset
    Reconnecting,
    /// Confirming the swapped firmware so it survives the next reset
    ConfirmingFirmware,
}

impl Display for UpgradeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueryingDeviceState => f.write_str("Querying device state ..."),
            Self::UploadingFirmware => f.write_str("Uploading new firmware ..."),
            Self::ActivatingFirmware => f.write_str("Activating new firmware ..."),
            Self::TriggeringReboot => f.write_str("Triggering device reboot ..."),
            Self::Reconnecting => f.write_str("Reconnecting ..."),
            Self::ConfirmingFirmware => f.write_str("Confirming new firmware ..."),
        }
    }
}

/// The progress callback type of [`SmpClient::firmware_upgrade`].
///
/// # Arguments
///
/// * `UpgradeStep` - The step that is being executed.
/// * `Option<(u64, u64)>` - The (current, total) progress of the step, if
///   available.
///
/// # Return
///
/// `false` cancels the upgrade.
pub type UpgradeProgressCallback<'a> = dyn FnMut(UpgradeStep, Option<(u64, u64)>) -> bool + 'a;

/// Reconnects the client with exponential back-off until
/// `settings.reconnect_deadline` runs out.
async fn reconnect_with_backoff(
    client: &SmpClient,
    settings: &UpgradeSettings,
) -> Result<(), UpgradeError> {
    let deadline = tokio::time::Instant::now() + settings.reconnect_deadline;
    let mut backoff = settings.backoff_initial;

    loop {
        tokio::time::sleep(backoff).await;
        match client.connect().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                if tokio::time::Instant::now() >= deadline {
                    log::warn!("reconnect failed: {err}");
                    return Err(UpgradeError::DeadlineExceeded);
                }
                log::debug!("reconnect failed: {err}, retrying in {backoff:?}");
                backoff = (backoff * 2).min(settings.backoff_cap);
            }
        }
    }
}

/// High-level firmware upgrade routine; see
/// [`SmpClient::firmware_upgrade`].
pub(crate) async fn firmware_upgrade(
    client: &SmpClient,
    firmware: &[u8],
    settings: UpgradeSettings,
    mut progress: Option<&mut UpgradeProgressCallback<'_>>,
) -> Result<(), UpgradeError> {
    let image_num = settings.image.unwrap_or(0);
    let hash: [u8; 32] = settings
        .image_hash
        .unwrap_or_else(|| Sha256::digest(firmware).into());

    let has_progress = progress.is_some();
    let mut progress = |step: UpgradeStep, prog: Option<(u64, u64)>| {
        if let Some(progress) = &mut progress {
            if !progress(step, prog) {
                return Err(UpgradeError::ProgressCallbackError);
            }
        }
        Ok(())
    };

    progress(UpgradeStep::QueryingDeviceState, None)?;
    let image_state = client
        .image_get_state()
        .await
        .map_err(UpgradeError::GetStateFailed)?;

    let active_image = image_state
        .iter()
        .find(|img| img.image == image_num && img.active)
        .or_else(|| {
            image_state
                .iter()
                .find(|img| img.image == image_num && img.slot == 0)
        });
    if active_image.and_then(|img| img.hash) == Some(hash) {
        return Err(UpgradeError::AlreadyInstalled);
    }

    progress(UpgradeStep::UploadingFirmware, None)?;
    loop {
        let mut upload_progress =
            |current, total| progress(UpgradeStep::UploadingFirmware, Some((current, total))).is_ok();

        let result = client
            .image_upload(
                firmware,
                settings.image,
                Some(hash),
                settings.upgrade_only,
                has_progress.then_some(&mut upload_progress),
            )
            .await;

        match result {
            Ok(()) => break,
            Err(ImageUploadError::ProgressCallbackError) => {
                return Err(UpgradeError::ProgressCallbackError);
            }
            Err(ImageUploadError::ExecuteError(err)) if err.is_transport_error() => {
                // Interrupted mid-upload; reconnect and resume. The next
                // upload announces the same SHA256, so the device replies
                // with the offset where the broken session stopped.
                log::warn!("upload interrupted: {err}, reconnecting");
                progress(UpgradeStep::Reconnecting, None)?;
                reconnect_with_backoff(client, &settings).await?;
                progress(UpgradeStep::UploadingFirmware, None)?;
            }
            Err(err) => return Err(err.into()),
        }
    }

    progress(UpgradeStep::ActivatingFirmware, None)?;
    client
        .image_set_state(Some(&hash), settings.force_confirm)
        .await
        .map_err(UpgradeError::ActivateFailed)?;

    progress(UpgradeStep::TriggeringReboot, None)?;
    let reset = client
        .connection()
        .request_with_timeout(
            &SystemReset {
                force: false,
                boot_mode: None,
            },
            RESET_RESPONSE_GRACE,
        )
        .await;
    match reset {
        Ok(_) => {}
        // The device may drop the link before its response goes out. Only
        // a failure to get the request onto the wire is fatal.
        Err(ExecuteError::Timeout) | Err(ExecuteError::ReceiveFailed(_)) => {
            log::debug!("no response to reset (device likely rebooted)");
        }
        Err(err) => return Err(UpgradeError::ResetFailed(err)),
    }

    progress(UpgradeStep::Reconnecting, None)?;
    client.disconnect().await;
    reconnect_with_backoff(client, &settings).await?;

    progress(UpgradeStep::ConfirmingFirmware, None)?;
    let image_state = client
        .image_get_state()
        .await
        .map_err(UpgradeError::GetStateFailed)?;
    let swapped = image_state
        .iter()
        .find(|img| img.image == image_num && img.slot == 0 && img.hash == Some(hash));
    let Some(swapped) = swapped else {
        return Err(UpgradeError::HashMismatch);
    };

    if !swapped.confirmed {
        client
            .image_set_state(Some(&hash), true)
            .await
            .map_err(UpgradeError::ConfirmFailed)?;
    }

    log::debug!("firmware upgrade complete");
    Ok(())
}
