use std::{collections::HashMap, io, time::Duration};

use miette::Diagnostic;
use rand::distr::SampleString;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    commands::{
        self,
        fs::file_upload_max_data_chunk_size,
        image::{ImageState, ImageUpload, image_upload_max_data_chunk_size},
    },
    connection::{Connection, ExecuteError},
    transport::{ConnectError, ReceiveError, Transport},
    upgrade::{self, UpgradeError, UpgradeProgressCallback, UpgradeSettings},
};

/// Budget for learning the server's buffer size during [`SmpClient::connect`].
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for the first chunk of an image upload; the server may need to
/// erase the target slot before answering.
const FIRST_UPLOAD_CHUNK_TIMEOUT: Duration = Duration::from_secs(40);

/// The bootloader running on a device
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootloaderInfo {
    /// The device runs MCUboot
    MCUboot {
        /// MCUboot application mode (overwrite-only, swap, direct-XIP, ...)
        mode: i32,
        /// Whether MCUboot was built with downgrade prevention
        no_downgrade: bool,
    },
    /// The device runs a bootloader this crate does not know
    Unknown {
        /// Name the device reported
        name: String,
    },
}

/// Possible error values of [`SmpClient::image_upload`].
#[derive(Error, Debug, Diagnostic)]
pub enum ImageUploadError {
    /// The command failed in the SMP protocol layer.
    #[error("Command execution failed")]
    #[diagnostic(code(smp_client::client::image_upload::execute))]
    ExecuteError(#[from] ExecuteError),
    /// The progress callback returned an error.
    #[error("Progress callback returned an error")]
    #[diagnostic(code(smp_client::client::image_upload::progress_cb_error))]
    ProgressCallbackError,
    /// The current frame size is too small for this command.
    #[error("SMP frame size too small for this command")]
    #[diagnostic(code(smp_client::client::image_upload::framesize_too_small))]
    FrameSizeTooSmall(#[source] io::Error),
    /// The server reported that the upload does not match the announced hash.
    #[error("Server reported mismatched SHA256 after upload")]
    #[diagnostic(code(smp_client::client::image_upload::verification))]
    VerificationFailed,
}

/// Possible error values of [`SmpClient::fs_file_upload`].
#[derive(Error, Debug, Diagnostic)]
pub enum FileUploadError {
    /// The command failed in the SMP protocol layer.
    #[error("Command execution failed")]
    #[diagnostic(code(smp_client::client::file_upload::execute))]
    ExecuteError(#[from] ExecuteError),
    /// The progress callback returned an error.
    #[error("Progress callback returned an error")]
    #[diagnostic(code(smp_client::client::file_upload::progress_cb_error))]
    ProgressCallbackError,
    /// The current frame size is too small for this command.
    #[error("SMP frame size too small for this command")]
    #[diagnostic(code(smp_client::client::file_upload::framesize_too_small))]
    FrameSizeTooSmall(#[source] io::Error),
}

/// Possible error values of [`SmpClient::fs_file_download`].
#[derive(Error, Debug, Diagnostic)]
pub enum FileDownloadError {
    /// The command failed in the SMP protocol layer.
    #[error("Command execution failed")]
    #[diagnostic(code(smp_client::client::file_download::execute))]
    ExecuteError(#[from] ExecuteError),
    /// A device response contained an unexpected offset value.
    #[error("Received offset does not match requested offset")]
    #[diagnostic(code(smp_client::client::file_download::offset_mismatch))]
    UnexpectedOffset,
    /// The received data does not match the reported file size.
    #[error("Received data does not match reported size")]
    #[diagnostic(code(smp_client::client::file_download::size_mismatch))]
    SizeMismatch,
    /// The response unexpectedly did not report the file size.
    #[error("Received data is missing file size information")]
    #[diagnostic(code(smp_client::client::file_download::missing_size))]
    MissingSize,
    /// The progress callback returned an error.
    #[error("Progress callback returned an error")]
    #[diagnostic(code(smp_client::client::file_download::progress_cb_error))]
    ProgressCallbackError,
}

/// A high level client for the SMP management protocol.
///
/// This struct is the central entry point of this crate. It wraps a
/// [`Connection`] over any [`Transport`] and exposes the common management
/// routines as typed methods.
pub struct SmpClient {
    connection: Connection,
}

impl SmpClient {
    /// Creates an SMP client over the given transport.
    ///
    /// ```no_run
    /// # use smp_client::{SmpClient, transport::serial::{SerialConfig, SerialTransport}};
    /// let client = SmpClient::new(SerialTransport::new(SerialConfig::new("/dev/ttyACM0")));
    /// ```
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self {
            connection: Connection::new(transport),
        }
    }

    /// Connects the transport and queries the device's MCUmgr parameters
    /// to learn how large requests may be.
    ///
    /// Devices without the parameters command keep the transport's
    /// conservative default; that is not an error.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.connection.connect().await?;

        match self
            .connection
            .request_with_timeout(&commands::os::McuMgrParameters, INITIALIZE_TIMEOUT)
            .await
        {
            Ok(parameters) => {
                log::debug!("using SMP buffer size {}", parameters.buf_size);
                self.connection
                    .initialize_transport(parameters.buf_size as usize)
                    .await;
            }
            Err(err) => log::warn!("could not read MCUmgr parameters: {err}"),
        }
        Ok(())
    }

    /// Disconnects the transport. Idempotent.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// The underlying SMP connection, for issuing raw requests with custom
    /// timeouts.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Checks if the device is alive and responding.
    ///
    /// Runs an echo with random data and checks that the response matches.
    pub async fn check_connection(&self) -> Result<(), ExecuteError> {
        let random_message = rand::distr::Alphanumeric.sample_string(&mut rand::rng(), 16);
        let response = self.os_echo(&random_message).await?;
        if random_message == response {
            Ok(())
        } else {
            Err(ExecuteError::ReceiveFailed(
                ReceiveError::UnexpectedResponse,
            ))
        }
    }

    /// Sends a message to the device and expects the same message back.
    pub async fn os_echo(&self, msg: impl AsRef<str>) -> Result<String, ExecuteError> {
        self.connection
            .request(&commands::os::Echo { d: msg.as_ref() })
            .await
            .map(|response| response.r)
    }

    /// Queries live task statistics.
    ///
    /// `stkuse` and `stksiz` are converted to bytes; Zephyr reports them
    /// as 4-byte words.
    pub async fn os_task_statistics(
        &self,
    ) -> Result<HashMap<String, commands::os::TaskStatisticsEntry>, ExecuteError> {
        let mut tasks = self
            .connection
            .request(&commands::os::TaskStatistics)
            .await?
            .tasks;
        for stats in tasks.values_mut() {
            stats.stkuse = stats.stkuse.map(|val| val * 4);
            stats.stksiz = stats.stksiz.map(|val| val * 4);
        }
        Ok(tasks)
    }

    /// Retrieves the device RTC's datetime.
    pub async fn os_get_datetime(&self) -> Result<chrono::NaiveDateTime, ExecuteError> {
        self.connection
            .request(&commands::os::DateTimeGet)
            .await
            .map(|response| response.datetime)
    }

    /// Sets the RTC of the device to the given datetime.
    pub async fn os_set_datetime(
        &self,
        datetime: chrono::NaiveDateTime,
    ) -> Result<(), ExecuteError> {
        self.connection
            .request(&commands::os::DateTimeSet { datetime })
            .await
            .map(Into::into)
    }

    /// Issues a system reset.
    ///
    /// # Arguments
    ///
    /// * `force` - Reset even if the application vetoes it.
    /// * `boot_mode` - Overrides the boot mode (`0` normal, `1` bootloader
    ///   recovery); requires `MCUMGR_GRP_OS_RESET_BOOT_MODE` on the device.
    pub async fn os_system_reset(
        &self,
        force: bool,
        boot_mode: Option<u8>,
    ) -> Result<(), ExecuteError> {
        self.connection
            .request(&commands::os::SystemReset { force, boot_mode })
            .await
            .map(Into::into)
    }

    /// Fetches the parameters of the device's MCUmgr library.
    pub async fn os_mcumgr_parameters(
        &self,
    ) -> Result<commands::os::McuMgrParametersResponse, ExecuteError> {
        self.connection.request(&commands::os::McuMgrParameters).await
    }

    /// Fetches information about the running image, similar to `uname`.
    ///
    /// For the format specifier fields see the
    /// [SMP documentation](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_0.html#os-application-info-request).
    pub async fn os_application_info(
        &self,
        format: Option<&str>,
    ) -> Result<String, ExecuteError> {
        self.connection
            .request(&commands::os::ApplicationInfo { format })
            .await
            .map(|response| response.output)
    }

    /// Fetches information about the device's bootloader.
    pub async fn os_bootloader_info(&self) -> Result<BootloaderInfo, ExecuteError> {
        let response = self.connection.request(&commands::os::BootloaderInfo).await?;
        Ok(match response.bootloader.as_str() {
            "MCUboot" => {
                let mode = self
                    .connection
                    .request(&commands::os::BootloaderInfoMcubootMode)
                    .await?;
                BootloaderInfo::MCUboot {
                    mode: mode.mode,
                    no_downgrade: mode.no_downgrade,
                }
            }
            name => BootloaderInfo::Unknown {
                name: name.to_string(),
            },
        })
    }

    /// Obtains the list of images with their current state.
    pub async fn image_get_state(&self) -> Result<Vec<ImageState>, ExecuteError> {
        self.connection
            .request(&commands::image::GetImageState)
            .await
            .map(|response| response.images)
    }

    /// Marks the image identified by `hash` for a test boot
    /// (`confirm = false`) or as permanent (`confirm = true`).
    ///
    /// With `confirm = true` and no hash, the currently running image is
    /// confirmed.
    pub async fn image_set_state(
        &self,
        hash: Option<&[u8; 32]>,
        confirm: bool,
    ) -> Result<Vec<ImageState>, ExecuteError> {
        self.connection
            .request(&commands::image::SetImageState { hash, confirm })
            .await
            .map(|response| response.images)
    }

    /// Erases an image slot on the device. Slot 1 if omitted.
    pub async fn image_erase(&self, slot: Option<u32>) -> Result<(), ExecuteError> {
        self.connection
            .request(&commands::image::ImageErase { slot })
            .await
            .map(Into::into)
    }

    /// Obtains the list of available image slots.
    pub async fn image_slot_info(
        &self,
    ) -> Result<Vec<commands::image::SlotInfoImage>, ExecuteError> {
        self.connection
            .request(&commands::image::SlotInfo)
            .await
            .map(|response| response.images)
    }

    /// Uploads a firmware image in chunks, following the offsets the
    /// server acknowledges.
    ///
    /// The first request announces length and SHA256 so an interrupted
    /// session resumes where it stopped: the server acknowledges its
    /// current offset and the upload continues from there. Chunks are
    /// sized to the transport's current datagram budget, re-read before
    /// every request; if the device still reports a chunk as too large,
    /// the chunk size is halved and the offset retried.
    ///
    /// # Arguments
    ///
    /// * `image` - The image data.
    /// * `image_num` - The image number to upload to, 0 if `None`.
    /// * `sha` - SHA256 identifying the upload session; computed from
    ///   `image` if `None`.
    /// * `upgrade_only` - Reject the upload unless it is a version upgrade.
    /// * `progress` - Receives (uploaded, total) bytes, returns `false` to
    ///   cancel.
    pub async fn image_upload(
        &self,
        image: &[u8],
        image_num: Option<u32>,
        sha: Option<[u8; 32]>,
        upgrade_only: bool,
        mut progress: Option<&mut dyn FnMut(u64, u64) -> bool>,
    ) -> Result<(), ImageUploadError> {
        let total = image.len() as u64;
        let sha = sha.unwrap_or_else(|| Sha256::digest(image).into());
        let default_timeout = self.connection.request_timeout().await;
        let first_timeout = default_timeout.max(FIRST_UPLOAD_CHUNK_TIMEOUT);

        let mut offset: u64 = 0;
        let mut data_cap = usize::MAX;

        loop {
            let first = offset == 0;
            let mut request = ImageUpload {
                image: if first { Some(image_num.unwrap_or(0)) } else { None },
                len: first.then_some(total),
                off: offset,
                sha: if first { Some(&sha) } else { None },
                data: &[],
                upgrade: (first && upgrade_only).then_some(true),
            };

            let max_unencoded = self.connection.max_unencoded_size().await;
            let max_chunk = image_upload_max_data_chunk_size(&request, max_unencoded)
                .map_err(ImageUploadError::FrameSizeTooSmall)?;
            let chunk_size = max_chunk.min(data_cap).min((total - offset) as usize);
            request.data = &image[offset as usize..offset as usize + chunk_size];

            let timeout = if first { first_timeout } else { default_timeout };
            let response = match self.connection.request_with_timeout(&request, timeout).await {
                Ok(response) => response,
                Err(err) if err.request_too_large() && chunk_size > 1 => {
                    data_cap = (chunk_size / 2).max(1);
                    log::debug!(
                        "device rejected a {chunk_size} byte chunk at offset {offset}, \
                         halving to {data_cap}"
                    );
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            // The server may coalesce or reject partial writes; continue at
            // exactly the offset it acknowledged.
            offset = response.off;

            if let Some(progress) = &mut progress {
                if !progress(offset.min(total), total) {
                    return Err(ImageUploadError::ProgressCallbackError);
                }
            }

            if offset >= total {
                if response.r#match == Some(false) {
                    return Err(ImageUploadError::VerificationFailed);
                }
                log::debug!("upload of {total} bytes complete");
                return Ok(());
            }
        }
    }

    /// Writes a file to the device.
    ///
    /// # Arguments
    ///
    /// * `name` - The full path of the file on the device.
    /// * `data` - The file content.
    /// * `progress` - Receives (transferred, total) bytes, returns `false`
    ///   to cancel.
    pub async fn fs_file_upload(
        &self,
        name: impl AsRef<str>,
        data: &[u8],
        mut progress: Option<&mut dyn FnMut(u64, u64) -> bool>,
    ) -> Result<(), FileUploadError> {
        let name = name.as_ref();
        let total = data.len() as u64;

        let max_unencoded = self.connection.max_unencoded_size().await;
        let chunk_size_max = file_upload_max_data_chunk_size(
            &commands::fs::FileUpload {
                off: u64::MAX,
                data: &[],
                name,
                len: Some(u64::MAX),
            },
            max_unencoded,
        )
        .map_err(FileUploadError::FrameSizeTooSmall)?;

        let mut cancelled = false;
        self.connection
            .request_all(|last: Option<&commands::fs::FileUploadResponse>| {
                let offset = match last {
                    None => 0,
                    Some(response) => response.off,
                };
                if let Some(progress) = &mut progress {
                    if last.is_some() && !progress(offset.min(total), total) {
                        cancelled = true;
                        return None;
                    }
                }
                if last.is_some() && offset >= total {
                    return None;
                }

                let chunk_size = chunk_size_max.min((total - offset) as usize);
                Some(commands::fs::FileUpload {
                    off: offset,
                    data: &data[offset as usize..offset as usize + chunk_size],
                    name,
                    len: (offset == 0).then_some(total),
                })
            })
            .await?;

        if cancelled {
            return Err(FileUploadError::ProgressCallbackError);
        }
        Ok(())
    }

    /// Loads a file from the device.
    ///
    /// # Arguments
    ///
    /// * `name` - The full path of the file on the device.
    /// * `progress` - Receives (transferred, total) bytes, returns `false`
    ///   to cancel.
    pub async fn fs_file_download(
        &self,
        name: impl AsRef<str>,
        mut progress: Option<&mut dyn FnMut(u64, u64) -> bool>,
    ) -> Result<Vec<u8>, FileDownloadError> {
        let name = name.as_ref();

        let response = self
            .connection
            .request(&commands::fs::FileDownload { off: 0, name })
            .await?;
        let total = response.len.ok_or(FileDownloadError::MissingSize)?;
        if response.off != 0 {
            return Err(FileDownloadError::UnexpectedOffset);
        }

        let mut data = response.data;
        if let Some(progress) = &mut progress {
            if !progress(data.len() as u64, total) {
                return Err(FileDownloadError::ProgressCallbackError);
            }
        }

        while (data.len() as u64) < total {
            let response = self
                .connection
                .request(&commands::fs::FileDownload {
                    off: data.len() as u64,
                    name,
                })
                .await?;
            if response.off != data.len() as u64 {
                return Err(FileDownloadError::UnexpectedOffset);
            }
            if response.data.is_empty() {
                return Err(FileDownloadError::SizeMismatch);
            }
            data.extend_from_slice(&response.data);

            if let Some(progress) = &mut progress {
                if !progress(data.len() as u64, total) {
                    return Err(FileDownloadError::ProgressCallbackError);
                }
            }
        }

        if data.len() as u64 != total {
            return Err(FileDownloadError::SizeMismatch);
        }
        Ok(data)
    }

    /// Queries the status of a file.
    pub async fn fs_file_status(
        &self,
        name: impl AsRef<str>,
    ) -> Result<commands::fs::FileStatusResponse, ExecuteError> {
        self.connection
            .request(&commands::fs::FileStatus {
                name: name.as_ref(),
            })
            .await
    }

    /// Computes the hash or checksum of a file on the device.
    ///
    /// For the available algorithms see
    /// [`fs_supported_checksum_types()`](SmpClient::fs_supported_checksum_types).
    pub async fn fs_file_checksum(
        &self,
        name: impl AsRef<str>,
        algorithm: Option<impl AsRef<str>>,
        offset: u64,
        length: Option<u64>,
    ) -> Result<commands::fs::FileChecksumResponse, ExecuteError> {
        self.connection
            .request(&commands::fs::FileChecksum {
                name: name.as_ref(),
                r#type: algorithm.as_ref().map(AsRef::as_ref),
                off: offset,
                len: length,
            })
            .await
    }

    /// Queries which hash and checksum algorithms the device supports.
    pub async fn fs_supported_checksum_types(
        &self,
    ) -> Result<HashMap<String, commands::fs::FileChecksumProperties>, ExecuteError> {
        self.connection
            .request(&commands::fs::SupportedFileChecksumTypes)
            .await
            .map(|response| response.types)
    }

    /// Closes all device files MCUmgr has currently open.
    pub async fn fs_file_close(&self) -> Result<(), ExecuteError> {
        self.connection
            .request(&commands::fs::FileClose)
            .await
            .map(Into::into)
    }

    /// Runs a shell command.
    ///
    /// # Return
    ///
    /// A tuple of (returncode, stdout) produced by the command execution.
    pub async fn shell_execute(&self, argv: &[String]) -> Result<(i32, String), ExecuteError> {
        self.connection
            .request(&commands::shell::ShellCommandLineExecute { argv })
            .await
            .map(|response| (response.ret, response.o))
    }

    /// Fetches the values of one statistics group.
    pub async fn stat_show(
        &self,
        group_name: impl AsRef<str>,
    ) -> Result<HashMap<String, u64>, ExecuteError> {
        self.connection
            .request(&commands::stat::StatisticsShow {
                name: group_name.as_ref(),
            })
            .await
            .map(|response| response.fields)
    }

    /// Lists the statistics groups the device offers.
    pub async fn stat_list_groups(&self) -> Result<Vec<String>, ExecuteError> {
        self.connection
            .request(&commands::stat::StatisticsList)
            .await
            .map(|response| response.stat_list)
    }

    /// Reads the binary value of a setting.
    pub async fn settings_read(
        &self,
        name: impl AsRef<str>,
        max_size: Option<u32>,
    ) -> Result<Vec<u8>, ExecuteError> {
        self.connection
            .request(&commands::settings::SettingsRead {
                name: name.as_ref(),
                max_size,
            })
            .await
            .map(|response| response.val)
    }

    /// Writes the binary value of a setting.
    pub async fn settings_write(
        &self,
        name: impl AsRef<str>,
        value: &[u8],
    ) -> Result<(), ExecuteError> {
        self.connection
            .request(&commands::settings::SettingsWrite {
                name: name.as_ref(),
                val: value,
            })
            .await
            .map(Into::into)
    }

    /// Deletes a setting.
    pub async fn settings_delete(&self, name: impl AsRef<str>) -> Result<(), ExecuteError> {
        self.connection
            .request(&commands::settings::SettingsDelete {
                name: name.as_ref(),
            })
            .await
            .map(Into::into)
    }

    /// Applies settings that were written but not yet taken into use.
    pub async fn settings_commit(&self) -> Result<(), ExecuteError> {
        self.connection
            .request(&commands::settings::SettingsCommit)
            .await
            .map(Into::into)
    }

    /// Reloads all settings from persistent storage.
    pub async fn settings_load(&self) -> Result<(), ExecuteError> {
        self.connection
            .request(&commands::settings::SettingsLoad)
            .await
            .map(Into::into)
    }

    /// Persists the current runtime settings.
    pub async fn settings_save(&self) -> Result<(), ExecuteError> {
        self.connection
            .request(&commands::settings::SettingsSave)
            .await
            .map(Into::into)
    }

    /// Erases the `storage_partition` flash partition.
    pub async fn zephyr_erase_storage(&self) -> Result<(), ExecuteError> {
        self.connection
            .request(&commands::zephyr::EraseStorage)
            .await
            .map(Into::into)
    }

    /// Executes a raw [`commands::McuMgrCommand`].
    ///
    /// Only returns if no error happened, so the caller does not need to
    /// check for an `rc` or `err` field in the response.
    pub async fn raw_command<R: commands::McuMgrCommand>(
        &self,
        command: &R,
    ) -> Result<R::Response, ExecuteError> {
        self.connection.request(command).await
    }

    /// Runs the complete firmware upgrade routine:
    /// upload, mark for test, reset, reconnect and confirm.
    ///
    /// Progress updates are reported through `progress`; see
    /// [`UpgradeSettings`] for the tunables. A link lost while uploading
    /// is reconnected with exponential back-off and the upload resumes at
    /// the offset the device acknowledges.
    pub async fn firmware_upgrade(
        &self,
        firmware: &[u8],
        settings: UpgradeSettings,
        progress: Option<&mut UpgradeProgressCallback<'_>>,
    ) -> Result<(), UpgradeError> {
        upgrade::firmware_upgrade(self, firmware, settings, progress).await
    }
}
