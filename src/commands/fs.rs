use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_repr::Deserialize_repr;
use strum::Display;

use super::{
    McuMgrCommand, CountingWriter, cbor_integer_size, data_too_large_error, is_default,
    macros::{impl_deserialize_from_empty_map_and_into_unit, impl_serialize_as_empty_map},
};
use crate::transport::SMP_HEADER_SIZE;

/// [File Download](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_8.html#file-download) command
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct FileDownload<'a> {
    /// offset to start the download at
    pub off: u64,
    /// absolute path of the file
    pub name: &'a str,
}

/// Response for [`FileDownload`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct FileDownloadResponse {
    /// offset the response is for
    pub off: u64,
    /// chunk of data read from the file
    pub data: Vec<u8>,
    /// length of the file; only present when `off` is 0
    pub len: Option<u64>,
}

impl McuMgrCommand for FileDownload<'_> {
    type Response = FileDownloadResponse;
    const WRITE_OPERATION: bool = false;
    const GROUP_ID: u16 = 8;
    const COMMAND_ID: u8 = 0;
}

/// [File Upload](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_8.html#file-upload) command
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct FileUpload<'a, 'b> {
    /// offset to continue the upload at
    pub off: u64,
    /// chunk of data to write to the file
    #[serde(with = "serde_bytes")]
    pub data: &'a [u8],
    /// absolute path of the file
    pub name: &'b str,
    /// length of the file; must be present when `off` is 0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub len: Option<u64>,
}

/// Response for [`FileUpload`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct FileUploadResponse {
    /// the offset the server expects next
    pub off: u64,
}

impl McuMgrCommand for FileUpload<'_, '_> {
    type Response = FileUploadResponse;
    const WRITE_OPERATION: bool = true;
    const GROUP_ID: u16 = 8;
    const COMMAND_ID: u8 = 0;
}

/// Computes how many bytes of [`FileUpload::data`] fit into one request.
///
/// `request` is the request about to be sent, with `data` still empty.
pub fn file_upload_max_data_chunk_size(
    request: &FileUpload<'_, '_>,
    max_unencoded_size: usize,
) -> std::io::Result<usize> {
    let mut counter = CountingWriter::new();
    ciborium::into_writer(request, &mut counter).map_err(|_| data_too_large_error())?;

    let available = max_unencoded_size
        .checked_sub(SMP_HEADER_SIZE)
        .and_then(|budget| budget.checked_sub(counter.bytes_written))
        .ok_or_else(data_too_large_error)?;

    let data_size = available.saturating_sub(cbor_integer_size(available));
    if data_size == 0 {
        return Err(data_too_large_error());
    }
    Ok(data_size)
}

/// [File Status](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_8.html#file-status) command
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct FileStatus<'a> {
    /// absolute path of the file
    pub name: &'a str,
}

/// Response for [`FileStatus`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct FileStatusResponse {
    /// length of the file in bytes
    pub len: u64,
}

impl McuMgrCommand for FileStatus<'_> {
    type Response = FileStatusResponse;
    const WRITE_OPERATION: bool = false;
    const GROUP_ID: u16 = 8;
    const COMMAND_ID: u8 = 1;
}

/// [File Hash/Checksum](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_8.html#file-hash-checksum) command
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct FileChecksum<'a, 'b> {
    /// absolute path of the file
    pub name: &'a str,
    /// hash or checksum algorithm; the device default when `None`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<&'b str>,
    /// offset to start the calculation at
    #[serde(skip_serializing_if = "is_default")]
    pub off: u64,
    /// how many bytes to read after `off`; the whole file when `None`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub len: Option<u64>,
}

/// Hash data of a [`FileChecksumResponse`]
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum FileChecksumData {
    /// hash bytes
    Hash(#[serde(with = "serde_bytes")] Vec<u8>),
    /// checksum integer
    Checksum(u32),
}

impl FileChecksumData {
    /// Renders the hash or checksum as a hex string
    pub fn hex(&self) -> String {
        match self {
            FileChecksumData::Hash(data) => hex::encode(data),
            FileChecksumData::Checksum(value) => format!("{value:08x}"),
        }
    }
}

/// Response for [`FileChecksum`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct FileChecksumResponse {
    /// the algorithm that was used
    pub r#type: String,
    /// offset the calculation started at
    #[serde(default)]
    pub off: u64,
    /// number of input bytes
    pub len: u64,
    /// the resulting hash or checksum
    pub output: FileChecksumData,
}

impl McuMgrCommand for FileChecksum<'_, '_> {
    type Response = FileChecksumResponse;
    const WRITE_OPERATION: bool = false;
    const GROUP_ID: u16 = 8;
    const COMMAND_ID: u8 = 2;
}

/// [Supported file hash/checksum types](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_8.html#supported-file-hash-checksum-types) command
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SupportedFileChecksumTypes;
impl_serialize_as_empty_map!(SupportedFileChecksumTypes);

/// Output format of a hash/checksum type
#[derive(Display, Deserialize_repr, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum FileChecksumDataFormat {
    /// the algorithm outputs a number
    Numerical = 0,
    /// the algorithm outputs a byte array
    ByteArray = 1,
}

/// Properties of a hash/checksum algorithm
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct FileChecksumProperties {
    /// output format of the algorithm
    pub format: FileChecksumDataFormat,
    /// output size in bytes
    pub size: u32,
}

/// Response for [`SupportedFileChecksumTypes`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct SupportedFileChecksumTypesResponse {
    /// names and properties of the available algorithms
    pub types: HashMap<String, FileChecksumProperties>,
}

impl McuMgrCommand for SupportedFileChecksumTypes {
    type Response = SupportedFileChecksumTypesResponse;
    const WRITE_OPERATION: bool = false;
    const GROUP_ID: u16 = 8;
    const COMMAND_ID: u8 = 3;
}

/// [File Close](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_8.html#file-close) command
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileClose;
impl_serialize_as_empty_map!(FileClose);

/// Response for [`FileClose`] command
#[derive(Clone, Default, Debug, Eq, PartialEq)]
pub struct FileCloseResponse;
impl_deserialize_from_empty_map_and_into_unit!(FileCloseResponse);

impl McuMgrCommand for FileClose {
    type Response = FileCloseResponse;
    const WRITE_OPERATION: bool = true;
    const GROUP_ID: u16 = 8;
    const COMMAND_ID: u8 = 4;
}
