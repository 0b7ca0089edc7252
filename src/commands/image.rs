use serde::{Deserialize, Serialize};

use super::{
    McuMgrCommand, CountingWriter, cbor_integer_size, data_too_large_error,
    macros::{impl_deserialize_from_empty_map_and_into_unit, impl_serialize_as_empty_map},
};
use crate::transport::SMP_HEADER_SIZE;

/// The state of an image slot
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ImageState {
    /// image number
    #[serde(default)]
    pub image: u32,
    /// slot number within "image"
    pub slot: u32,
    /// string representing the image version, as set with `imgtool`
    pub version: String,
    /// SHA256 identifying the image.
    ///
    /// For MCUboot images this is the hash carried in the image TLV
    /// section, which covers the header and body but not the trailing
    /// metadata of the upload file.
    pub hash: Option<[u8; 32]>,
    /// true if the image has the bootable flag set
    #[serde(default)]
    pub bootable: bool,
    /// true if the image is set for the next swap
    #[serde(default)]
    pub pending: bool,
    /// true if the image has been confirmed
    #[serde(default)]
    pub confirmed: bool,
    /// true if the image is the currently running application
    #[serde(default)]
    pub active: bool,
    /// true if the image stays in the primary slot after the next boot
    #[serde(default)]
    pub permanent: bool,
}

/// [Get Image State](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_1.html#get-state-of-images-request) command
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetImageState;
impl_serialize_as_empty_map!(GetImageState);

/// Response for [`GetImageState`] and [`SetImageState`] commands
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ImageStateResponse {
    /// List of all images and their state
    pub images: Vec<ImageState>,
    // splitStatus is not decoded; Zephyr does not use it
}

impl McuMgrCommand for GetImageState {
    type Response = ImageStateResponse;
    const WRITE_OPERATION: bool = false;
    const GROUP_ID: u16 = 1;
    const COMMAND_ID: u8 = 0;
}

/// [Set Image State](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_1.html#set-state-of-image-request) command
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct SetImageState<'a> {
    /// SHA256 identifying the image to operate on.
    ///
    /// May be omitted when `confirm` is `true`, which selects the
    /// currently running image.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "serde_bytes")]
    pub hash: Option<&'a [u8; 32]>,
    /// `true` marks the image as confirmed; `false` schedules a test boot
    /// that reverts on the next hard reset.
    pub confirm: bool,
}

impl McuMgrCommand for SetImageState<'_> {
    type Response = ImageStateResponse;
    const WRITE_OPERATION: bool = true;
    const GROUP_ID: u16 = 1;
    const COMMAND_ID: u8 = 0;
}

/// [Image Upload](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_1.html#image-upload) command
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct ImageUpload<'a, 'b> {
    /// optional image number, assumed 0 when absent.
    ///
    /// Should only be present when `off` is 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<u32>,
    /// total length of the image; must be present when `off` is 0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub len: Option<u64>,
    /// offset of the image chunk this request carries
    pub off: u64,
    /// SHA256 of the whole upload, identifying the upload session.
    ///
    /// Lets the server resume a previously broken session and verify the
    /// complete upload. Should only be present when `off` is 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "serde_bytes")]
    pub sha: Option<&'a [u8; 32]>,
    /// image data to write at `off`
    #[serde(with = "serde_bytes")]
    pub data: &'b [u8],
    /// reject the upload unless the version is higher than the one on the
    /// device. Should only be present when `off` is 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<bool>,
}

/// Response for [`ImageUpload`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ImageUploadResponse {
    /// the offset the server expects next
    pub off: u64,
    /// whether the finished upload matched the announced SHA256
    pub r#match: Option<bool>,
}

impl McuMgrCommand for ImageUpload<'_, '_> {
    type Response = ImageUploadResponse;
    const WRITE_OPERATION: bool = true;
    const GROUP_ID: u16 = 1;
    const COMMAND_ID: u8 = 1;
}

/// Computes how many bytes of [`ImageUpload::data`] fit into one request.
///
/// `request` is the request about to be sent, with `data` still empty; the
/// returned size accounts for the SMP header and the exact CBOR overhead
/// of all other fields.
pub fn image_upload_max_data_chunk_size(
    request: &ImageUpload<'_, '_>,
    max_unencoded_size: usize,
) -> std::io::Result<usize> {
    let mut counter = CountingWriter::new();
    ciborium::into_writer(request, &mut counter).map_err(|_| data_too_large_error())?;

    let available = max_unencoded_size
        .checked_sub(SMP_HEADER_SIZE)
        .and_then(|budget| budget.checked_sub(counter.bytes_written))
        .ok_or_else(data_too_large_error)?;

    // The data byte string grows its CBOR length field with its size.
    let data_size = available.saturating_sub(cbor_integer_size(available));
    if data_size == 0 {
        return Err(data_too_large_error());
    }
    Ok(data_size)
}

/// [Image Erase](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_1.html#image-erase) command
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct ImageErase {
    /// slot number; assumed 1 when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<u32>,
}

/// Response for [`ImageErase`] command
#[derive(Clone, Default, Debug, Eq, PartialEq)]
pub struct ImageEraseResponse;
impl_deserialize_from_empty_map_and_into_unit!(ImageEraseResponse);

impl McuMgrCommand for ImageErase {
    type Response = ImageEraseResponse;
    const WRITE_OPERATION: bool = true;
    const GROUP_ID: u16 = 1;
    const COMMAND_ID: u8 = 5;
}

/// [Slot Info](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_1.html#slot-info) command
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlotInfo;
impl_serialize_as_empty_map!(SlotInfo);

/// Information about a firmware image returned by [`SlotInfo`]
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct SlotInfoImage {
    /// the number of the image
    pub image: u32,
    /// slots available for the image
    pub slots: Vec<SlotInfoImageSlot>,
    /// maximum size of an application uploadable to this image number
    pub max_image_size: Option<u64>,
}

/// Information about a single slot of an image
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct SlotInfoImageSlot {
    /// the slot being enumerated
    pub slot: u32,
    /// the size of the slot
    pub size: u64,
    /// the image ID external tools can use to upload to this slot
    pub upload_image_id: Option<u32>,
}

/// Response for [`SlotInfo`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct SlotInfoResponse {
    /// all image slot collections on the device
    pub images: Vec<SlotInfoImage>,
}

impl McuMgrCommand for SlotInfo {
    type Response = SlotInfoResponse;
    const WRITE_OPERATION: bool = false;
    const GROUP_ID: u16 = 1;
    const COMMAND_ID: u8 = 6;
}
