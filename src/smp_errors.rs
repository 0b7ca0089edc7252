use strum_macros::{Display, FromRepr};

use crate::SmpGroup;

/// Errors the device can respond with when executing an SMP command.
///
/// SMP version 1 responses carry a global `rc` code; version 2 responses
/// carry a group-scoped `err = {group, rc}` pair. See the
/// [minimal response documentation](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_protocol.html#minimal-response-smp-data).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeviceError {
    /// MCUmgr SMP v1 error code
    V1 {
        /// Error code
        rc: i32,
    },
    /// MCUmgr SMP v2 group-based error code
    V2 {
        /// Group id the code belongs to
        group: u16,
        /// Group-scoped error code
        rc: i32,
    },
}

impl DeviceError {
    /// Whether the device rejected the command as not supported.
    pub fn command_not_supported(&self) -> bool {
        match self {
            DeviceError::V1 { rc } => *rc == MgmtErr::MGMT_ERR_ENOTSUP as i32,
            DeviceError::V2 { .. } => false,
        }
    }

    /// Whether the device rejected the request because it was too large
    /// for its transport buffers.
    ///
    /// Devices report this as `MGMT_ERR_EMSGSIZE`; older servers return
    /// `MGMT_ERR_ENOMEM` when the CBOR payload does not fit.
    pub fn request_too_large(&self) -> bool {
        match self {
            DeviceError::V1 { rc } => {
                *rc == MgmtErr::MGMT_ERR_EMSGSIZE as i32 || *rc == MgmtErr::MGMT_ERR_ENOMEM as i32
            }
            DeviceError::V2 { .. } => false,
        }
    }
}

fn v2_err_to_string(group: u16, rc: i32) -> Option<String> {
    match SmpGroup::from_repr(group)? {
        SmpGroup::MGMT_GROUP_ID_OS => OsMgmtErrCode::from_repr(rc).map(|x| x.to_string()),
        SmpGroup::MGMT_GROUP_ID_IMAGE => ImgMgmtErrCode::from_repr(rc).map(|x| x.to_string()),
        SmpGroup::MGMT_GROUP_ID_STAT => StatMgmtErrCode::from_repr(rc).map(|x| x.to_string()),
        SmpGroup::MGMT_GROUP_ID_SETTINGS => {
            SettingsMgmtRetCode::from_repr(rc).map(|x| x.to_string())
        }
        SmpGroup::MGMT_GROUP_ID_FS => FsMgmtErrCode::from_repr(rc).map(|x| x.to_string()),
        SmpGroup::MGMT_GROUP_ID_SHELL => ShellMgmtErrCode::from_repr(rc).map(|x| x.to_string()),
        SmpGroup::ZEPHYR_MGMT_GRP_BASIC => {
            ZephyrBasicGroupErrCode::from_repr(rc).map(|x| x.to_string())
        }
        _ => None,
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::V1 { rc } => write!(f, "{}", MgmtErr::err_to_string(*rc)),
            DeviceError::V2 { group, rc } => match v2_err_to_string(*group, *rc) {
                Some(msg) => f.write_str(&msg),
                None => write!(f, "group={group},rc={rc}"),
            },
        }
    }
}

/// See [`enum mcumgr_err_t`](https://docs.zephyrproject.org/latest/doxygen/html/mgmt__defines_8h.html).
#[derive(FromRepr, Display, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
#[allow(non_camel_case_types)]
#[allow(missing_docs)]
pub enum MgmtErr {
    /// No error (success)
    MGMT_ERR_EOK = 0,
    /// Unknown error
    MGMT_ERR_EUNKNOWN,
    /// Insufficient memory, usually not enough space for the CBOR object
    MGMT_ERR_ENOMEM,
    /// Error in input value
    MGMT_ERR_EINVAL,
    /// Operation timed out
    MGMT_ERR_ETIMEOUT,
    /// No such file or entry
    MGMT_ERR_ENOENT,
    /// Current state disallows the command
    MGMT_ERR_EBADSTATE,
    /// Response or request too large
    MGMT_ERR_EMSGSIZE,
    /// Command not supported
    MGMT_ERR_ENOTSUP,
    /// Corrupt payload
    MGMT_ERR_ECORRUPT,
    /// Command blocked by the processing of another command
    MGMT_ERR_EBUSY,
    /// Access to the function, command or resource denied
    MGMT_ERR_EACCESSDENIED,
    /// Requested SMP protocol version is too old
    MGMT_ERR_UNSUPPORTED_TOO_OLD,
    /// Requested SMP protocol version is too new
    MGMT_ERR_UNSUPPORTED_TOO_NEW,
    /// User errors are defined from 256 onwards
    MGMT_ERR_EPERUSER = 256,
}

impl MgmtErr {
    /// Converts a raw error code to a string
    pub fn err_to_string(err: i32) -> String {
        const PERUSER: MgmtErr = MgmtErr::MGMT_ERR_EPERUSER;
        if err < PERUSER as i32 {
            if let Some(err_enum) = Self::from_repr(err) {
                format!("{err_enum}")
            } else {
                format!("MGMT_ERR_UNKNOWN({err})")
            }
        } else {
            format!("{PERUSER}({err})")
        }
    }
}

/// See `enum os_mgmt_err_code_t`.
#[derive(FromRepr, Display, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
#[allow(non_camel_case_types)]
#[allow(missing_docs)]
pub enum OsMgmtErrCode {
    OS_MGMT_ERR_OK = 0,
    OS_MGMT_ERR_UNKNOWN,
    OS_MGMT_ERR_INVALID_FORMAT,
    OS_MGMT_ERR_QUERY_YIELDS_NO_ANSWER,
    OS_MGMT_ERR_RTC_NOT_SET,
    OS_MGMT_ERR_RTC_COMMAND_FAILED,
    OS_MGMT_ERR_QUERY_RESPONSE_VALUE_NOT_VALID,
}

/// See `enum img_mgmt_err_code_t`.
#[derive(FromRepr, Display, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
#[allow(non_camel_case_types)]
#[allow(missing_docs)]
pub enum ImgMgmtErrCode {
    IMG_MGMT_ERR_OK = 0,
    IMG_MGMT_ERR_UNKNOWN,
    IMG_MGMT_ERR_FLASH_CONFIG_QUERY_FAIL,
    IMG_MGMT_ERR_NO_IMAGE,
    IMG_MGMT_ERR_NO_TLVS,
    IMG_MGMT_ERR_INVALID_TLV,
    IMG_MGMT_ERR_TLV_MULTIPLE_HASHES_FOUND,
    IMG_MGMT_ERR_TLV_INVALID_SIZE,
    IMG_MGMT_ERR_HASH_NOT_FOUND,
    IMG_MGMT_ERR_NO_FREE_SLOT,
    IMG_MGMT_ERR_FLASH_OPEN_FAILED,
    IMG_MGMT_ERR_FLASH_READ_FAILED,
    IMG_MGMT_ERR_FLASH_WRITE_FAILED,
    IMG_MGMT_ERR_FLASH_ERASE_FAILED,
    IMG_MGMT_ERR_INVALID_SLOT,
    IMG_MGMT_ERR_NO_FREE_MEMORY,
    IMG_MGMT_ERR_FLASH_CONTEXT_ALREADY_SET,
    IMG_MGMT_ERR_FLASH_CONTEXT_NOT_SET,
    IMG_MGMT_ERR_FLASH_AREA_DEVICE_NULL,
    IMG_MGMT_ERR_INVALID_PAGE_OFFSET,
    IMG_MGMT_ERR_INVALID_OFFSET,
    IMG_MGMT_ERR_INVALID_LENGTH,
    IMG_MGMT_ERR_INVALID_IMAGE_HEADER,
    IMG_MGMT_ERR_INVALID_IMAGE_HEADER_MAGIC,
    IMG_MGMT_ERR_INVALID_HASH,
    IMG_MGMT_ERR_INVALID_FLASH_ADDRESS,
    IMG_MGMT_ERR_VERSION_GET_FAILED,
    IMG_MGMT_ERR_CURRENT_VERSION_IS_NEWER,
    IMG_MGMT_ERR_IMAGE_ALREADY_PENDING,
    IMG_MGMT_ERR_INVALID_IMAGE_VECTOR_TABLE,
    IMG_MGMT_ERR_INVALID_IMAGE_TOO_LARGE,
    IMG_MGMT_ERR_INVALID_IMAGE_DATA_OVERRUN,
    IMG_MGMT_ERR_IMAGE_CONFIRMATION_DENIED,
    IMG_MGMT_ERR_IMAGE_SETTING_TEST_TO_ACTIVE_DENIED,
    IMG_MGMT_ERR_ACTIVE_SLOT_NOT_KNOWN,
}

/// See `enum stat_mgmt_err_code_t`.
#[derive(FromRepr, Display, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
#[allow(non_camel_case_types)]
#[allow(missing_docs)]
pub enum StatMgmtErrCode {
    STAT_MGMT_ERR_OK = 0,
    STAT_MGMT_ERR_UNKNOWN,
    STAT_MGMT_ERR_INVALID_GROUP,
    STAT_MGMT_ERR_INVALID_STAT_NAME,
    STAT_MGMT_ERR_INVALID_STAT_SIZE,
    STAT_MGMT_ERR_WALK_ABORTED,
}

/// See `enum settings_mgmt_ret_code_t`.
#[derive(FromRepr, Display, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
#[allow(non_camel_case_types)]
#[allow(missing_docs)]
pub enum SettingsMgmtRetCode {
    SETTINGS_MGMT_ERR_OK = 0,
    SETTINGS_MGMT_ERR_UNKNOWN,
    SETTINGS_MGMT_ERR_KEY_TOO_LONG,
    SETTINGS_MGMT_ERR_KEY_NOT_FOUND,
    SETTINGS_MGMT_ERR_READ_NOT_SUPPORTED,
    SETTINGS_MGMT_ERR_ROOT_KEY_NOT_FOUND,
    SETTINGS_MGMT_ERR_WRITE_NOT_SUPPORTED,
    SETTINGS_MGMT_ERR_DELETE_NOT_SUPPORTED,
    SETTINGS_MGMT_ERR_SAVE_NOT_SUPPORTED,
}

/// See `enum fs_mgmt_err_code_t`.
#[derive(FromRepr, Display, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
#[allow(non_camel_case_types)]
#[allow(missing_docs)]
pub enum FsMgmtErrCode {
    FS_MGMT_ERR_OK = 0,
    FS_MGMT_ERR_UNKNOWN,
    FS_MGMT_ERR_FILE_INVALID_NAME,
    FS_MGMT_ERR_FILE_NOT_FOUND,
    FS_MGMT_ERR_FILE_IS_DIRECTORY,
    FS_MGMT_ERR_FILE_OPEN_FAILED,
    FS_MGMT_ERR_FILE_SEEK_FAILED,
    FS_MGMT_ERR_FILE_READ_FAILED,
    FS_MGMT_ERR_FILE_TRUNCATE_FAILED,
    FS_MGMT_ERR_FILE_DELETE_FAILED,
    FS_MGMT_ERR_FILE_WRITE_FAILED,
    FS_MGMT_ERR_FILE_OFFSET_NOT_VALID,
    FS_MGMT_ERR_FILE_OFFSET_LARGER_THAN_FILE,
    FS_MGMT_ERR_CHECKSUM_HASH_NOT_FOUND,
    FS_MGMT_ERR_MOUNT_POINT_NOT_FOUND,
    FS_MGMT_ERR_READ_ONLY_FILESYSTEM,
    FS_MGMT_ERR_FILE_EMPTY,
}

/// See `enum shell_mgmt_err_code_t`.
#[derive(FromRepr, Display, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
#[allow(non_camel_case_types)]
#[allow(missing_docs)]
pub enum ShellMgmtErrCode {
    SHELL_MGMT_ERR_OK = 0,
    SHELL_MGMT_ERR_UNKNOWN,
    SHELL_MGMT_ERR_COMMAND_TOO_LONG,
    SHELL_MGMT_ERR_EMPTY_COMMAND,
}

/// See `enum zephyr_basic_group_err_code_t`.
#[derive(FromRepr, Display, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
#[allow(non_camel_case_types)]
#[allow(missing_docs)]
pub enum ZephyrBasicGroupErrCode {
    ZEPHYRBASIC_MGMT_ERR_OK = 0,
    ZEPHYRBASIC_MGMT_ERR_UNKNOWN,
    ZEPHYRBASIC_MGMT_ERR_FLASH_OPEN_FAILED,
    ZEPHYRBASIC_MGMT_ERR_FLASH_CONFIG_QUERY_FAIL,
    ZEPHYRBASIC_MGMT_ERR_FLASH_ERASE_FAILED,
}
