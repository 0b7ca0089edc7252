/// [File management](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_8.html) group commands
pub mod fs;
/// [Application/software image management](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_1.html) group commands
pub mod image;
/// [Default/OS management](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_0.html) group commands
pub mod os;
/// [Settings management](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_3.html) group commands
pub mod settings;
/// [Shell management](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_9.html) group commands
pub mod shell;
/// [Statistics management](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_2.html) group commands
pub mod stat;
/// [Zephyr management](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_63.html) group commands
pub mod zephyr;

mod macros;

use serde::{Deserialize, Serialize};

/// SMP version 2 group based error message
#[derive(Debug, Deserialize, Eq, PartialEq)]
pub struct ErrResponseV2 {
    /// group of the group-based error code
    pub group: u16,
    /// index of the group-based error code
    pub rc: i32,
}

/// [SMP error message](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_protocol.html#minimal-response-smp-data)
#[derive(Debug, Deserialize, Eq, PartialEq)]
pub struct ErrResponse {
    /// SMP version 1 error code
    pub rc: Option<i32>,
    /// SMP version 1 error string
    pub rsn: Option<String>,
    /// SMP version 2 error message
    pub err: Option<ErrResponseV2>,
}

/// An SMP command that can be executed through
/// [`Connection::request`](crate::connection::Connection::request).
///
/// The command value itself is the CBOR payload of the request.
pub trait McuMgrCommand: Serialize {
    /// the response type of the command
    type Response: for<'a> Deserialize<'a>;
    /// whether this command is a write (`true`) or read (`false`) operation
    const WRITE_OPERATION: bool;
    /// the group ID of the command
    const GROUP_ID: u16;
    /// the command ID within the group
    const COMMAND_ID: u8;
}

/// Checks if a value is the default value
fn is_default<T: Default + PartialEq>(val: &T) -> bool {
    val == &T::default()
}

/// A CBOR sink that only counts how many bytes would be written.
///
/// Used by the `*_max_data_chunk_size` helpers to measure the exact CBOR
/// overhead of an upload request without allocating it.
pub(crate) struct CountingWriter {
    pub(crate) bytes_written: usize,
}

impl CountingWriter {
    pub(crate) fn new() -> Self {
        Self { bytes_written: 0 }
    }
}

impl std::io::Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes_written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub(crate) fn data_too_large_error() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "frame size too small to carry any data",
    )
}

/// The number of bytes CBOR needs to encode `value` in addition to the
/// initial byte. Values below 24 are packed into the initial byte itself.
pub(crate) fn cbor_integer_size(value: usize) -> usize {
    if value < 24 {
        0
    } else if value <= u8::MAX as usize {
        1
    } else if value <= u16::MAX as usize {
        2
    } else if value <= u32::MAX as usize {
        4
    } else {
        8
    }
}
