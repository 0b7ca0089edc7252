use std::collections::HashMap;

use chrono::Timelike;
use serde::{Deserialize, Serialize};

use super::{
    McuMgrCommand, is_default,
    macros::{impl_deserialize_from_empty_map_and_into_unit, impl_serialize_as_empty_map},
};

/// [Echo](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_0.html#echo-command) command
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct Echo<'a> {
    /// string to be replied by the echo service
    pub d: &'a str,
}

/// Response for [`Echo`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct EchoResponse {
    /// replying echo string
    pub r: String,
}

impl McuMgrCommand for Echo<'_> {
    type Response = EchoResponse;
    const WRITE_OPERATION: bool = true;
    const GROUP_ID: u16 = 0;
    const COMMAND_ID: u8 = 0;
}

/// [Task statistics](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_0.html#task-statistics-command) command
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskStatistics;
impl_serialize_as_empty_map!(TaskStatistics);

/// Statistics of an MCU task/thread
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct TaskStatisticsEntry {
    /// task priority
    pub prio: i32,
    /// numeric task ID
    pub tid: u32,
    /// numeric task state
    pub state: u32,
    /// stack usage, reported by Zephyr as 4-byte words
    pub stkuse: Option<u64>,
    /// stack size, reported by Zephyr as 4-byte words
    pub stksiz: Option<u64>,
    /// context switch count
    pub cswcnt: Option<u64>,
    /// runtime in ticks
    pub runtime: Option<u64>,
}

/// Response for [`TaskStatistics`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct TaskStatisticsResponse {
    /// task names with their respective statistics
    pub tasks: HashMap<String, TaskStatisticsEntry>,
}

impl McuMgrCommand for TaskStatistics {
    type Response = TaskStatisticsResponse;
    const WRITE_OPERATION: bool = false;
    const GROUP_ID: u16 = 0;
    const COMMAND_ID: u8 = 2;
}

/// Parses a [`chrono::NaiveDateTime`], tolerating a timezone suffix.
fn deserialize_datetime_and_ignore_timezone<'de, D>(
    de: D,
) -> Result<chrono::NaiveDateTime, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NaiveOrFixed {
        Naive(chrono::NaiveDateTime),
        Fixed(chrono::DateTime<chrono::FixedOffset>),
    }

    NaiveOrFixed::deserialize(de).map(|val| match val {
        NaiveOrFixed::Naive(naive_date_time) => naive_date_time,
        NaiveOrFixed::Fixed(date_time) => date_time.naive_local(),
    })
}

/// Serializes a [`chrono::NaiveDateTime`] with zero or three fractional
/// digits, the two formats Zephyr accepts.
fn serialize_datetime_for_zephyr<S>(
    value: &chrono::NaiveDateTime,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    if value.time().nanosecond() != 0 {
        serializer.serialize_str(&format!("{}", value.format("%Y-%m-%dT%H:%M:%S%.3f")))
    } else {
        serializer.serialize_str(&format!("{}", value.format("%Y-%m-%dT%H:%M:%S")))
    }
}

/// [Date-Time Get](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_0.html#date-time-get) command
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DateTimeGet;
impl_serialize_as_empty_map!(DateTimeGet);

/// Response for [`DateTimeGet`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct DateTimeGetResponse {
    /// String in format `yyyy-MM-dd'T'HH:mm:ss.SSS`
    #[serde(deserialize_with = "deserialize_datetime_and_ignore_timezone")]
    pub datetime: chrono::NaiveDateTime,
}

impl McuMgrCommand for DateTimeGet {
    type Response = DateTimeGetResponse;
    const WRITE_OPERATION: bool = false;
    const GROUP_ID: u16 = 0;
    const COMMAND_ID: u8 = 4;
}

/// [Date-Time Set](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_0.html#date-time-set) command
#[derive(Clone, Serialize, Debug, Eq, PartialEq)]
pub struct DateTimeSet {
    /// String in format `yyyy-MM-dd'T'HH:mm:ss.SSS`
    #[serde(serialize_with = "serialize_datetime_for_zephyr")]
    pub datetime: chrono::NaiveDateTime,
}

/// Response for [`DateTimeSet`] command
#[derive(Clone, Default, Debug, Eq, PartialEq)]
pub struct DateTimeSetResponse;
impl_deserialize_from_empty_map_and_into_unit!(DateTimeSetResponse);

impl McuMgrCommand for DateTimeSet {
    type Response = DateTimeSetResponse;
    const WRITE_OPERATION: bool = true;
    const GROUP_ID: u16 = 0;
    const COMMAND_ID: u8 = 4;
}

/// [System Reset](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_0.html#system-reset) command
#[derive(Clone, Serialize, Debug, Eq, PartialEq)]
pub struct SystemReset {
    /// Forces reset even if the application vetoes it
    #[serde(skip_serializing_if = "is_default")]
    pub force: bool,
    /// Boot mode
    ///
    /// - 0: Normal boot
    /// - 1: Bootloader recovery mode
    ///
    /// Only honored if `MCUMGR_GRP_OS_RESET_BOOT_MODE` is enabled on the
    /// device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_mode: Option<u8>,
}

/// Response for [`SystemReset`] command
#[derive(Clone, Default, Debug, Eq, PartialEq)]
pub struct SystemResetResponse;
impl_deserialize_from_empty_map_and_into_unit!(SystemResetResponse);

impl McuMgrCommand for SystemReset {
    type Response = SystemResetResponse;
    const WRITE_OPERATION: bool = true;
    const GROUP_ID: u16 = 0;
    const COMMAND_ID: u8 = 5;
}

/// [MCUmgr Parameters](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_0.html#mcumgr-parameters) command
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct McuMgrParameters;
impl_serialize_as_empty_map!(McuMgrParameters);

/// Response for [`McuMgrParameters`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct McuMgrParametersResponse {
    /// Single SMP buffer size, including the SMP header and CBOR payload
    pub buf_size: u32,
    /// Number of SMP buffers supported
    pub buf_count: u32,
}

impl McuMgrCommand for McuMgrParameters {
    type Response = McuMgrParametersResponse;
    const WRITE_OPERATION: bool = false;
    const GROUP_ID: u16 = 0;
    const COMMAND_ID: u8 = 6;
}

/// [OS/Application Info](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_0.html#os-application-info) command
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct ApplicationInfo<'a> {
    /// Format specifier, `uname`-style; `None` for the kernel name only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<&'a str>,
}

/// Response for [`ApplicationInfo`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ApplicationInfoResponse {
    /// Text response formatted according to the request
    pub output: String,
}

impl McuMgrCommand for ApplicationInfo<'_> {
    type Response = ApplicationInfoResponse;
    const WRITE_OPERATION: bool = false;
    const GROUP_ID: u16 = 0;
    const COMMAND_ID: u8 = 7;
}

/// [Bootloader Information](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_0.html#bootloader-information) command
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootloaderInfo;
impl_serialize_as_empty_map!(BootloaderInfo);

/// Response for [`BootloaderInfo`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct BootloaderInfoResponse {
    /// Name of the bootloader, e.g. "MCUboot"
    pub bootloader: String,
}

impl McuMgrCommand for BootloaderInfo {
    type Response = BootloaderInfoResponse;
    const WRITE_OPERATION: bool = false;
    const GROUP_ID: u16 = 0;
    const COMMAND_ID: u8 = 8;
}

/// [Bootloader Information](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_0.html#bootloader-information) `mode` query for MCUboot
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootloaderInfoMcubootMode;

impl Serialize for BootloaderInfoMcubootMode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("query", "mode")?;
        map.end()
    }
}

/// Response for [`BootloaderInfoMcubootMode`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct BootloaderInfoMcubootModeResponse {
    /// MCUboot application mode (overwrite-only, swap, direct-XIP, ...)
    pub mode: i32,
    /// Whether MCUboot was built with downgrade prevention
    #[serde(default)]
    pub no_downgrade: bool,
}

impl McuMgrCommand for BootloaderInfoMcubootMode {
    type Response = BootloaderInfoMcubootModeResponse;
    const WRITE_OPERATION: bool = false;
    const GROUP_ID: u16 = 0;
    const COMMAND_ID: u8 = 8;
}
