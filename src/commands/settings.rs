use serde::{Deserialize, Serialize};

use super::{
    McuMgrCommand,
    macros::{impl_deserialize_from_empty_map_and_into_unit, impl_serialize_as_empty_map},
};

/// [Read Setting](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_3.html#read-write-setting-command) command
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct SettingsRead<'a> {
    /// name of the setting
    pub name: &'a str,
    /// maximum value size the client can accept
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,
}

/// Response for [`SettingsRead`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct SettingsReadResponse {
    /// binary value of the setting
    #[serde(with = "serde_bytes")]
    pub val: Vec<u8>,
    /// maximum supported size, present if smaller than the requested one
    pub max_size: Option<u32>,
}

impl McuMgrCommand for SettingsRead<'_> {
    type Response = SettingsReadResponse;
    const WRITE_OPERATION: bool = false;
    const GROUP_ID: u16 = 3;
    const COMMAND_ID: u8 = 0;
}

/// [Write Setting](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_3.html#read-write-setting-command) command
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct SettingsWrite<'a, 'b> {
    /// name of the setting
    pub name: &'a str,
    /// binary value to store
    #[serde(with = "serde_bytes")]
    pub val: &'b [u8],
}

/// Response for [`SettingsWrite`] command
#[derive(Clone, Default, Debug, Eq, PartialEq)]
pub struct SettingsWriteResponse;
impl_deserialize_from_empty_map_and_into_unit!(SettingsWriteResponse);

impl McuMgrCommand for SettingsWrite<'_, '_> {
    type Response = SettingsWriteResponse;
    const WRITE_OPERATION: bool = true;
    const GROUP_ID: u16 = 3;
    const COMMAND_ID: u8 = 0;
}

/// [Delete Setting](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_3.html#delete-setting-command) command
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct SettingsDelete<'a> {
    /// name of the setting to delete
    pub name: &'a str,
}

/// Response for [`SettingsDelete`] command
#[derive(Clone, Default, Debug, Eq, PartialEq)]
pub struct SettingsDeleteResponse;
impl_deserialize_from_empty_map_and_into_unit!(SettingsDeleteResponse);

impl McuMgrCommand for SettingsDelete<'_> {
    type Response = SettingsDeleteResponse;
    const WRITE_OPERATION: bool = true;
    const GROUP_ID: u16 = 3;
    const COMMAND_ID: u8 = 1;
}

/// [Commit Settings](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_3.html#commit-settings-command) command
///
/// Applies settings that have been written but not yet taken into use.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SettingsCommit;
impl_serialize_as_empty_map!(SettingsCommit);

/// Response for [`SettingsCommit`] command
#[derive(Clone, Default, Debug, Eq, PartialEq)]
pub struct SettingsCommitResponse;
impl_deserialize_from_empty_map_and_into_unit!(SettingsCommitResponse);

impl McuMgrCommand for SettingsCommit {
    type Response = SettingsCommitResponse;
    const WRITE_OPERATION: bool = true;
    const GROUP_ID: u16 = 3;
    const COMMAND_ID: u8 = 2;
}

/// [Load Settings](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_3.html#load-save-settings-command) command
///
/// Reloads all settings from persistent storage.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SettingsLoad;
impl_serialize_as_empty_map!(SettingsLoad);

/// Response for [`SettingsLoad`] command
#[derive(Clone, Default, Debug, Eq, PartialEq)]
pub struct SettingsLoadResponse;
impl_deserialize_from_empty_map_and_into_unit!(SettingsLoadResponse);

impl McuMgrCommand for SettingsLoad {
    type Response = SettingsLoadResponse;
    const WRITE_OPERATION: bool = false;
    const GROUP_ID: u16 = 3;
    const COMMAND_ID: u8 = 3;
}

/// [Save Settings](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_3.html#load-save-settings-command) command
///
/// Persists the current runtime settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SettingsSave;
impl_serialize_as_empty_map!(SettingsSave);

/// Response for [`SettingsSave`] command
#[derive(Clone, Default, Debug, Eq, PartialEq)]
pub struct SettingsSaveResponse;
impl_deserialize_from_empty_map_and_into_unit!(SettingsSaveResponse);

impl McuMgrCommand for SettingsSave {
    type Response = SettingsSaveResponse;
    const WRITE_OPERATION: bool = true;
    const GROUP_ID: u16 = 3;
    const COMMAND_ID: u8 = 3;
}
