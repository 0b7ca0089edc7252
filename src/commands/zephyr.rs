use super::{
    McuMgrCommand,
    macros::{impl_deserialize_from_empty_map_and_into_unit, impl_serialize_as_empty_map},
};

/// [Erase Storage](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_63.html#erase-storage-command) command
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EraseStorage;
impl_serialize_as_empty_map!(EraseStorage);

/// Response for [`EraseStorage`] command
#[derive(Clone, Default, Debug, Eq, PartialEq)]
pub struct EraseStorageResponse;
impl_deserialize_from_empty_map_and_into_unit!(EraseStorageResponse);

impl McuMgrCommand for EraseStorage {
    type Response = EraseStorageResponse;
    const WRITE_OPERATION: bool = true;
    const GROUP_ID: u16 = 63;
    const COMMAND_ID: u8 = 0;
}
