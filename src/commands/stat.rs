use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{McuMgrCommand, macros::impl_serialize_as_empty_map};

/// [Statistics: show a group](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_2.html) command
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct StatisticsShow<'a> {
    /// name of the statistics group to fetch
    pub name: &'a str,
}

/// Response for [`StatisticsShow`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct StatisticsShowResponse {
    /// name of the statistics group
    pub name: String,
    /// statistic names with their values
    pub fields: HashMap<String, u64>,
}

impl McuMgrCommand for StatisticsShow<'_> {
    type Response = StatisticsShowResponse;
    const WRITE_OPERATION: bool = false;
    const GROUP_ID: u16 = 2;
    const COMMAND_ID: u8 = 0;
}

/// [Statistics: list groups](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_2.html) command
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatisticsList;
impl_serialize_as_empty_map!(StatisticsList);

/// Response for [`StatisticsList`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct StatisticsListResponse {
    /// names of the available statistics groups
    pub stat_list: Vec<String>,
}

impl McuMgrCommand for StatisticsList {
    type Response = StatisticsListResponse;
    const WRITE_OPERATION: bool = false;
    const GROUP_ID: u16 = 2;
    const COMMAND_ID: u8 = 1;
}
