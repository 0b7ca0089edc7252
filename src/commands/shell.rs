use serde::{Deserialize, Serialize};

use super::McuMgrCommand;

/// [Shell command line execute](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_9.html#shell-command-line-execute) command
#[derive(Clone, Debug, Serialize)]
pub struct ShellCommandLineExecute<'a> {
    /// command and its arguments
    pub argv: &'a [String],
}

/// Response for [`ShellCommandLineExecute`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ShellCommandLineExecuteResponse {
    /// command output
    pub o: String,
    /// return code of the command
    pub ret: i32,
}

impl McuMgrCommand for ShellCommandLineExecute<'_> {
    type Response = ShellCommandLineExecuteResponse;
    const WRITE_OPERATION: bool = true;
    const GROUP_ID: u16 = 9;
    const COMMAND_ID: u8 = 0;
}

#[cfg(test)]
mod tests {
    use super::super::macros::command_encode_decode_test;
    use super::*;
    use ciborium::cbor;

    command_encode_decode_test! {
        shell_execute,
        (2, 9, 0),
        ShellCommandLineExecute{
            argv: &[
                "kernel".to_string(),
                "uptime".to_string(),
            ],
        },
        cbor!({
            "argv" => ["kernel", "uptime"]
        }),
        cbor!({
            "o" => "Uptime: 120244 ms\n",
            "ret" => 0
        }),
        ShellCommandLineExecuteResponse{
            o: "Uptime: 120244 ms\n".to_string(),
            ret: 0,
        },
    }
}
