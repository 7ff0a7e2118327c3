//! Shell invocation shared by processor verification and execution.

use std::path::Path;
use tokio::process::Command;

/// Prefix of the variables a processor reads its classification from.
pub const PROCESSOR_ENV_PREFIX: &str = "P_";

/// Builds `sh -c <command>` running in `working_directory`.
///
/// Inherited `P_*` variables are removed so a processor only ever sees the
/// values set for the unit it is working on.
pub(crate) fn shell_command(command: &str, working_directory: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(working_directory);
    for (name, _) in std::env::vars_os() {
        if name
            .to_str()
            .is_some_and(|n| n.starts_with(PROCESSOR_ENV_PREFIX))
        {
            cmd.env_remove(name);
        }
    }
    cmd.kill_on_drop(true);
    cmd
}
