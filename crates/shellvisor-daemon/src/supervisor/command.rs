//! Shell command construction for supervised jobs.
//!
//! Every job runs as `<shell> -c <command>` in a fresh process group so the
//! whole tree can be signalled at once.

use std::path::PathBuf;
use std::process::Stdio;

use shellvisor_core::config::SupervisorConfig;
use tokio::process::Command;

/// Private storage directory.
pub const ENV_BASE_DIR: &str = "PREFIX";
/// Native library directory.
pub const ENV_NATIVE_DIR: &str = "NATIVE_DIR";
/// `"true"` when the host targets a platform version at or below the
/// compatibility threshold.
pub const ENV_COMPAT: &str = "FDROID";

/// Builds the `sh -c` invocations for jobs.
#[derive(Debug, Clone)]
pub struct ShellLauncher {
    shell: PathBuf,
    base_dir: PathBuf,
    native_lib_dir: PathBuf,
    init_script: String,
    compat_mode: Option<bool>,
}

impl ShellLauncher {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            base_dir: config.base_dir.clone(),
            native_lib_dir: config.native_lib_dir.clone(),
            init_script: config.init_script.clone(),
            compat_mode: config.compat_mode(),
        }
    }

    /// The text handed to `sh -c`.
    ///
    /// With `use_init_script` the command is passed as arguments to the
    /// sourced init script, which is expected to set up the environment and
    /// run them.
    pub fn effective_command(&self, command: &str, use_init_script: bool) -> String {
        if use_init_script {
            format!("source ${ENV_BASE_DIR}/{} {command}", self.init_script)
        } else {
            command.to_string()
        }
    }

    /// Build a ready-to-spawn command with all three stdio streams piped.
    pub fn command(&self, command: &str, use_init_script: bool) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(self.effective_command(command, use_init_script))
            .env(ENV_BASE_DIR, &self.base_dir)
            .env(ENV_NATIVE_DIR, &self.native_lib_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(compat) = self.compat_mode {
            cmd.env(ENV_COMPAT, compat.to_string());
        }

        // Own process group: stop signals the group, reaching shell descendants.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}
