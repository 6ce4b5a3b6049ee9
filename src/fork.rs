// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::Error;

/// Everything needed to exec the child, built once per launch and never mutated after
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// The complete environment of the child, nothing is inherited beyond this
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

impl fmt::Display for Invocation {
    /// Shell-ish rendering for logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " '{}'", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

pub struct StdIoConf {
    pub stdin: Stdio,
    pub stderr: Stdio,
    pub stdout: Stdio,
}

impl StdIoConf {
    pub fn inherit() -> Self {
        StdIoConf {
            stdin: Stdio::inherit(),
            stderr: Stdio::inherit(),
            stdout: Stdio::inherit(),
        }
    }
}

/// How the child is attached to the supervisor
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpawnMode {
    /// Start the child in its own session, so the supervisor exiting leaves it alive
    pub detach: bool,
    /// Descriptor in the supervisor that becomes the child's notification channel
    #[cfg(unix)]
    pub channel_fd: Option<std::os::unix::io::RawFd>,
}

/// Spawns the child, nothing here retries
pub fn new_process(
    invocation: &Invocation,
    stdio: StdIoConf,
    mode: SpawnMode,
) -> Result<Child, Error> {
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .env_clear()
        .envs(&invocation.env)
        .current_dir(&invocation.cwd)
        .stdin(stdio.stdin)
        .stdout(stdio.stdout)
        .stderr(stdio.stderr);

    #[cfg(unix)]
    {
        let detach = mode.detach;
        let channel_fd = mode.channel_fd;
        if detach || channel_fd.is_some() {
            // SAFETY: runs between fork and exec and only issues async-signal-safe syscalls
            unsafe {
                command.pre_exec(move || {
                    if detach {
                        nix::unistd::setsid()?;
                    }
                    if let Some(fd) = channel_fd {
                        crate::control::install_at(fd, crate::control::CHILD_CHANNEL_FD)?;
                    }
                    Ok(())
                });
            }
        }
    }

    #[cfg(windows)]
    {
        if mode.detach {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS);
        }
    }

    let child = command
        .spawn()
        .map_err(|err| Error::spawn_failed(invocation.program.to_string_lossy(), err))?;

    tracing::debug!(pid = ?child.id(), detach = mode.detach, "spawned child");
    Ok(child)
}
