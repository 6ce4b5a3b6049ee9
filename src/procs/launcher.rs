// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::ffi::OsString;

use crate::config::LaunchConfig;
use crate::fork::Invocation;
use crate::Error;

#[cfg(unix)]
use {
    crate::control::{AsyncCtlEnd, Control, CtlEnd, Read, Write},
    crate::fork::{new_process, SpawnMode, StdIoConf},
    crate::procs::logger,
    std::os::unix::io::AsRawFd,
    std::process::Stdio,
    tokio::process::Child,
};

/// `<runtime flags> <entry script> <cluster options json> --title=<title>`
pub fn build_invocation(config: &LaunchConfig) -> Result<Invocation, Error> {
    let mut args: Vec<OsString> = config.extra_args.iter().map(OsString::from).collect();
    args.push(config.entry_script.clone().into_os_string());
    args.push(config.cluster_options_json()?.into());
    args.push(format!("--title={}", config.title).into());

    Ok(Invocation {
        program: config.executable.clone(),
        args,
        env: config.environment.clone(),
        cwd: config.base_dir.clone(),
    })
}

/// Spawns the cluster master
///
/// Rules:
/// - spawns exactly one process per launch, never retries
/// - a daemon gets fresh log files, no stdin and its own session
/// - the child always gets the notification channel
#[derive(Debug)]
pub struct Launcher {
    config: LaunchConfig,
}

/// A running master together with its end of the notification channel
#[cfg(unix)]
pub struct LaunchHandle {
    pub child: Child,
    pub notifications: AsyncCtlEnd<Read>,
}

impl Launcher {
    pub fn new(config: LaunchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn invocation(&self) -> Result<Invocation, Error> {
        build_invocation(&self.config)
    }

    /// Must be called within a tokio runtime
    #[cfg(unix)]
    pub fn launch(&self) -> Result<LaunchHandle, Error> {
        let mut invocation = self.invocation()?;
        for (key, value) in CtlEnd::<Write>::child_env().iter() {
            invocation.env.insert(key.to_string(), value.clone());
        }

        let stdio = self.get_stdio()?;
        let (read, write) = Control::new()?.split();
        let mode = SpawnMode {
            detach: self.config.daemon,
            channel_fd: Some(write.as_raw_fd()),
        };

        tracing::info!("Spawn {invocation}");
        let child = new_process(&invocation, stdio, mode)?;
        // only the child may hold the write end, otherwise the channel never reports closed
        drop(write);

        Ok(LaunchHandle {
            child,
            notifications: read.into_async_ctl_end()?,
        })
    }

    #[cfg(unix)]
    fn get_stdio(&self) -> Result<StdIoConf, Error> {
        if !self.config.daemon {
            return Ok(StdIoConf::inherit());
        }

        tracing::info!(
            stdout = %self.config.stdout.display(),
            stderr = %self.config.stderr.display(),
            "Save log file to {}",
            self.config
                .stdout
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        );
        let stdout = logger::open_rotated(&self.config.stdout)?;
        let stderr = logger::open_rotated(&self.config.stderr)?;

        Ok(StdIoConf {
            stdin: Stdio::null(),
            stdout: stdout.into(),
            stderr: stderr.into(),
        })
    }
}
