// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use crate::procs::{Platform, ProcessRecord, RUNTIME_PROCESS_NAME};
use crate::{Error, ErrorKind};

/// Snapshot of the processes running the managed runtime
#[async_trait]
pub trait ProcessScanner: Send + Sync {
    /// Listing convention of the records this scanner produces
    fn platform(&self) -> Platform;

    /// Every process of the runtime currently in the process table
    async fn scan(&self) -> Result<Vec<ProcessRecord>, Error>;

    /// Like `scan`, a failed listing is logged and reads as an empty process table
    async fn scan_or_empty(&self) -> Vec<ProcessRecord> {
        match self.scan().await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(%err, "process listing failed, assuming no running processes");
                Vec::new()
            }
        }
    }
}

/// The scanner for the platform this binary was built for
pub fn platform_scanner() -> Box<dyn ProcessScanner> {
    match Platform::current() {
        Platform::Windows => Box::new(WindowsScanner::default()),
        Platform::Posix => Box::new(PosixScanner::default()),
    }
}

/// `ps -wweo pid,args`, one `<pid> <args>` row per process
#[derive(Clone, Debug)]
pub struct PosixScanner {
    process_name: String,
}

impl PosixScanner {
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
        }
    }

    /// Parses the output of `ps -wweo pid,args`
    pub fn parse(&self, listing: &str) -> Vec<ProcessRecord> {
        static ROW: OnceLock<Regex> = OnceLock::new();
        let row = ROW.get_or_init(|| Regex::new(r"^\s*(\d+)\s+(.*)").expect("static regex"));

        listing
            .lines()
            .filter(|line| keep_line(line, &self.process_name))
            .filter_map(|line| {
                let caps = row.captures(line)?;
                let pid = caps[1].parse().ok()?;
                Some(ProcessRecord::new(pid, &caps[2]))
            })
            .collect()
    }
}

impl Default for PosixScanner {
    fn default() -> Self {
        Self::new(RUNTIME_PROCESS_NAME)
    }
}

#[async_trait]
impl ProcessScanner for PosixScanner {
    fn platform(&self) -> Platform {
        Platform::Posix
    }

    async fn scan(&self) -> Result<Vec<ProcessRecord>, Error> {
        // command and cmd are not POSIX, args is
        let listing = run_listing(Command::new("ps").arg("-wweo").arg("pid,args")).await?;
        Ok(self.parse(&listing))
    }
}

/// WMI listing, one `<command line> <pid>` row per process
#[derive(Clone, Debug)]
pub struct WindowsScanner {
    process_name: String,
}

impl WindowsScanner {
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
        }
    }

    /// Parses the output of `wmic ... Get CommandLine,ProcessId`
    pub fn parse(&self, listing: &str) -> Vec<ProcessRecord> {
        static ROW: OnceLock<Regex> = OnceLock::new();
        let row = ROW.get_or_init(|| Regex::new(r"^(.*)\s+(\d+)\s*$").expect("static regex"));

        listing
            .lines()
            .filter(|line| keep_line(line, &self.process_name))
            .filter_map(|line| {
                let caps = row.captures(line)?;
                let pid = caps[2].parse().ok()?;
                Some(ProcessRecord::new(pid, caps[1].trim_end()))
            })
            .collect()
    }
}

impl Default for WindowsScanner {
    fn default() -> Self {
        Self::new(RUNTIME_PROCESS_NAME)
    }
}

#[async_trait]
impl ProcessScanner for WindowsScanner {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    async fn scan(&self) -> Result<Vec<ProcessRecord>, Error> {
        let filter = format!("Name = '{}.exe'", self.process_name);
        let listing = run_listing(
            Command::new("wmic")
                .arg("Path")
                .arg("win32_process")
                .arg("Where")
                .arg(filter)
                .arg("Get")
                .arg("CommandLine,ProcessId"),
        )
        .await?;
        Ok(self.parse(&listing))
    }
}

/// Rows from shell wrappers (`/bin/sh -c node ...`) would otherwise look like the runtime
fn keep_line(line: &str, process_name: &str) -> bool {
    !line.trim().is_empty() && !line.contains("/bin/sh") && line.contains(process_name)
}

async fn run_listing(command: &mut Command) -> Result<String, Error> {
    let output = command
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| ErrorKind::ScanFailed(err.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ErrorKind::ScanFailed(format!(
            "listing exited with {}: {}",
            output.status,
            stderr.trim()
        ))
        .into());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
