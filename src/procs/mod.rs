// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod launcher;
mod logger;
mod matcher;
mod monitor;
mod scanner;
#[cfg(unix)]
mod supervisor;
mod terminator;

#[cfg(unix)]
pub use launcher::LaunchHandle;
pub use launcher::{build_invocation, Launcher};
pub use logger::{open_rotated, rotate, StderrExcerpt, EXCERPT_LINES};
pub use matcher::{quoted_field, MatchCriteria};
pub use monitor::{ReadinessMonitor, ReadinessOutcome, ReadinessState, TICK_INTERVAL};
pub use scanner::{platform_scanner, PosixScanner, ProcessScanner, WindowsScanner};
#[cfg(unix)]
pub use supervisor::{StartOutcome, Supervisor, KILL_GRACE};
pub use terminator::{
    deliver, Delivery, OsSignals, SignalSender, StopReport, TermSignal, Terminator,
};

use std::fmt;

/// Name of the executable every cluster process runs under
pub const RUNTIME_PROCESS_NAME: &str = "node";

/// A process seen in one scan of the process table
///
/// Never cache these, the process may be gone by the time the record is looked at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub command_line: String,
}

impl ProcessRecord {
    pub fn new(pid: u32, command_line: impl Into<String>) -> Self {
        Self {
            pid,
            command_line: command_line.into(),
        }
    }

    pub fn role(&self) -> ProcessRole {
        ProcessRole::detect(&self.command_line)
    }
}

/// What part of a cluster a process plays
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    Master,
    AppWorker,
    AgentWorker,
    Unknown,
}

impl ProcessRole {
    pub fn detect(command_line: &str) -> Self {
        matcher::detect_role(command_line)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessRole::Master => "master",
            ProcessRole::AppWorker => "app_worker",
            ProcessRole::AgentWorker => "agent_worker",
            ProcessRole::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Process listing and command line quoting conventions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Posix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Posix
        }
    }
}
