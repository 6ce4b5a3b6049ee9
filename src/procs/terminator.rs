// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The stop path: signal matching masters, wait, then clean up workers they left behind

use std::fmt;
use std::time::Duration;

use crate::procs::{MatchCriteria, ProcessScanner};
use crate::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TermSignal {
    Terminate,
    Interrupt,
    Quit,
}

impl fmt::Display for TermSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TermSignal::Terminate => "SIGTERM",
            TermSignal::Interrupt => "SIGINT",
            TermSignal::Quit => "SIGQUIT",
        };
        f.write_str(name)
    }
}

#[cfg(unix)]
impl From<TermSignal> for nix::sys::signal::Signal {
    fn from(signal: TermSignal) -> Self {
        use nix::sys::signal::Signal;

        match signal {
            TermSignal::Terminate => Signal::SIGTERM,
            TermSignal::Interrupt => Signal::SIGINT,
            TermSignal::Quit => Signal::SIGQUIT,
        }
    }
}

/// Result of a delivered signal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The process exited before the signal reached it
    AlreadyGone,
}

/// Sends a signal to one pid
#[cfg(unix)]
pub fn deliver(pid: u32, signal: TermSignal) -> Result<Delivery, Error> {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    // 0 and anything past i32::MAX would address a process group
    let raw = i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .ok_or_else(|| {
            Error::from(ErrorKind::SignalFailed {
                pid,
                reason: "not a single process id".to_string(),
            })
        })?;

    match nix::sys::signal::kill(Pid::from_raw(raw), nix::sys::signal::Signal::from(signal)) {
        Ok(()) => Ok(Delivery::Delivered),
        Err(Errno::ESRCH) => {
            tracing::debug!(pid, %signal, "process already exited");
            Ok(Delivery::AlreadyGone)
        }
        Err(errno) => Err(ErrorKind::SignalFailed {
            pid,
            reason: errno.desc().to_string(),
        }
        .into()),
    }
}

/// Sends a signal to one pid
///
/// Windows has no signals, every kind ends the process tree.
#[cfg(windows)]
pub fn deliver(pid: u32, signal: TermSignal) -> Result<Delivery, Error> {
    let output = std::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/T", "/F"])
        .output()?;

    if output.status.success() {
        return Ok(Delivery::Delivered);
    }
    // 128: no such process
    if output.status.code() == Some(128) {
        tracing::debug!(pid, %signal, "process already exited");
        return Ok(Delivery::AlreadyGone);
    }

    Err(ErrorKind::SignalFailed {
        pid,
        reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
    .into())
}

/// Seam over [`deliver`]
pub trait SignalSender: Send + Sync {
    fn send(&self, pid: u32, signal: TermSignal) -> Result<Delivery, Error>;
}

/// Signals real processes
#[derive(Clone, Copy, Debug, Default)]
pub struct OsSignals;

impl SignalSender for OsSignals {
    fn send(&self, pid: u32, signal: TermSignal) -> Result<Delivery, Error> {
        deliver(pid, signal)
    }
}

/// Pids that were sent a terminate signal by one stop
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StopReport {
    pub master_pids: Vec<u32>,
    pub worker_pids: Vec<u32>,
}

impl StopReport {
    pub fn is_empty(&self) -> bool {
        self.master_pids.is_empty() && self.worker_pids.is_empty()
    }
}

/// Stops a running cluster found by scanning the process table
pub struct Terminator {
    scanner: Box<dyn ProcessScanner>,
    signals: Box<dyn SignalSender>,
    grace: Duration,
}

impl Terminator {
    pub fn new(scanner: Box<dyn ProcessScanner>, grace: Duration) -> Self {
        Self {
            scanner,
            signals: Box::new(OsSignals),
            grace,
        }
    }

    pub fn with_signals(mut self, signals: Box<dyn SignalSender>) -> Self {
        self.signals = signals;
        self
    }

    /// Terminates matching masters, waits out the grace period, then terminates matching
    /// workers still alive
    ///
    /// Finding nothing is not an error.
    pub async fn stop(&self, criteria: &MatchCriteria) -> Result<StopReport, Error> {
        match &criteria.title {
            Some(title) => tracing::info!("stopping egg application with --title={title}"),
            None => tracing::info!("stopping egg application"),
        }

        let mut report = StopReport::default();

        let masters = self.find(&criteria.masters()).await;
        if masters.is_empty() {
            tracing::warn!("can't detect any running egg process");
        } else {
            tracing::info!("got master pid {:?}", masters);
            self.terminate_all(&masters)?;
            report.master_pids = masters;

            // masters normally take their workers down with them
            tokio::time::sleep(self.grace).await;
        }

        let workers = self.find(&criteria.workers()).await;
        if !workers.is_empty() {
            tracing::info!(
                "got worker/agent pids {:?} that is not killed by master",
                workers
            );
            self.terminate_all(&workers)?;
            report.worker_pids = workers;
        }

        tracing::info!("stopped");
        Ok(report)
    }

    async fn find(&self, criteria: &MatchCriteria) -> Vec<u32> {
        // quoting follows the listing the records come from
        let mut criteria = criteria.clone();
        criteria.platform = self.scanner.platform();

        self.scanner
            .scan_or_empty()
            .await
            .into_iter()
            .filter(|record| criteria.matches(record))
            .map(|record| record.pid)
            .collect()
    }

    /// Signals every pid, then fails with the first error if any
    fn terminate_all(&self, pids: &[u32]) -> Result<(), Error> {
        let mut first_err = None;
        for &pid in pids {
            if let Err(err) = self.signals.send(pid, TermSignal::Terminate) {
                tracing::error!(pid, %err, "failed to terminate");
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
