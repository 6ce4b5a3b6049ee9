// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::Path;
use std::time::Duration;

use tokio::process::Child;
use tokio::signal::unix::{signal, SignalKind};

use crate::config::LaunchConfig;
use crate::msg::Notifications;
use crate::procs::{
    deliver, LaunchHandle, Launcher, ReadinessMonitor, ReadinessState, StderrExcerpt, TermSignal,
    EXCERPT_LINES, TICK_INTERVAL,
};
use crate::{Error, ErrorKind};

/// Wait after the forced terminate signal of a failed daemon start
pub const KILL_GRACE: Duration = Duration::from_secs(1);

/// How a start ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// The daemon reported readiness
    Ready { address: Option<String> },
    /// The daemon wrote to stderr while starting, which was allowed
    StderrIgnored,
    /// The foreground child exited
    Exited { code: i32 },
}

impl StartOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartOutcome::Ready { .. } | StartOutcome::StderrIgnored => 0,
            StartOutcome::Exited { code } => *code,
        }
    }
}

/// Launch and watch the cluster master
///
/// Rules:
///   - foreground: relay interrupt, quit and terminate to the child and mirror its exit
///   - daemon: wait for readiness, terminate the child on failure and never restart it
pub struct Supervisor {
    launcher: Launcher,
    tick_interval: Duration,
    kill_grace: Duration,
}

impl Supervisor {
    pub fn new(config: LaunchConfig) -> Self {
        Self {
            launcher: Launcher::new(config),
            tick_interval: TICK_INTERVAL,
            kill_grace: KILL_GRACE,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    fn config(&self) -> &LaunchConfig {
        self.launcher.config()
    }

    pub async fn run(self) -> Result<StartOutcome, Error> {
        tracing::info!(
            "Starting {} application at {}",
            self.config().framework_name,
            self.config().base_dir.display()
        );

        let handle = self.launcher.launch()?;
        if self.config().daemon {
            self.watch_daemon(handle).await
        } else {
            self.run_foreground(handle).await
        }
    }

    async fn run_foreground(&self, handle: LaunchHandle) -> Result<StartOutcome, Error> {
        let LaunchHandle {
            mut child,
            mut notifications,
        } = handle;

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut quit = signal(SignalKind::quit())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut channel_open = true;

        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status?;
                    tracing::debug!(%status, "child exited");
                    // killed by a signal has no code, which counts as a clean stop
                    return Ok(StartOutcome::Exited {
                        code: status.code().unwrap_or(0),
                    });
                }
                _ = interrupt.recv() => relay(&child, TermSignal::Interrupt),
                _ = quit.recv() => relay(&child, TermSignal::Quit),
                _ = terminate.recv() => relay(&child, TermSignal::Terminate),
                msg = notifications.next_message(), if channel_open => match msg {
                    Some(msg) if msg.is_ready() => self.log_started(msg.address()),
                    Some(msg) => tracing::debug!(?msg, "ignoring notification"),
                    None => channel_open = false,
                },
            }
        }
    }

    async fn watch_daemon(&self, handle: LaunchHandle) -> Result<StartOutcome, Error> {
        let LaunchHandle {
            child,
            mut notifications,
        } = handle;
        let config = self.config();

        let mut monitor = ReadinessMonitor::new(&config.stderr, config.readiness_timeout)
            .with_interval(self.tick_interval);
        let outcome = monitor.wait(&mut notifications).await;

        match outcome.state {
            ReadinessState::Ready => {
                self.log_started(outcome.address.as_deref());
                Ok(StartOutcome::Ready {
                    address: outcome.address,
                })
            }
            ReadinessState::FailedStartup => {
                report_stderr(&config.stderr);
                if config.ignore_stderr {
                    tracing::warn!("stderr output at startup ignored");
                    return Ok(StartOutcome::StderrIgnored);
                }

                tracing::error!("Start got error, see {}", config.stderr.display());
                tracing::error!("Or use `--ignore-stderr` to ignore stderr at startup.");
                self.force_stop(&child).await;
                Err(ErrorKind::StartupStderr {
                    path: config.stderr.clone(),
                }
                .into())
            }
            ReadinessState::TimedOut | ReadinessState::Waiting => {
                // the returned error is the timeout diagnostic, the caller logs it
                report_stderr(&config.stderr);
                self.force_stop(&child).await;
                Err(ErrorKind::ReadinessTimeout {
                    secs: config.readiness_timeout.as_secs_f64(),
                }
                .into())
            }
        }
    }

    fn log_started(&self, address: Option<&str>) {
        tracing::info!(
            "{} started on {}",
            self.config().framework_name,
            address.unwrap_or("unknown address")
        );
    }

    /// One terminate signal, then the grace window, no retries
    async fn force_stop(&self, child: &Child) {
        if let Some(pid) = child.id() {
            if let Err(err) = deliver(pid, TermSignal::Terminate) {
                tracing::error!(pid, %err, "failed to terminate the failed start");
            }
        }
        tokio::time::sleep(self.kill_grace).await;
    }
}

fn relay(child: &Child, signal: TermSignal) {
    let Some(pid) = child.id() else {
        return;
    };

    tracing::debug!(pid, %signal, "relaying signal to child");
    if let Err(err) = deliver(pid, signal) {
        tracing::warn!(pid, %signal, %err, "failed to relay signal");
    }
}

/// Logs the head and tail of the stderr file, anything unreadable is skipped
fn report_stderr(path: &Path) {
    match StderrExcerpt::read(path, EXCERPT_LINES) {
        Ok(excerpt) if !excerpt.head.is_empty() => {
            tracing::error!("Got error when startup:");
            tracing::error!("{}", excerpt.to_string().trim_end());
        }
        Ok(_) => (),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
        Err(err) => tracing::warn!(%err, path = %path.display(), "failed to read stderr log"),
    }
}
