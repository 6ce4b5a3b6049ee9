// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::PathBuf;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::{sleep_until, Instant};

use crate::msg::{Message, Notifications};
use crate::procs::logger;

/// Spacing of the readiness checks
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadinessState {
    Waiting,
    Ready,
    FailedStartup,
    TimedOut,
}

impl ReadinessState {
    pub fn is_terminal(self) -> bool {
        self != ReadinessState::Waiting
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadinessOutcome {
    pub state: ReadinessState,
    /// Address from the ready notice
    pub address: Option<String>,
    /// Ticks that passed before the outcome was reached
    pub ticks: u64,
}

/// Waits for a daemonized master to report readiness
///
/// Each tick first takes every notification that already arrived, then looks at the stderr
/// file, then at the clock. A ready notice therefore beats stderr output seen in the same
/// tick. Between ticks the wait is cut short as soon as a message arrives.
pub struct ReadinessMonitor {
    stderr: PathBuf,
    timeout: Duration,
    interval: Duration,
    state: ReadinessState,
    address: Option<String>,
}

impl ReadinessMonitor {
    pub fn new(stderr: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            stderr: stderr.into(),
            timeout,
            interval: TICK_INTERVAL,
            state: ReadinessState::Waiting,
            address: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn state(&self) -> ReadinessState {
        self.state
    }

    /// Ticks allowed before giving up, partial intervals round up
    pub fn max_ticks(&self) -> u64 {
        let interval = self.interval.as_nanos().max(1);
        let ticks = (self.timeout.as_nanos() + interval - 1) / interval;
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    pub async fn wait<N: Notifications + ?Sized>(
        &mut self,
        notifications: &mut N,
    ) -> ReadinessOutcome {
        let max_ticks = self.max_ticks();
        let mut ticks = 0u64;
        let mut channel_open = true;
        let mut next_tick = Instant::now() + self.interval;

        loop {
            // drain what already arrived before judging the tick
            while channel_open {
                match notifications.next_message().now_or_never() {
                    Some(Some(msg)) => self.observe(msg),
                    Some(None) => channel_open = false,
                    None => break,
                }
            }

            if let Some(state) = self.check(ticks, max_ticks) {
                self.state = state;
                return ReadinessOutcome {
                    state,
                    address: self.address.clone(),
                    ticks,
                };
            }

            // a closed channel only leaves the stderr file and the clock to wait on
            let message = if channel_open {
                tokio::select! {
                    msg = notifications.next_message() => Some(msg),
                    _ = sleep_until(next_tick) => None,
                }
            } else {
                sleep_until(next_tick).await;
                None
            };

            match message {
                Some(Some(msg)) => self.observe(msg),
                Some(None) => {
                    tracing::debug!("notification channel closed");
                    channel_open = false;
                }
                None => {
                    ticks += 1;
                    next_tick += self.interval;
                    tracing::info!("Wait Start: {}...", ticks);
                }
            }
        }
    }

    fn observe(&mut self, msg: Message) {
        if msg.is_ready() {
            self.state = ReadinessState::Ready;
            self.address = msg.address().map(str::to_string);
        } else {
            tracing::debug!(?msg, "ignoring notification");
        }
    }

    fn check(&self, ticks: u64, max_ticks: u64) -> Option<ReadinessState> {
        if self.state == ReadinessState::Ready {
            return Some(ReadinessState::Ready);
        }
        if logger::has_output(&self.stderr) {
            return Some(ReadinessState::FailedStartup);
        }
        if ticks >= max_ticks {
            return Some(ReadinessState::TimedOut);
        }
        None
    }
}
