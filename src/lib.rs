// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process supervisor for clustered egg servers
//!
//! `start` spawns the cluster master (optionally as a detached daemon that must report
//! readiness), `stop` finds the master, app workers and agent workers again by scanning
//! the process table and signals them.

pub mod config;
#[cfg(unix)]
pub mod control;
mod error;
pub mod fork;
pub mod logging;
pub mod msg;
pub mod package;
pub mod procs;

pub use error::{Error, ErrorKind};
