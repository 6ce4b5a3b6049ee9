// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
    #[cfg(unix)]
    #[error("nix error: {0}")]
    NixError(#[from] nix::Error),
    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("start failed, {secs}s timeout")]
    ReadinessTimeout { secs: f64 },
    #[error("start got error, see {}", path.display())]
    StartupStderr { path: PathBuf },
    #[error("failed to list processes: {0}")]
    ScanFailed(String),
    #[error("failed to signal pid {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("an error occured: {0}")]
    ErrorMsg(String),
    #[error("an error occured: {0}")]
    ErrorStr(&'static str),
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct Error(ErrorKind);

impl Error {
    fn from_kind(kind: ErrorKind) -> Self {
        Self(kind)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// Status the supervisor exits with when this error ends a command
    pub fn exit_code(&self) -> i32 {
        1
    }

    pub(crate) fn spawn_failed(program: impl Into<String>, source: io::Error) -> Self {
        Self::from_kind(ErrorKind::SpawnFailed {
            program: program.into(),
            source,
        })
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::Config(msg.into()))
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(err: E) -> Self {
        Self::from_kind(err.into())
    }
}

impl From<&'static str> for Error {
    fn from(err: &'static str) -> Self {
        Self::from_kind(ErrorKind::ErrorStr(err))
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::from_kind(ErrorKind::ErrorMsg(err))
    }
}
