// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The notification channel between the supervisor and the cluster master
//!
//! A stream socketpair; the child's end is installed at [`CHILD_CHANNEL_FD`] right before
//! exec and announced through `NODE_CHANNEL_FD`, which is how a node child discovers its
//! ipc channel. Messages are newline delimited JSON.

use std::fmt::Debug;
use std::io;
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::dup2;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::UnixStream;

/// Descriptor number the child end is duplicated onto in the child
pub const CHILD_CHANNEL_FD: RawFd = 3;

/// Environment announcing the channel to the child
pub const CHANNEL_FD_ENV: &str = "NODE_CHANNEL_FD";
pub const CHANNEL_SERIALIZATION_ENV: &str = "NODE_CHANNEL_SERIALIZATION_MODE";

#[derive(Clone, Copy, Debug)]
pub struct Read;
#[derive(Clone, Copy, Debug)]
pub struct Write;

// A marker trait to designate the end of the channel this represents
pub trait End: Clone + Copy + Debug {}

impl End for Read {}
impl End for Write {}

#[derive(Debug)]
pub struct CtlEnd<E: End> {
    fd: OwnedFd,
    ghost: PhantomData<E>,
}

impl<E: End> CtlEnd<E> {
    fn from_stream(stream: StdUnixStream) -> Self {
        Self {
            fd: OwnedFd::from(stream),
            ghost: PhantomData,
        }
    }
}

impl CtlEnd<Read> {
    /// Registers the supervisor's end with the tokio reactor, must be called within a runtime
    pub fn into_async_ctl_end(self) -> io::Result<AsyncCtlEnd<Read>> {
        let stream = StdUnixStream::from(self.fd);
        stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(stream)?;

        Ok(AsyncCtlEnd {
            lines: BufReader::new(stream).lines(),
            ghost: PhantomData,
        })
    }
}

impl CtlEnd<Write> {
    /// Environment the child needs to find its end of the channel
    pub fn child_env() -> [(&'static str, String); 2] {
        [
            (CHANNEL_FD_ENV, CHILD_CHANNEL_FD.to_string()),
            (CHANNEL_SERIALIZATION_ENV, "json".to_string()),
        ]
    }
}

impl<E: End> AsRawFd for CtlEnd<E> {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Moves `raw_fd` onto `target_fd` so that it survives exec
///
/// Runs between fork and exec, so only async-signal-safe calls are allowed here.
pub(crate) fn install_at(raw_fd: RawFd, target_fd: RawFd) -> nix::Result<()> {
    if raw_fd == target_fd {
        // dup2 onto itself is a noop that keeps FD_CLOEXEC
        fcntl(raw_fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
        return Ok(());
    }

    dup2(raw_fd, target_fd)?;
    Ok(())
}

pub struct Control {
    read: CtlEnd<Read>,
    write: CtlEnd<Write>,
}

impl Control {
    /// Creates a new channel
    ///
    /// Both ends are close-on-exec; the write end only reaches the child through [`install_at`].
    pub fn new() -> io::Result<Self> {
        let (read, write) = StdUnixStream::pair()?;

        tracing::debug!(
            read = read.as_raw_fd(),
            write = write.as_raw_fd(),
            "created notification socketpair"
        );

        Ok(Self {
            read: CtlEnd::from_stream(read),
            write: CtlEnd::from_stream(write),
        })
    }

    pub fn split(self) -> (CtlEnd<Read>, CtlEnd<Write>) {
        let Control { read, write } = self;
        (read, write)
    }
}

/// Supervisor end of the channel, yields one line per message
pub struct AsyncCtlEnd<E: End> {
    lines: Lines<BufReader<UnixStream>>,
    ghost: PhantomData<E>,
}

impl AsyncCtlEnd<Read> {
    /// Next raw line, `None` once the child has closed its end
    ///
    /// Cancel safe, a partially received line stays buffered.
    pub async fn recv_line(&mut self) -> io::Result<Option<String>> {
        self.lines.next_line().await
    }
}
