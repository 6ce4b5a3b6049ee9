// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Log files of a daemonized master
//!
//! Every start rotates the previous stdout/stderr files away, so the stderr file the
//! readiness check watches always starts out empty.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::Error;

/// Lines kept from each end of the stderr file when a start fails
pub const EXCERPT_LINES: usize = 100;

/// Moves an existing `path` to `path.YYYYMMDD.HHMMSS`
///
/// The suffix is the time of this start, not the creation time of the old file.
pub fn rotate(path: &Path) -> Result<Option<PathBuf>, Error> {
    match fs::metadata(path) {
        Ok(_) => (),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let timestamp = Local::now().format("%Y%m%d.%H%M%S");
    let mut rotated = path.as_os_str().to_owned();
    rotated.push(format!(".{timestamp}"));
    let rotated = PathBuf::from(rotated);

    fs::rename(path, &rotated)?;
    tracing::debug!(
        log = %path.display(),
        rotated_to = %rotated.display(),
        "rotated log file"
    );

    Ok(Some(rotated))
}

/// Rotates `path` and opens a fresh file there for appending, creating parent directories
pub fn open_rotated(path: &Path) -> Result<File, Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    rotate(path)?;

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(file)
}

/// Whether anything was written to the file yet, a missing file counts as empty
pub(crate) fn has_output(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// The first and last lines of a failed start's stderr file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StderrExcerpt {
    pub head: Vec<String>,
    /// Empty when the whole file fit into `head`
    pub tail: Vec<String>,
}

impl StderrExcerpt {
    /// Bytes that aren't UTF-8 are replaced, native addons may write anything to stderr
    pub fn read(path: &Path, lines: usize) -> io::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut head = Vec::with_capacity(lines);
        let mut tail = VecDeque::with_capacity(lines);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(trim_newline(&buf)).into_owned();
            if head.len() < lines {
                head.push(line);
                continue;
            }
            if tail.len() == lines {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        Ok(Self {
            head,
            tail: tail.into(),
        })
    }
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

impl fmt::Display for StderrExcerpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.head {
            writeln!(f, "{line}")?;
        }
        if !self.tail.is_empty() {
            writeln!(f, "...")?;
            for line in &self.tail {
                writeln!(f, "{line}")?;
            }
        }
        Ok(())
    }
}
