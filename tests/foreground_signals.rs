// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Signals sent to the supervisor reach a foreground master
//!
//! Kept in its own test binary: the signals are raised at this whole process.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::{raise, Signal};
use serde_json::Map;

use eggctl::config::LaunchConfig;
use eggctl::procs::{StartOutcome, Supervisor};

fn foreground_config(dir: &Path, script: &str) -> LaunchConfig {
    let entry_script = dir.join("start-cluster.sh");
    fs::write(&entry_script, script).expect("script");

    let mut environment = BTreeMap::new();
    environment.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
    environment.insert(
        "PID_FILE".to_string(),
        dir.join("child.pid").to_string_lossy().into_owned(),
    );

    LaunchConfig {
        base_dir: dir.to_path_buf(),
        title: "eggctl-signals".into(),
        framework_name: "egg".into(),
        executable: PathBuf::from("/bin/sh"),
        extra_args: Vec::new(),
        entry_script,
        cluster_options: Map::new(),
        environment,
        stdout: dir.join("master-stdout.log"),
        stderr: dir.join("master-stderr.log"),
        daemon: false,
        readiness_timeout: Duration::from_secs(10),
        ignore_stderr: false,
    }
}

async fn wait_for_pid_file(path: &Path) {
    for _ in 0..250 {
        if fs::read_to_string(path).map(|p| !p.trim().is_empty()).unwrap_or(false) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("child never wrote {}", path.display());
}

async fn relayed(signal: Signal, trap: &str, code: i32) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = format!(
        "trap 'exit {code}' {trap}\necho $$ > \"$PID_FILE\"\nwhile :; do sleep 1; done\n"
    );
    let config = foreground_config(dir.path(), &script);

    // the supervisor installs its handlers in the same poll that spawns the child,
    // so they are in place once the child has written its pid
    let run = tokio::spawn(Supervisor::new(config).run());
    wait_for_pid_file(&dir.path().join("child.pid")).await;

    raise(signal).expect("raise");

    let outcome = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("child exits")
        .expect("join")
        .expect("start");
    assert_eq!(outcome, StartOutcome::Exited { code });
    assert_eq!(outcome.exit_code(), code);
}

// one test, so no other supervisor in this process sees the raised signals
#[tokio::test]
async fn test_signals_are_relayed_to_the_foreground_master() {
    relayed(Signal::SIGTERM, "TERM", 42).await;
    relayed(Signal::SIGINT, "INT", 43).await;
    relayed(Signal::SIGQUIT, "QUIT", 44).await;
}
