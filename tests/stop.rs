// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stops a fake cluster master found through the real process table

#![cfg(unix)]

use std::time::Duration;

use tokio::process::{Child, Command};

use eggctl::procs::{MatchCriteria, Platform, PosixScanner, ProcessScanner, Terminator};

/// A `/bin/sh` linked as `node`, so its command line reads like a cluster master
fn fake_master(dir: &tempfile::TempDir, title: &str) -> Child {
    let node = dir.path().join("node");
    std::os::unix::fs::symlink("/bin/sh", &node).expect("symlink");

    let options = format!(
        r#"{{"title":"{title}","baseDir":"{}"}}"#,
        dir.path().display()
    );
    Command::new(&node)
        .arg("-c")
        .arg("while :; do sleep 1; done")
        .arg("/opt/eggctl/scripts/start-cluster.cjs")
        .arg(options)
        .arg(format!("--title={title}"))
        .kill_on_drop(true)
        .spawn()
        .expect("spawn")
}

async fn scanner() -> Option<PosixScanner> {
    let scanner = PosixScanner::default();
    // some minimal ps builds lack -ww or -o args
    match scanner.scan().await {
        Ok(_) => Some(scanner),
        Err(err) => {
            eprintln!("skipping: `ps -wweo pid,args` is unusable here: {err}");
            None
        }
    }
}

async fn wait_until_listed(scanner: &PosixScanner, criteria: &MatchCriteria) -> bool {
    for _ in 0..50 {
        let records = scanner.scan_or_empty().await;
        if records.iter().any(|r| criteria.matches(r)) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_stop_by_exact_title() {
    let Some(scanner) = scanner().await else {
        return;
    };
    let dir = tempfile::tempdir().expect("tempdir");
    let title = format!("eggctl-stop-{}", std::process::id());
    let mut master = fake_master(&dir, &title);

    let criteria = MatchCriteria::new(Platform::Posix).with_title(Some(title.clone()));
    assert!(wait_until_listed(&scanner, &criteria.masters()).await);

    // a proper prefix of the title must not match
    let prefix = MatchCriteria::new(Platform::Posix).with_title(Some(title[..title.len() - 1].to_string()));
    let report = Terminator::new(Box::new(scanner.clone()), Duration::from_millis(10))
        .stop(&prefix)
        .await
        .expect("stop");
    assert!(report.master_pids.is_empty());
    assert!(master.try_wait().expect("try_wait").is_none());

    let report = Terminator::new(Box::new(scanner), Duration::from_millis(100))
        .stop(&criteria)
        .await
        .expect("stop");
    assert_eq!(report.master_pids, master.id().into_iter().collect::<Vec<_>>());

    let status = tokio::time::timeout(Duration::from_secs(5), master.wait())
        .await
        .expect("master exits")
        .expect("wait");
    assert!(!status.success());
}

#[tokio::test]
async fn test_stop_by_base_dir() {
    let Some(scanner) = scanner().await else {
        return;
    };
    let dir = tempfile::tempdir().expect("tempdir");
    let title = format!("eggctl-base-dir-{}", std::process::id());
    let mut master = fake_master(&dir, &title);

    let criteria =
        MatchCriteria::new(Platform::Posix).with_base_dir(Some(dir.path().to_path_buf()));
    assert!(wait_until_listed(&scanner, &criteria.masters()).await);

    let report = Terminator::new(Box::new(scanner), Duration::from_millis(100))
        .stop(&criteria)
        .await
        .expect("stop");
    assert_eq!(report.master_pids.len(), 1);

    tokio::time::timeout(Duration::from_secs(5), master.wait())
        .await
        .expect("master exits")
        .expect("wait");
}

#[tokio::test]
async fn test_stop_without_running_cluster() {
    let Some(scanner) = scanner().await else {
        return;
    };
    let criteria = MatchCriteria::new(Platform::Posix)
        .with_title(Some(format!("eggctl-absent-{}", std::process::id())));

    let report = Terminator::new(Box::new(scanner), Duration::from_millis(10))
        .stop(&criteria)
        .await
        .expect("stop");
    assert!(report.is_empty());
}
