// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::procs::{Platform, ProcessRecord, ProcessRole};

/// Marker of the entry script every master is started with
pub const MASTER_MARKER: &str = "start-cluster";

// node_modules/@eggjs/cluster/dist/{commonjs,esm}/app_worker.js, or the older
// node_modules/egg-cluster/lib/app_worker.js
const WORKER_LAYOUT: &str =
    r"(?i)(?:@eggjs[/\\]cluster[/\\]dist[/\\](?:commonjs|esm)|egg-cluster[/\\]lib)[/\\]";

fn app_worker_path() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"{WORKER_LAYOUT}app_worker\.js")).expect("static regex")
    })
}

fn agent_worker_path() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"{WORKER_LAYOUT}agent_worker\.js")).expect("static regex")
    })
}

pub(crate) fn detect_role(command_line: &str) -> ProcessRole {
    if command_line.contains(MASTER_MARKER) {
        ProcessRole::Master
    } else if app_worker_path().is_match(command_line) {
        ProcessRole::AppWorker
    } else if agent_worker_path().is_match(command_line) {
        ProcessRole::AgentWorker
    } else {
        ProcessRole::Unknown
    }
}

/// The fragment a serialized cluster option `key: value` leaves in a command line
///
/// The value is JSON encoded and closed by its quote, so `"title":"examp"` can never be found
/// inside `"title":"example"`. Windows listings show the quotes of the argument escaped.
pub fn quoted_field(key: &str, value: &str, platform: Platform) -> String {
    let key = serde_json::Value::from(key).to_string();
    let value = serde_json::Value::from(value).to_string();
    let fragment = format!("{key}:{value}");

    match platform {
        Platform::Posix => fragment,
        Platform::Windows => fragment.replace('"', "\\\""),
    }
}

/// Which processes a stop (or any other lookup) is after
///
/// Every filter that is set must hold; an empty role list accepts any cluster role.
#[derive(Clone, Debug)]
pub struct MatchCriteria {
    pub roles: Vec<ProcessRole>,
    pub title: Option<String>,
    pub base_dir: Option<PathBuf>,
    pub platform: Platform,
}

impl MatchCriteria {
    pub fn new(platform: Platform) -> Self {
        Self {
            roles: Vec::new(),
            title: None,
            base_dir: None,
            platform,
        }
    }

    pub fn with_roles(mut self, roles: &[ProcessRole]) -> Self {
        self.roles = roles.to_vec();
        self
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    pub fn with_base_dir(mut self, base_dir: Option<PathBuf>) -> Self {
        self.base_dir = base_dir;
        self
    }

    /// The master processes of the same application
    pub fn masters(&self) -> Self {
        self.clone().with_roles(&[ProcessRole::Master])
    }

    /// The app and agent workers of the same application
    pub fn workers(&self) -> Self {
        self.clone()
            .with_roles(&[ProcessRole::AppWorker, ProcessRole::AgentWorker])
    }

    pub fn matches(&self, record: &ProcessRecord) -> bool {
        let role = record.role();
        let role_ok = if self.roles.is_empty() {
            role != ProcessRole::Unknown
        } else {
            self.roles.contains(&role)
        };
        if !role_ok {
            return false;
        }

        if let Some(title) = &self.title {
            let needle = quoted_field("title", title, self.platform);
            if !record.command_line.contains(&needle) {
                return false;
            }
        }

        if let Some(base_dir) = &self.base_dir {
            if !self.base_dir_matches(base_dir, &record.command_line) {
                return false;
            }
        }

        true
    }

    fn base_dir_matches(&self, base_dir: &Path, command_line: &str) -> bool {
        let base_dir = base_dir.to_string_lossy();
        match self.platform {
            Platform::Posix => {
                command_line.contains(&quoted_field("baseDir", &base_dir, Platform::Posix))
            }
            Platform::Windows => {
                let base_dir = base_dir.replace('/', "\\").to_lowercase();
                let needle = quoted_field("baseDir", &base_dir, Platform::Windows).to_lowercase();
                command_line.to_lowercase().contains(&needle)
            }
        }
    }
}
