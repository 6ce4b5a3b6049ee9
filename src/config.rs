// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Turns command line options into the immutable configuration of one start or stop
//!
//! Nothing here touches the supervisor's own environment, the child's environment is a
//! separate map derived from a snapshot of it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};

use crate::package::PackageInfo;
use crate::procs::{MatchCriteria, Platform};
use crate::Error;

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_millis(300 * 1000);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_NODE: &str = "node";
pub const DEFAULT_FRAMEWORK: &str = "egg";

/// Cluster option keys that only steer the supervisor and never reach the child
pub const SUPERVISOR_LOCAL_KEYS: &[&str] = &[
    "env",
    "daemon",
    "stdout",
    "stderr",
    "timeout",
    "ignore-stderr",
    "ignoreStderr",
    "node",
    "entry-script",
];

const NODE_OPTIONS_PREFIX: &str = "node-options--";

#[cfg(windows)]
const PATH_DELIMITER: &str = ";";
#[cfg(not(windows))]
const PATH_DELIMITER: &str = ":";

/// Options of `start`, `None` meaning not given on the command line
#[derive(Clone, Debug, Default)]
pub struct StartOptions {
    pub base_dir: Option<PathBuf>,
    pub title: Option<String>,
    pub framework: Option<String>,
    pub port: Option<u16>,
    pub workers: Option<u32>,
    pub env: Option<String>,
    pub daemon: Option<bool>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    /// Readiness timeout in milliseconds
    pub timeout: Option<u64>,
    pub ignore_stderr: Option<bool>,
    pub node: Option<String>,
    pub require: Vec<String>,
    pub sourcemap: Option<bool>,
    pub entry_script: Option<PathBuf>,
}

/// Options of `stop`
#[derive(Clone, Debug, Default)]
pub struct StopOptions {
    pub base_dir: Option<PathBuf>,
    pub title: Option<String>,
    /// Grace period in milliseconds
    pub timeout: Option<u64>,
}

/// What a start or stop needs from the supervisor's surroundings
#[derive(Clone, Debug)]
pub struct Ambient {
    pub cwd: PathBuf,
    pub home: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl Ambient {
    pub fn from_process() -> Result<Self, Error> {
        let cwd = std::env::current_dir()?;
        let env: BTreeMap<String, String> = std::env::vars().collect();
        let home = env
            .get("MOCK_HOME_DIR")
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .ok_or_else(|| Error::config("failed to find the home directory"))?;

        Ok(Self { cwd, home, env })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }
}

/// Fully resolved description of one launch
#[derive(Clone, Debug)]
pub struct LaunchConfig {
    pub base_dir: PathBuf,
    pub title: String,
    /// Display name of the framework, used in log lines
    pub framework_name: String,
    pub executable: PathBuf,
    /// Runtime flags, placed before the entry script
    pub extra_args: Vec<String>,
    pub entry_script: PathBuf,
    pub cluster_options: Map<String, Value>,
    pub environment: BTreeMap<String, String>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub daemon: bool,
    pub readiness_timeout: Duration,
    pub ignore_stderr: bool,
}

impl LaunchConfig {
    /// The single JSON argument handed to the entry script
    pub fn cluster_options_json(&self) -> Result<String, Error> {
        let options: Map<String, Value> = self
            .cluster_options
            .iter()
            .filter(|(key, _)| !SUPERVISOR_LOCAL_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(serde_json::to_string(&options)?)
    }

    pub fn resolve(mut options: StartOptions, ambient: &Ambient) -> Result<Self, Error> {
        let base_dir = ambient.absolute(options.base_dir.as_deref().unwrap_or(Path::new(".")));
        let base_dir = normalize(&base_dir);
        let pkg = PackageInfo::read(&base_dir)?;
        tracing::debug!(base_dir = %base_dir.display(), ?pkg, "read package");

        let mut extra_args = vec!["--no-deprecation".to_string(), "--trace-warnings".to_string()];
        for revert in pkg.reverts() {
            extra_args.push(format!("--security-revert={revert}"));
        }

        // eggScriptsConfig fills in whatever the command line left out
        let mut extra_options = Map::new();
        if let Some(scripts) = &pkg.scripts_config {
            let mut requires = string_list(scripts.get("require"));
            requires.append(&mut options.require);
            options.require = requires;

            for (key, value) in scripts {
                if let Some(flag) = key.strip_prefix(NODE_OPTIONS_PREFIX) {
                    extra_args.push(node_option(flag, value));
                } else if key != "require" && !apply_scripts_option(&mut options, key, value) {
                    extra_options.insert(key.clone(), value.clone());
                }
            }
        }

        let framework = resolve_framework(options.framework.as_deref(), &pkg, &base_dir);
        let framework_name = PackageInfo::read(&framework)
            .ok()
            .and_then(|fw| fw.name)
            .unwrap_or_else(|| DEFAULT_FRAMEWORK.to_string());

        let title = options.title.clone().unwrap_or_else(|| match &pkg.name {
            Some(name) => format!("egg-server-{name}"),
            None => "egg-server".to_string(),
        });

        let log_dir = ambient.log_dir();
        let stdout = options
            .stdout
            .as_deref()
            .map(|p| ambient.absolute(p))
            .unwrap_or_else(|| log_dir.join("master-stdout.log"));
        let stderr = options
            .stderr
            .as_deref()
            .map(|p| ambient.absolute(p))
            .unwrap_or_else(|| log_dir.join("master-stderr.log"));

        let workers = options.workers.or_else(|| {
            ambient
                .env
                .get("EGG_WORKERS")
                .and_then(|w| w.trim().parse().ok())
        });

        let sourcemap = options.sourcemap.or(pkg.typescript().then_some(true));
        if sourcemap == Some(true) {
            let register = base_dir
                .join("node_modules")
                .join("source-map-support")
                .join("register.js");
            let flag = if pkg.is_esm() { "--import" } else { "--require" };
            extra_args.push(flag.to_string());
            extra_args.push(register.to_string_lossy().into_owned());
        }

        let environment = child_environment(ambient, &base_dir, options.env.as_deref())?;

        let entry_script = options
            .entry_script
            .as_deref()
            .map(|p| ambient.absolute(p))
            .unwrap_or_else(|| default_entry_script(pkg.is_esm()));

        let mut cluster_options = extra_options;
        cluster_options.insert("title".into(), Value::from(title.clone()));
        cluster_options.insert(
            "framework".into(),
            Value::from(framework.to_string_lossy().into_owned()),
        );
        if let Some(port) = options.port {
            cluster_options.insert("port".into(), Value::from(port));
        }
        if let Some(workers) = workers {
            cluster_options.insert("workers".into(), Value::from(workers));
        }
        if !options.require.is_empty() {
            cluster_options.insert("require".into(), Value::from(options.require.clone()));
        }
        if let Some(sourcemap) = sourcemap {
            cluster_options.insert("sourcemap".into(), Value::from(sourcemap));
        }
        cluster_options.insert(
            "baseDir".into(),
            Value::from(base_dir.to_string_lossy().into_owned()),
        );

        Ok(Self {
            base_dir,
            title,
            framework_name,
            executable: PathBuf::from(options.node.as_deref().unwrap_or(DEFAULT_NODE)),
            extra_args,
            entry_script,
            cluster_options,
            environment,
            stdout,
            stderr,
            daemon: options.daemon.unwrap_or(false),
            readiness_timeout: options
                .timeout
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_START_TIMEOUT),
            ignore_stderr: options.ignore_stderr.unwrap_or(false),
        })
    }
}

impl StopOptions {
    /// Every cluster process of the application, optionally narrowed by title and base dir
    pub fn criteria(&self, ambient: &Ambient) -> MatchCriteria {
        let base_dir = self
            .base_dir
            .as_deref()
            .map(|dir| normalize(&ambient.absolute(dir)));

        MatchCriteria::new(Platform::current())
            .with_title(self.title.clone())
            .with_base_dir(base_dir)
    }

    pub fn grace(&self) -> Duration {
        self.timeout
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_STOP_TIMEOUT)
    }
}

/// Drops `.` components and trailing separators so the path serializes like the one given
/// at start
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect()
}

/// Applies a supervisor setting from eggScriptsConfig, false if the key isn't one
fn apply_scripts_option(options: &mut StartOptions, key: &str, value: &Value) -> bool {
    match key {
        "title" => fill(&mut options.title, value.as_str().map(str::to_string)),
        "framework" => fill(&mut options.framework, value.as_str().map(str::to_string)),
        "port" => fill(
            &mut options.port,
            value.as_u64().and_then(|p| u16::try_from(p).ok()),
        ),
        "workers" => fill(
            &mut options.workers,
            value.as_u64().and_then(|w| u32::try_from(w).ok()),
        ),
        "env" => fill(&mut options.env, value.as_str().map(str::to_string)),
        "daemon" => fill(&mut options.daemon, value.as_bool()),
        "stdout" => fill(&mut options.stdout, value.as_str().map(PathBuf::from)),
        "stderr" => fill(&mut options.stderr, value.as_str().map(PathBuf::from)),
        "timeout" => fill(&mut options.timeout, value.as_u64()),
        "ignore-stderr" | "ignoreStderr" => fill(&mut options.ignore_stderr, value.as_bool()),
        "node" => fill(&mut options.node, value.as_str().map(str::to_string)),
        "sourcemap" => fill(&mut options.sourcemap, value.as_bool()),
        _ => return false,
    }
    true
}

fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(one)) => vec![one.clone()],
        Some(Value::Array(many)) => many
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// `"node-options--allow-wasi": true` is `--allow-wasi`, anything else `--key=value`
fn node_option(flag: &str, value: &Value) -> String {
    match value {
        Value::Bool(true) => format!("--{flag}"),
        Value::String(s) => format!("--{flag}={s}"),
        other => format!("--{flag}={other}"),
    }
}

/// A path, or a module name looked up in the application's node_modules
fn resolve_framework(flag: Option<&str>, pkg: &PackageInfo, base_dir: &Path) -> PathBuf {
    let name = flag.or_else(|| pkg.framework()).unwrap_or(DEFAULT_FRAMEWORK);
    let path = Path::new(name);
    if path.is_absolute() {
        path.to_path_buf()
    } else if name.starts_with('.') {
        base_dir.join(path)
    } else {
        base_dir.join("node_modules").join(name)
    }
}

fn child_environment(
    ambient: &Ambient,
    base_dir: &Path,
    server_env: Option<&str>,
) -> Result<BTreeMap<String, String>, Error> {
    let mut env = ambient.env.clone();
    let home = ambient.home.to_string_lossy().into_owned();

    env.insert("HOME".into(), home);
    env.insert("NODE_ENV".into(), "production".into());

    let inherited_path = env.get("PATH").or_else(|| env.get("Path")).cloned();
    let path = [
        Some(base_dir.join("node_modules").join(".bin").to_string_lossy().into_owned()),
        Some(base_dir.join(".node").join("bin").to_string_lossy().into_owned()),
        inherited_path,
    ]
    .into_iter()
    .flatten()
    .filter(|p| !p.is_empty())
    .collect::<Vec<_>>()
    .join(PATH_DELIMITER);
    env.insert("PATH".into(), path.clone());
    if cfg!(windows) {
        env.insert("Path".into(), path);
    }

    env.insert("ENABLE_NODE_LOG".into(), "YES".into());
    let node_log_dir = env.get("NODE_LOG_DIR").cloned().unwrap_or_else(|| {
        ambient
            .log_dir()
            .join("alinode")
            .to_string_lossy()
            .into_owned()
    });
    fs::create_dir_all(&node_log_dir)?;
    env.insert("NODE_LOG_DIR".into(), node_log_dir);

    if let Some(server_env) = server_env {
        env.insert("EGG_SERVER_ENV".into(), server_env.into());
    }

    Ok(env)
}

/// `start-cluster.{cjs,mjs}` shipped next to the binary, or in the source tree during development
pub fn default_entry_script(esm: bool) -> PathBuf {
    let name = if esm {
        "start-cluster.mjs"
    } else {
        "start-cluster.cjs"
    };

    let installed = std::env::current_exe().ok().and_then(|exe| {
        let script = exe.parent()?.join("..").join("scripts").join(name);
        script.exists().then_some(script)
    });

    installed.unwrap_or_else(|| Path::new(env!("CARGO_MANIFEST_DIR")).join("scripts").join(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        dir: tempfile::TempDir,
        ambient: Ambient,
    }

    impl Fixture {
        fn new(package: &str) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let app = dir.path().join("app");
            fs::create_dir_all(&app).expect("mkdir");
            fs::write(app.join("package.json"), package).expect("write");

            let mut env = BTreeMap::new();
            env.insert("PATH".to_string(), "/usr/bin".to_string());
            let ambient = Ambient {
                cwd: dir.path().to_path_buf(),
                home: dir.path().join("home"),
                env,
            };
            Self { dir, ambient }
        }

        fn app(&self) -> PathBuf {
            self.dir.path().join("app")
        }

        fn resolve(&self, options: StartOptions) -> LaunchConfig {
            LaunchConfig::resolve(
                StartOptions {
                    base_dir: Some("app".into()),
                    ..options
                },
                &self.ambient,
            )
            .expect("resolve")
        }
    }

    #[test]
    fn test_defaults() {
        let fx = Fixture::new(r#"{ "name": "example" }"#);
        let config = fx.resolve(StartOptions::default());

        assert_eq!(config.base_dir, fx.app());
        assert_eq!(config.title, "egg-server-example");
        assert_eq!(config.framework_name, "egg");
        assert_eq!(config.executable, PathBuf::from("node"));
        assert_eq!(config.extra_args, vec!["--no-deprecation", "--trace-warnings"]);
        assert_eq!(
            config.stdout,
            fx.dir.path().join("home").join("logs").join("master-stdout.log")
        );
        assert_eq!(
            config.stderr,
            fx.dir.path().join("home").join("logs").join("master-stderr.log")
        );
        assert!(!config.daemon);
        assert!(!config.ignore_stderr);
        assert_eq!(config.readiness_timeout, Duration::from_secs(300));
        assert_eq!(
            config.cluster_options["framework"],
            Value::from(fx.app().join("node_modules").join("egg").to_string_lossy().into_owned())
        );
        assert_eq!(
            config.cluster_options["baseDir"],
            Value::from(fx.app().to_string_lossy().into_owned())
        );
        assert!(config
            .entry_script
            .to_string_lossy()
            .ends_with("start-cluster.cjs"));
    }

    #[test]
    fn test_environment() {
        let fx = Fixture::new(r#"{ "name": "example" }"#);
        let config = fx.resolve(StartOptions {
            env: Some("pre".into()),
            ..Default::default()
        });
        let env = &config.environment;

        assert_eq!(env["NODE_ENV"], "production");
        assert_eq!(env["HOME"], fx.dir.path().join("home").to_string_lossy());
        assert_eq!(env["EGG_SERVER_ENV"], "pre");
        assert_eq!(env["ENABLE_NODE_LOG"], "YES");
        assert!(Path::new(&env["NODE_LOG_DIR"]).is_dir());

        let path: Vec<&str> = env["PATH"].split(PATH_DELIMITER).collect();
        assert_eq!(
            path[0],
            fx.app().join("node_modules").join(".bin").to_string_lossy()
        );
        assert_eq!(path[1], fx.app().join(".node").join("bin").to_string_lossy());
        assert_eq!(path[2], "/usr/bin");
    }

    #[test]
    fn test_supervisor_keys_never_reach_the_child() {
        let fx = Fixture::new(r#"{ "name": "example" }"#);
        let mut config = fx.resolve(StartOptions {
            title: Some("example".into()),
            port: Some(7001),
            workers: Some(2),
            daemon: Some(true),
            timeout: Some(1000),
            ignore_stderr: Some(true),
            ..Default::default()
        });
        for key in SUPERVISOR_LOCAL_KEYS {
            config.cluster_options.insert(key.to_string(), Value::from(1));
        }

        let json: Map<String, Value> =
            serde_json::from_str(&config.cluster_options_json().expect("json")).expect("parse");

        for key in SUPERVISOR_LOCAL_KEYS {
            assert!(!json.contains_key(*key), "{key} leaked");
        }
        assert_eq!(json["title"], "example");
        assert_eq!(json["port"], 7001);
        assert_eq!(json["workers"], 2);
        assert!(json.contains_key("baseDir"));
    }

    #[test]
    fn test_package_settings() {
        let fx = Fixture::new(
            r#"{
                "name": "example",
                "egg": { "framework": "yadan", "revert": "CVE-2023-46809", "typescript": true },
                "eggScriptsConfig": {
                    "require": ["./preload.js"],
                    "node-options--allow-wasi": true,
                    "node-options--max-http-header-size": "20000",
                    "ignore-stderr": true,
                    "workers": 3,
                    "custom": "kept"
                }
            }"#,
        );
        let config = fx.resolve(StartOptions {
            require: vec!["./cli.js".into()],
            workers: Some(1),
            ..Default::default()
        });

        assert_eq!(
            &config.extra_args[..3],
            &[
                "--no-deprecation",
                "--trace-warnings",
                "--security-revert=CVE-2023-46809"
            ]
        );
        assert!(config.extra_args.contains(&"--allow-wasi".to_string()));
        assert!(config
            .extra_args
            .contains(&"--max-http-header-size=20000".to_string()));
        let require = config
            .extra_args
            .iter()
            .position(|a| a == "--require")
            .expect("sourcemap preload");
        assert!(config.extra_args[require + 1].ends_with("register.js"));

        assert!(config.ignore_stderr);
        assert_eq!(config.cluster_options["workers"], 1);
        assert_eq!(config.cluster_options["custom"], "kept");
        assert_eq!(config.cluster_options["sourcemap"], true);
        assert_eq!(
            config.cluster_options["require"],
            serde_json::json!(["./preload.js", "./cli.js"])
        );
        assert_eq!(
            config.cluster_options["framework"],
            Value::from(fx.app().join("node_modules").join("yadan").to_string_lossy().into_owned())
        );
    }

    #[test]
    fn test_esm_package() {
        let fx = Fixture::new(r#"{ "name": "example", "type": "module" }"#);
        let config = fx.resolve(StartOptions {
            sourcemap: Some(true),
            ..Default::default()
        });

        assert!(config.extra_args.contains(&"--import".to_string()));
        assert!(config
            .entry_script
            .to_string_lossy()
            .ends_with("start-cluster.mjs"));
    }

    #[test]
    fn test_framework_display_name() {
        let fx = Fixture::new(r#"{ "name": "example" }"#);
        let framework = fx.app().join("custom-framework");
        fs::create_dir_all(&framework).expect("mkdir");
        fs::write(
            framework.join("package.json"),
            r#"{ "name": "custom-framework" }"#,
        )
        .expect("write");

        let config = fx.resolve(StartOptions {
            framework: Some(framework.to_string_lossy().into_owned()),
            ..Default::default()
        });
        assert_eq!(config.framework_name, "custom-framework");
    }

    #[test]
    fn test_workers_from_environment() {
        let mut fx = Fixture::new(r#"{ "name": "example" }"#);
        fx.ambient.env.insert("EGG_WORKERS".into(), "4".into());

        let config = fx.resolve(StartOptions::default());
        assert_eq!(config.cluster_options["workers"], 4);
    }

    #[test]
    fn test_stop_criteria() {
        let fx = Fixture::new("{}");

        let options = StopOptions {
            base_dir: Some("./app".into()),
            title: Some("example".into()),
            timeout: None,
        };
        let criteria = options.criteria(&fx.ambient);

        assert_eq!(criteria.title.as_deref(), Some("example"));
        assert_eq!(criteria.base_dir, Some(fx.app()));
        assert_eq!(options.grace(), Duration::from_millis(5000));

        let options = StopOptions {
            timeout: Some(10),
            ..Default::default()
        };
        assert_eq!(options.criteria(&fx.ambient).base_dir, None);
        assert_eq!(options.grace(), Duration::from_millis(10));
    }
}
