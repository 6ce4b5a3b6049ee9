// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::PathBuf;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use tokio::runtime;

use eggctl::config::{Ambient, StartOptions, StopOptions};
use eggctl::procs::{platform_scanner, Terminator};
use eggctl::{logging, Error};

const START: &str = "start";
const STOP: &str = "stop";
const BASE_DIR: &str = "baseDir";
const VERBOSE: &str = "verbose";

trait SetupClapApp {
    fn setup_clap_app(self) -> Self;
    fn default_subcommand_opts(self) -> Self;
}

impl SetupClapApp for Command {
    fn setup_clap_app(self) -> Self {
        self.version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
    }

    fn default_subcommand_opts(self) -> Self {
        self.arg(
            Arg::new(BASE_DIR)
                .value_name("BASE_DIR")
                .value_parser(value_parser!(PathBuf))
                .help("directory of the application, defaults to the current directory"),
        )
        .arg(
            Arg::new("title")
                .long("title")
                .value_name("TITLE")
                .help("process title, used to find the application again"),
        )
        .arg(
            Arg::new(VERBOSE)
                .short('v')
                .long(VERBOSE)
                .action(ArgAction::SetTrue)
                .help("log debug output"),
        )
    }
}

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .action(ArgAction::SetTrue)
        .help(help)
}

fn start_sub_command() -> Command {
    Command::new(START)
        .about("Start the cluster master, in the foreground or as a daemon")
        .arg(
            Arg::new("framework")
                .long("framework")
                .value_name("PATH")
                .help("framework module name or absolute path"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("listening port, defaults to the framework's setting"),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .short('c')
                .alias("cluster")
                .value_name("NUMBER")
                .value_parser(value_parser!(u32))
                .help("number of app workers, defaults to the number of cpus"),
        )
        .arg(
            Arg::new("env")
                .long("env")
                .value_name("ENV")
                .help("server environment, exported as EGG_SERVER_ENV"),
        )
        .arg(flag("daemon", "detach and wait for the cluster to report readiness"))
        .arg(
            Arg::new("stdout")
                .long("stdout")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("daemon stdout log, defaults to ~/logs/master-stdout.log"),
        )
        .arg(
            Arg::new("stderr")
                .long("stderr")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("daemon stderr log, defaults to ~/logs/master-stderr.log"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("MILLIS")
                .value_parser(value_parser!(u64))
                .help("how long a daemon may take to report readiness [default: 300000]"),
        )
        .arg(flag(
            "ignore-stderr",
            "treat stderr output during a daemon start as success",
        ))
        .arg(
            Arg::new("node")
                .long("node")
                .value_name("PATH")
                .help("runtime executable [default: node]"),
        )
        .arg(
            Arg::new("require")
                .long("require")
                .short('r')
                .value_name("MODULE")
                .action(ArgAction::Append)
                .help("module to preload in every cluster process, may repeat"),
        )
        .arg(flag("sourcemap", "enable source map support for stack traces"))
        .arg(
            Arg::new("entry-script")
                .long("entry-script")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("script the runtime runs to start the cluster"),
        )
}

fn stop_sub_command() -> Command {
    Command::new(STOP)
        .about("Stop the cluster master and any worker it left behind")
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("MILLIS")
                .value_parser(value_parser!(u64))
                .help("how long to wait for the master before stopping workers [default: 5000]"),
        )
}

fn main() {
    let args = Command::new(env!("CARGO_PKG_NAME"))
        .setup_clap_app()
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            start_sub_command()
                .setup_clap_app()
                .default_subcommand_opts(),
        )
        .subcommand(
            stop_sub_command()
                .setup_clap_app()
                .default_subcommand_opts(),
        )
        .get_matches();

    let verbose = args
        .subcommand()
        .map(|(_, sub)| sub.get_flag(VERBOSE))
        .unwrap_or(false);
    logging::init(verbose);

    let runtime = match runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(%err, "failed to initialize the tokio runtime");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(async move {
        let result = match args.subcommand() {
            Some((START, args)) => start(args).await,
            Some((STOP, args)) => stop(args).await,
            Some((arg, _)) => Err(Error::from(format!("unexpected subcommand: {arg}"))),
            None => Err(Error::from("command required")),
        };

        result.unwrap_or_else(|err| {
            tracing::error!("{err}");
            err.exit_code()
        })
    });

    std::process::exit(code);
}

fn start_options(args: &ArgMatches) -> StartOptions {
    let set = |name: &str| args.get_flag(name).then_some(true);

    StartOptions {
        base_dir: args.get_one::<PathBuf>(BASE_DIR).cloned(),
        title: args.get_one::<String>("title").cloned(),
        framework: args.get_one::<String>("framework").cloned(),
        port: args.get_one::<u16>("port").copied(),
        workers: args.get_one::<u32>("workers").copied(),
        env: args.get_one::<String>("env").cloned(),
        daemon: set("daemon"),
        stdout: args.get_one::<PathBuf>("stdout").cloned(),
        stderr: args.get_one::<PathBuf>("stderr").cloned(),
        timeout: args.get_one::<u64>("timeout").copied(),
        ignore_stderr: set("ignore-stderr"),
        node: args.get_one::<String>("node").cloned(),
        require: args
            .get_many::<String>("require")
            .map(|values| values.cloned().collect())
            .unwrap_or_default(),
        sourcemap: set("sourcemap"),
        entry_script: args.get_one::<PathBuf>("entry-script").cloned(),
    }
}

#[cfg(unix)]
async fn start(args: &ArgMatches) -> Result<i32, Error> {
    use eggctl::config::LaunchConfig;
    use eggctl::procs::Supervisor;

    let ambient = Ambient::from_process()?;
    let config = LaunchConfig::resolve(start_options(args), &ambient)?;
    let outcome = Supervisor::new(config).run().await?;

    Ok(outcome.exit_code())
}

#[cfg(not(unix))]
async fn start(args: &ArgMatches) -> Result<i32, Error> {
    let _ = start_options(args);
    Err(Error::from("start is only supported on unix"))
}

async fn stop(args: &ArgMatches) -> Result<i32, Error> {
    let ambient = Ambient::from_process()?;
    let options = StopOptions {
        base_dir: args.get_one::<PathBuf>(BASE_DIR).cloned(),
        title: args.get_one::<String>("title").cloned(),
        timeout: args.get_one::<u64>("timeout").copied(),
    };

    Terminator::new(platform_scanner(), options.grace())
        .stop(&options.criteria(&ambient))
        .await?;

    Ok(0)
}
