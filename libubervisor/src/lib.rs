// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{env, fs, io, path::PathBuf, sync::Mutex};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod config;
pub mod consts;
mod daemon;
mod test_hooks;

/// The command line arguments that ubervisor expects. These can be
/// directly parsed with clap or manually constructed in order to present
/// some other user interface.
///
/// NOTE: You must check `version()` and handle it yourself if it is set.
/// Clap won't do a good job with its automatic version support for a
/// library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(short, long, action, help = "The file to write logs to. Defaults to stderr.")]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(
        short,
        long,
        action,
        long_help = "The path for the unix socket to listen on

This defaults to ~/.uber/socket."
    )]
    pub socket: Option<String>,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// The subcommands that ubervisor supports. Only `daemon` runs the
/// supervisor itself; issuing individual RPCs from the command line is
/// out of scope for this crate (see the language-binding client instead).
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Starts the supervisor daemon that owns all process groups")]
    Daemon,
}

impl Args {
    /// Version indicates if the wrapping binary must display the
    /// version then exit.
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Run the ubervisor tool with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else if let Commands::Daemon = args.command {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    #[cfg(feature = "test_hooks")]
    if let Ok(test_hook_sock) = env::var("UBERVISOR_TEST_HOOK_SOCKET_PATH") {
        log::info!("spawning test hook sock at {}", test_hook_sock);
        test_hooks::TEST_HOOK_SERVER.set_socket_path(test_hook_sock.clone());
        std::thread::spawn(|| {
            test_hooks::TEST_HOOK_SERVER.start();
        });
        log::info!("waiting for test hook connection");
        test_hooks::TEST_HOOK_SERVER.wait_for_connect()?;
    }

    let socket = match args.socket.or_else(|| env::var(consts::SOCKET_ENV_VAR).ok()) {
        Some(s) => PathBuf::from(s),
        None => {
            let uber_dir = PathBuf::from(env::var("HOME").context("no HOME")?).join(".uber");
            if let Err(e) = fs::create_dir_all(&uber_dir) {
                if e.kind() != io::ErrorKind::AlreadyExists {
                    return Err(e).context("creating ~/.uber");
                }
            }
            uber_dir.join("socket")
        }
    };

    let config_manager = config::Manager::new(args.config_file)?;

    let res: anyhow::Result<()> = match args.command {
        Commands::Version => return Err(anyhow!("wrapper binary must handle version")),
        Commands::Daemon => daemon::run(config_manager, socket),
    };

    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}
