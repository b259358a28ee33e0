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

//! The supervisor daemon: a single-threaded reactor owning every process
//! group's lifecycle. `run` is the entry point invoked by the `daemon`
//! subcommand; everything else in this module is split by the piece of
//! the system it owns.

use std::path::PathBuf;

use tracing::info;

use crate::config;

mod codec;
mod dispatch;
mod dump;
mod events;
mod logs;
mod reaper;
mod registry;
mod server;
mod signals;
mod supervisor;

pub fn run(config_manager: config::Manager, socket: PathBuf) -> anyhow::Result<()> {
    info!(socket = %socket.display(), "starting ubervisor daemon");
    let mut server = server::Server::bind(socket, config_manager)?;
    server.serve()
}
