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

use std::time;

/// Environment variable that selects the control socket path, overriding
/// the default resolved in `lib.rs`.
pub const SOCKET_ENV_VAR: &str = "UBERVISOR_SOCKET";

/// Environment variable that names a command used to tunnel the control
/// protocol over stdio (e.g. through ssh). Only meaningful to clients --
/// the server never sees the tunnel, only the resulting stream.
pub const RSH_ENV_VAR: &str = "UBERVISOR_RSH";

pub const DEFAULT_DUMP_FILENAME: &str = "dump.json";

pub const DEFAULT_FAST_FAIL_THRESHOLD: time::Duration = time::Duration::from_secs(1);
pub const DEFAULT_FAST_FAIL_LIMIT: u32 = 5;
pub const DEFAULT_FAST_FAIL_WINDOW: time::Duration = time::Duration::from_secs(10);

pub const DEFAULT_HEARTBEAT_INTERVAL: time::Duration = time::Duration::from_secs(5);
pub const DEFAULT_AGE_CHECK_INTERVAL: time::Duration = time::Duration::from_secs(5);

pub const DEFAULT_LOG_OPEN_MODE: u32 = 0o644;

pub const MIN_INSTANCES: u32 = 1;
pub const MAX_INSTANCES: u32 = 1024;

pub const MIN_SIGNAL: i32 = 1;
pub const MAX_SIGNAL: i32 = 31;

/// Signal `KILL` sends when a request omits `sig`: SIGTERM.
pub const DEFAULT_KILLSIG: i32 = 15;

/// Reactor poll timeout: the longest the main loop will block in a single
/// turn before re-checking timers, even if nothing becomes readable.
pub const REACTOR_POLL_INTERVAL: time::Duration = time::Duration::from_millis(250);
