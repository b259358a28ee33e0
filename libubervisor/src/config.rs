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

use std::{env, fs, path::PathBuf, time::Duration};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::consts;

/// Tunables the wire protocol has no room for. Read once at startup,
/// unlike the teacher's config, which is watched for live edits -- none
/// of these values are safe to change out from under a running
/// supervision loop, so there is no reload path.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub fast_fail_threshold_ms: u64,
    pub fast_fail_limit: u32,
    pub fast_fail_window_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub age_check_interval_secs: u64,
    pub max_client_write_queue_bytes: usize,
    pub max_message_bytes: usize,
    pub max_read_bytes: usize,
    pub dump_file: Option<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            fast_fail_threshold_ms: consts::DEFAULT_FAST_FAIL_THRESHOLD.as_millis() as u64,
            fast_fail_limit: consts::DEFAULT_FAST_FAIL_LIMIT,
            fast_fail_window_secs: consts::DEFAULT_FAST_FAIL_WINDOW.as_secs(),
            heartbeat_interval_secs: consts::DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
            age_check_interval_secs: consts::DEFAULT_AGE_CHECK_INTERVAL.as_secs(),
            max_client_write_queue_bytes: ubervisor_protocol::DEFAULT_MAX_WRITE_QUEUE_BYTES,
            max_message_bytes: ubervisor_protocol::DEFAULT_MAX_MESSAGE_BYTES,
            max_read_bytes: ubervisor_protocol::DEFAULT_MAX_READ_BYTES,
            dump_file: None,
        }
    }
}

impl Config {
    pub fn fast_fail_threshold(&self) -> Duration {
        Duration::from_millis(self.fast_fail_threshold_ms)
    }

    pub fn fast_fail_window(&self) -> Duration {
        Duration::from_secs(self.fast_fail_window_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn age_check_interval(&self) -> Duration {
        Duration::from_secs(self.age_check_interval_secs)
    }

    pub fn dump_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(p) = &self.dump_file {
            return Ok(PathBuf::from(p));
        }
        let home = env::var("HOME").context("no HOME in environment")?;
        Ok(PathBuf::from(home).join(".uber").join(consts::DEFAULT_DUMP_FILENAME))
    }
}

/// Manager owns the resolved configuration. A distinct type (rather than
/// a bare `Config`) so the daemon and its subcomponents can be handed a
/// cheap `Clone` the way the teacher's `config::Manager` is threaded
/// through `server.rs`.
#[derive(Debug, Clone)]
pub struct Manager {
    config: Config,
}

impl Manager {
    #[instrument(skip_all)]
    pub fn new(config_file: Option<String>) -> anyhow::Result<Manager> {
        let config = read_config(&config_file)?;
        Ok(Manager { config })
    }

    pub fn get(&self) -> &Config {
        &self.config
    }
}

#[instrument(skip_all)]
fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml")?;
        return toml::from_str(&config_str).context("parsing config file");
    }

    let candidate = match env::var("XDG_CONFIG_HOME") {
        Ok(xdg) => PathBuf::from(xdg).join("ubervisor").join("config.toml"),
        Err(_) => {
            let home = env::var("HOME").context("no XDG_CONFIG_HOME or HOME")?;
            PathBuf::from(home).join(".config").join("ubervisor").join("config.toml")
        }
    };

    if candidate.exists() {
        let config_str = fs::read_to_string(&candidate).context("reading config toml")?;
        return toml::from_str(&config_str).context("parsing config file");
    }

    Ok(Config::default())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_consts() {
        let c = Config::default();
        assert_eq!(c.fast_fail_limit, consts::DEFAULT_FAST_FAIL_LIMIT);
        assert_eq!(c.fast_fail_threshold(), consts::DEFAULT_FAST_FAIL_THRESHOLD);
    }

    #[test]
    fn parse() -> anyhow::Result<()> {
        let cases = vec![
            r#"
            fast_fail_limit = 3
            heartbeat_interval_secs = 2
            "#,
            r#"
            dump_file = "/tmp/dump.json"
            "#,
            "",
        ];

        for case in cases.into_iter() {
            let _: Config = toml::from_str(case)?;
        }

        Ok(())
    }
}
