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

//! Persistence (C9): snapshot group configuration (not live pids, which
//! don't survive a restart) to a JSON dump file, and reload it at
//! startup.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use ubervisor_protocol::GroupConfig;

use crate::daemon::registry::Registry;

/// Write every group's configuration to `path`, via a write-to-temp-then-
/// rename so a crash mid-write never leaves a half-written dump behind.
pub fn write(registry: &Registry, path: &Path) -> anyhow::Result<()> {
    let configs: HashMap<String, GroupConfig> =
        registry.iter().map(|g| (g.name.clone(), g.to_config())).collect();
    let body = serde_json::to_vec_pretty(&configs).context("serializing dump")?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating dump directory {:?}", parent))?;
    }

    let tmp_path = tmp_path_for(path);
    fs::write(&tmp_path, &body).with_context(|| format!("writing dump temp file {:?}", tmp_path))?;
    fs::rename(&tmp_path, path).with_context(|| format!("renaming dump temp file into {:?}", path))?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Load a previously-written dump, if one exists. Returns an empty
/// `Vec` (not an error) when the file is simply absent, since the first
/// run of a fresh daemon has nothing to load.
pub fn load(path: &Path) -> anyhow::Result<Vec<GroupConfig>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let body = fs::read_to_string(path).with_context(|| format!("reading dump file {:?}", path))?;
    let configs: HashMap<String, GroupConfig> =
        serde_json::from_str(&body).context("parsing dump file")?;
    Ok(configs.into_values().collect())
}
