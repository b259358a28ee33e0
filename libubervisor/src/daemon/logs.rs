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

//! The log reader (C8): serves `READ` by seeking into a live instance's
//! redirected stdout/stderr file.

use std::{
    fs::File,
    io::{Read as _, Seek, SeekFrom},
};

use anyhow::Context;

/// Read up to `bytes` bytes (capped at `max_read_bytes`) from `path`,
/// starting at `offset`. A non-negative `offset` is clamped to the file
/// size (reading from the end yields an empty string, not an error); a
/// negative `offset` counts back from the end of the file, clamped to 0.
/// `bytes < 0` means "as much as is available, up to the cap".
pub fn read(path: &str, offset: i64, bytes: i64, max_read_bytes: usize) -> anyhow::Result<(String, u64)> {
    let mut file = File::open(path).with_context(|| format!("opening log file {}", path))?;
    let fsize = file.metadata().context("statting log file")?.len();

    let start = if offset < 0 {
        (fsize as i64 + offset).max(0) as u64
    } else {
        (offset as u64).min(fsize)
    };

    let want = if bytes < 0 { max_read_bytes } else { (bytes as u64).min(max_read_bytes as u64) as usize };

    file.seek(SeekFrom::Start(start)).context("seeking log file")?;
    let mut buf = vec![0u8; want];
    let mut total = 0usize;
    loop {
        if total == buf.len() {
            break;
        }
        let n = file.read(&mut buf[total..]).context("reading log file")?;
        if n == 0 {
            break;
        }
        total += n;
    }
    buf.truncate(total);

    Ok((String::from_utf8_lossy(&buf).into_owned(), fsize))
}
