// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use crate::{
    Result,
    roll_cycle::{CYCLE_FILE_SUFFIX, RollCycle},
};

/// Returns full path to a cycle file: `base/<cycle name>.cq4`.
pub fn cycle_file_path<P: AsRef<Path>>(
    base: P,
    roll_cycle: RollCycle,
    cycle: i64,
) -> Result<PathBuf> {
    Ok(base.as_ref().join(roll_cycle.file_name(cycle)?))
}

/// Lists every `.cq4` file directly under `base`, sorted by name.
pub fn scan_cycle_files<P: AsRef<Path>>(base: P) -> Result<Vec<PathBuf>> {
    let base = base.as_ref();
    let mut files = Vec::new();
    if !base.exists() {
        return Ok(files);
    }

    for entry in std::fs::read_dir(base)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some(CYCLE_FILE_SUFFIX) {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

/// Cycles that have a backing file under `base`. Files whose names the roll
/// cycle cannot parse are skipped.
pub fn scan_cycles<P: AsRef<Path>>(base: P, roll_cycle: RollCycle) -> Result<BTreeSet<i64>> {
    Ok(scan_cycle_files(base)?
        .iter()
        .filter_map(|path| path.file_name().and_then(|name| name.to_str()))
        .filter_map(|name| roll_cycle.parse_cycle(name))
        .collect())
}
