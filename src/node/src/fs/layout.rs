// Copyright 2026 The QJournal Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! On-disk layout of one journal directory:
//!
//! ```text
//! <journal root>/current/VERSION
//! <journal root>/current/last-promised-epoch
//! <journal root>/current/last-writer-epoch
//! <journal root>/current/paxos/<segmentTxId>
//! <journal root>/current/edits_inprogress_<startTxId>
//! <journal root>/current/edits_<startTxId>-<endTxId>
//! ```

use std::path::{Path, PathBuf};

use qjournal_common::layout::{self, SegmentFileKind};

pub const VERSION_FILE: &str = "VERSION";
pub const PROMISED_EPOCH_FILE: &str = "last-promised-epoch";
pub const WRITER_EPOCH_FILE: &str = "last-writer-epoch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileType {
    Version,
    PromisedEpoch,
    WriterEpoch,
    InProgress(u64),
    Finalized(u64, u64),
    Temp,
    Unknown,
}

pub fn current_dir<P: AsRef<Path>>(root: P) -> PathBuf {
    root.as_ref().join("current")
}

pub fn version_file<P: AsRef<Path>>(root: P) -> PathBuf {
    current_dir(root).join(VERSION_FILE)
}

pub fn promised_epoch_file<P: AsRef<Path>>(root: P) -> PathBuf {
    current_dir(root).join(PROMISED_EPOCH_FILE)
}

pub fn writer_epoch_file<P: AsRef<Path>>(root: P) -> PathBuf {
    current_dir(root).join(WRITER_EPOCH_FILE)
}

pub fn paxos_dir<P: AsRef<Path>>(root: P) -> PathBuf {
    current_dir(root).join("paxos")
}

pub fn paxos_path<P: AsRef<Path>>(root: P, segment_tx_id: u64) -> PathBuf {
    paxos_dir(root).join(format!("{}", segment_tx_id))
}

pub fn inprogress_path<P: AsRef<Path>>(root: P, start_tx_id: u64) -> PathBuf {
    current_dir(root).join(layout::inprogress_name(start_tx_id))
}

pub fn finalized_path<P: AsRef<Path>>(root: P, start_tx_id: u64, end_tx_id: u64) -> PathBuf {
    current_dir(root).join(layout::finalized_name(start_tx_id, end_tx_id))
}

pub fn temp_path<P: AsRef<Path>>(root: P, start_tx_id: u64) -> PathBuf {
    current_dir(root).join(format!("{}.tmp", layout::inprogress_name(start_tx_id)))
}

pub fn parse_file_name<P: AsRef<Path>>(path: P) -> FileType {
    let name = match path.as_ref().file_name().and_then(|s| s.to_str()) {
        Some(name) => name,
        None => return FileType::Unknown,
    };
    match name {
        VERSION_FILE => FileType::Version,
        PROMISED_EPOCH_FILE => FileType::PromisedEpoch,
        WRITER_EPOCH_FILE => FileType::WriterEpoch,
        _ if name.ends_with(".tmp") => FileType::Temp,
        _ => match layout::parse_segment_name(name) {
            Some(SegmentFileKind::InProgress(start)) => FileType::InProgress(start),
            Some(SegmentFileKind::Finalized(start, end)) => FileType::Finalized(start, end),
            None => FileType::Unknown,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_layout_files() {
        assert_eq!(parse_file_name("current/VERSION"), FileType::Version);
        assert_eq!(
            parse_file_name("current/edits_inprogress_0000000000000000001"),
            FileType::InProgress(1)
        );
        assert_eq!(
            parse_file_name("current/edits_0000000000000000001-0000000000000000003"),
            FileType::Finalized(1, 3)
        );
        assert_eq!(
            parse_file_name("current/edits_inprogress_0000000000000000001.tmp"),
            FileType::Temp
        );
        assert_eq!(parse_file_name("current/garbage"), FileType::Unknown);
    }
}
