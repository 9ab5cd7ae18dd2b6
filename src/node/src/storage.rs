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

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use prost::Message;
use qjournal_common::{layout::SegmentFileKind, Error, Result};
use qjournal_proto::{NamespaceInfo, PersistedRecoveryData};

use crate::fs;

/// Persistence of one journal directory. All multi-byte state files are
/// replaced atomically and fsync'd before any dependent response is sent.
pub struct JournalStorage {
    root: PathBuf,
}

impl JournalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        JournalStorage { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_formatted(&self) -> bool {
        fs::version_file(&self.root).is_file()
    }

    /// Create the directory structure and persist the namespace identity.
    /// Formatting an already-formatted journal wipes nothing; it only
    /// rewrites VERSION.
    pub fn format(&self, ns_info: &NamespaceInfo) -> Result<()> {
        std::fs::create_dir_all(fs::paxos_dir(&self.root))?;
        let contents = format!(
            "namespaceID={}\nclusterID={}\nblockpoolID={}\ncTime={}\nlayoutVersion={}\n",
            ns_info.namespace_id,
            ns_info.cluster_id,
            ns_info.block_pool_id,
            ns_info.creation_time,
            ns_info.layout_version,
        );
        fs::atomic_write(&fs::version_file(&self.root), contents.as_bytes())?;
        Ok(())
    }

    pub fn load_namespace_info(&self) -> Result<Option<NamespaceInfo>> {
        let path = fs::version_file(&self.root);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut ns = NamespaceInfo::default();
        for line in contents.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "namespaceID" => ns.namespace_id = parse_field(value, &path)?,
                "clusterID" => ns.cluster_id = value.to_owned(),
                "blockpoolID" => ns.block_pool_id = value.to_owned(),
                "cTime" => ns.creation_time = parse_field(value, &path)?,
                "layoutVersion" => ns.layout_version = parse_field(value, &path)?,
                _ => {}
            }
        }
        Ok(Some(ns))
    }

    pub fn read_promised_epoch(&self) -> Result<u64> {
        read_epoch_file(&fs::promised_epoch_file(&self.root))
    }

    pub fn write_promised_epoch(&self, epoch: u64) -> Result<()> {
        fs::atomic_write(&fs::promised_epoch_file(&self.root), &epoch.to_be_bytes())?;
        Ok(())
    }

    pub fn read_writer_epoch(&self) -> Result<u64> {
        read_epoch_file(&fs::writer_epoch_file(&self.root))
    }

    pub fn write_writer_epoch(&self, epoch: u64) -> Result<()> {
        fs::atomic_write(&fs::writer_epoch_file(&self.root), &epoch.to_be_bytes())?;
        Ok(())
    }

    pub fn persist_paxos_data(&self, segment_tx_id: u64, data: &PersistedRecoveryData) -> Result<()> {
        fs::atomic_write(&fs::paxos_path(&self.root, segment_tx_id), &data.encode_to_vec())?;
        Ok(())
    }

    pub fn load_paxos_data(&self, segment_tx_id: u64) -> Result<Option<PersistedRecoveryData>> {
        let path = fs::paxos_path(&self.root, segment_tx_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let data = PersistedRecoveryData::decode(bytes.as_slice())
            .map_err(|err| Error::Io(format!("corrupt paxos data {}: {err}", path.display())))?;
        Ok(Some(data))
    }

    /// The newest on-disk segment by start txid, finalized or in progress.
    /// An in-progress segment wins a tie against a finalized one with the
    /// same start (it supersedes it during recovery).
    pub fn newest_segment(&self) -> Result<Option<SegmentFileKind>> {
        let mut newest: Option<SegmentFileKind> = None;
        for entry in read_current_dir(&fs::current_dir(&self.root))? {
            let kind = match crate::fs::parse_file_name(entry?.path()) {
                crate::fs::FileType::InProgress(start) => SegmentFileKind::InProgress(start),
                crate::fs::FileType::Finalized(start, end) => SegmentFileKind::Finalized(start, end),
                _ => continue,
            };
            newest = Some(match newest {
                None => kind,
                Some(cur) if segment_order(&kind) > segment_order(&cur) => kind,
                Some(cur) => cur,
            });
        }
        Ok(newest)
    }

    /// Find the finalized segment starting at `start_tx_id`, if any.
    pub fn find_finalized(&self, start_tx_id: u64) -> Result<Option<(u64, PathBuf)>> {
        for entry in read_current_dir(&fs::current_dir(&self.root))? {
            let path = entry?.path();
            if let crate::fs::FileType::Finalized(start, end) = crate::fs::parse_file_name(&path) {
                if start == start_tx_id {
                    return Ok(Some((end, path)));
                }
            }
        }
        Ok(None)
    }

    pub fn inprogress_path(&self, start_tx_id: u64) -> PathBuf {
        fs::inprogress_path(&self.root, start_tx_id)
    }

    pub fn finalized_path(&self, start_tx_id: u64, end_tx_id: u64) -> PathBuf {
        fs::finalized_path(&self.root, start_tx_id, end_tx_id)
    }

    pub fn temp_path(&self, start_tx_id: u64) -> PathBuf {
        fs::temp_path(&self.root, start_tx_id)
    }

    /// Create an empty in-progress segment file, durably.
    pub fn create_inprogress(&self, start_tx_id: u64) -> Result<File> {
        let path = self.inprogress_path(start_tx_id);
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.sync_all()?;
        fs::fsync_dir(&fs::current_dir(&self.root))?;
        Ok(file)
    }

    pub fn open_inprogress(&self, start_tx_id: u64) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .append(true)
            .open(self.inprogress_path(start_tx_id))?)
    }

    /// Rename the in-progress segment into its finalized form.
    pub fn finalize_segment(&self, start_tx_id: u64, end_tx_id: u64) -> Result<()> {
        std::fs::rename(
            self.inprogress_path(start_tx_id),
            self.finalized_path(start_tx_id, end_tx_id),
        )?;
        fs::fsync_dir(&fs::current_dir(&self.root))?;
        Ok(())
    }

    /// Atomically install `tmp` as the in-progress segment.
    pub fn install_inprogress(&self, tmp: &Path, start_tx_id: u64) -> Result<()> {
        std::fs::rename(tmp, self.inprogress_path(start_tx_id))?;
        fs::fsync_dir(&fs::current_dir(&self.root))?;
        Ok(())
    }
}

fn segment_order(kind: &SegmentFileKind) -> (u64, bool) {
    match kind {
        SegmentFileKind::InProgress(start) => (*start, true),
        SegmentFileKind::Finalized(start, _) => (*start, false),
    }
}

fn parse_field<T: std::str::FromStr>(value: &str, path: &Path) -> Result<T> {
    value.parse().map_err(|_| {
        Error::Io(format!(
            "corrupt VERSION file {}: bad value {value:?}",
            path.display()
        ))
    })
}

fn read_epoch_file(path: &Path) -> Result<u64> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                Error::Io(format!("epoch file {} has invalid length {}", path.display(), bytes.len()))
            })?;
            Ok(u64::from_be_bytes(arr))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err.into()),
    }
}

fn read_current_dir(dir: &Path) -> Result<impl Iterator<Item = std::io::Result<std::fs::DirEntry>>> {
    match std::fs::read_dir(dir) {
        Ok(iter) => Ok(iter),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::Io(format!("journal directory {} does not exist", dir.display())))
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qjournal_proto::SegmentInfo;
    use tempfile::TempDir;

    fn test_ns() -> NamespaceInfo {
        NamespaceInfo {
            namespace_id: 12345,
            cluster_id: "mycluster".to_owned(),
            block_pool_id: "my-bp".to_owned(),
            creation_time: 0,
            layout_version: qjournal_common::LAYOUT_VERSION,
        }
    }

    #[test]
    fn version_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let storage = JournalStorage::new(dir.path());
        assert!(!storage.is_formatted());
        assert_eq!(storage.load_namespace_info().unwrap(), None);

        storage.format(&test_ns()).unwrap();
        assert!(storage.is_formatted());
        assert_eq!(storage.load_namespace_info().unwrap(), Some(test_ns()));
    }

    #[test]
    fn epoch_files_default_to_zero() {
        let dir = TempDir::new().unwrap();
        let storage = JournalStorage::new(dir.path());
        storage.format(&test_ns()).unwrap();
        assert_eq!(storage.read_promised_epoch().unwrap(), 0);

        storage.write_promised_epoch(7).unwrap();
        assert_eq!(storage.read_promised_epoch().unwrap(), 7);
        assert_eq!(storage.read_writer_epoch().unwrap(), 0);
    }

    #[test]
    fn paxos_data_round_trips() {
        let dir = TempDir::new().unwrap();
        let storage = JournalStorage::new(dir.path());
        storage.format(&test_ns()).unwrap();

        assert_eq!(storage.load_paxos_data(1).unwrap(), None);
        let data = PersistedRecoveryData {
            segment_state: Some(SegmentInfo::in_progress(1, 2, 64)),
            accepted_in_epoch: 3,
            from_url: "http://127.0.0.1:1/getimage".to_owned(),
        };
        storage.persist_paxos_data(1, &data).unwrap();
        assert_eq!(storage.load_paxos_data(1).unwrap(), Some(data));
    }

    #[test]
    fn newest_segment_prefers_highest_start() {
        let dir = TempDir::new().unwrap();
        let storage = JournalStorage::new(dir.path());
        storage.format(&test_ns()).unwrap();

        assert_eq!(storage.newest_segment().unwrap(), None);
        std::fs::write(storage.finalized_path(1, 3), b"x").unwrap();
        assert_eq!(
            storage.newest_segment().unwrap(),
            Some(SegmentFileKind::Finalized(1, 3))
        );
        std::fs::write(storage.inprogress_path(4), b"").unwrap();
        assert_eq!(
            storage.newest_segment().unwrap(),
            Some(SegmentFileKind::InProgress(4))
        );
    }
}
