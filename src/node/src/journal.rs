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
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use qjournal_common::{layout::SegmentFileKind, record, Error, Result, LAYOUT_VERSION};
use qjournal_proto::{NamespaceInfo, PersistedRecoveryData, RequestInfo, SegmentInfo};
use tracing::{info, warn};

use crate::{opt::NodeOption, storage::JournalStorage};

/// The state machine of one journal: epoch promises, the open segment, and
/// the Paxos acceptor role for tail recovery. Callers serialize access
/// through a per-journal mutex; every state transition observed by another
/// process is made durable before the method returns.
pub struct Journal {
    jid: String,
    storage: JournalStorage,
    ns_info: Option<NamespaceInfo>,
    last_promised_epoch: u64,
    last_writer_epoch: u64,
    cur_segment: Option<OpenSegment>,
    sync_data: bool,
    fetcher: reqwest::Client,
}

struct OpenSegment {
    start_tx_id: u64,
    next_tx_id: u64,
    bytes_written: u64,
    file: File,
}

/// What a Paxos prepare reports back to the recovery coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareOutcome {
    pub segment_state: Option<SegmentInfo>,
    pub accepted_recovery: Option<PersistedRecoveryData>,
    pub last_writer_epoch: Option<u64>,
}

impl Journal {
    /// Open (or re-open after restart) the journal rooted at `root`.
    /// An unformatted directory yields a journal that rejects every
    /// operation until `format` is called.
    pub fn open(jid: impl Into<String>, root: impl Into<PathBuf>, opt: &NodeOption) -> Result<Journal> {
        let jid = jid.into();
        let storage = JournalStorage::new(root);
        let ns_info = storage.load_namespace_info()?;
        let (last_promised_epoch, last_writer_epoch) = if ns_info.is_some() {
            (storage.read_promised_epoch()?, storage.read_writer_epoch()?)
        } else {
            (0, 0)
        };

        Ok(Journal {
            jid,
            storage,
            ns_info,
            last_promised_epoch,
            last_writer_epoch,
            cur_segment: None,
            sync_data: opt.sync_data,
            fetcher: reqwest::Client::new(),
        })
    }

    pub fn jid(&self) -> &str {
        &self.jid
    }

    pub fn last_promised_epoch(&self) -> u64 {
        self.last_promised_epoch
    }

    pub fn is_formatted(&self) -> bool {
        self.ns_info.is_some()
    }

    pub fn storage(&self) -> &JournalStorage {
        &self.storage
    }

    /// Operator-driven, once per journal, before any RPC can succeed.
    pub fn format(&mut self, ns_info: &NamespaceInfo) -> Result<()> {
        if ns_info.namespace_id == 0 {
            return Err(Error::NamespaceMismatch(
                "refusing to format with a zero namespace id".to_owned(),
            ));
        }
        self.storage.format(ns_info)?;
        self.ns_info = Some(ns_info.clone());
        info!(jid = %self.jid, nsid = ns_info.namespace_id, "formatted journal");
        Ok(())
    }

    /// Promise `proposed_epoch`, fencing all earlier writers. The promise
    /// is durable before this returns. Reports the start txid of the
    /// newest on-disk segment so the new writer can find the tail.
    pub fn new_epoch(&mut self, ns_info: &NamespaceInfo, proposed_epoch: u64) -> Result<Option<u64>> {
        self.check_formatted()?;
        self.check_namespace(Some(ns_info))?;
        if proposed_epoch <= self.last_promised_epoch {
            return Err(Error::EpochTooLow(format!(
                "proposed epoch {} <= last promised epoch {}",
                proposed_epoch, self.last_promised_epoch
            )));
        }
        self.storage.write_promised_epoch(proposed_epoch)?;
        self.last_promised_epoch = proposed_epoch;
        info!(jid = %self.jid, epoch = proposed_epoch, "promised new epoch");

        let last_segment_tx_id = self.storage.newest_segment()?.map(|kind| match kind {
            SegmentFileKind::InProgress(start) => start,
            SegmentFileKind::Finalized(start, _) => start,
        });
        Ok(last_segment_tx_id)
    }

    pub fn start_log_segment(&mut self, req: &RequestInfo, tx_id: u64) -> Result<()> {
        self.check_write_request(req)?;
        if tx_id == 0 {
            return Err(Error::SegmentState(
                "segment start txid must be positive".to_owned(),
            ));
        }

        let stale_start = match &self.cur_segment {
            Some(seg) if seg.start_tx_id == tx_id && self.last_writer_epoch == req.epoch => {
                // Retry of the call that already succeeded.
                return Ok(());
            }
            Some(seg) if self.last_writer_epoch < req.epoch => Some(seg.start_tx_id),
            Some(seg) => {
                return Err(Error::SegmentState(format!(
                    "segment starting at txid {} is already open; refusing to start segment {}",
                    seg.start_tx_id, tx_id
                )));
            }
            None => None,
        };
        if let Some(stale_start) = stale_start {
            // The open segment belongs to a fenced writer; its bytes stay
            // on disk for recovery, but it takes no more appends.
            warn!(
                jid = %self.jid,
                stale_start,
                writer_epoch = self.last_writer_epoch,
                epoch = req.epoch,
                "closing segment left open by a fenced writer"
            );
            self.cur_segment = None;
        }

        if let Some((end, _)) = self.storage.find_finalized(tx_id)? {
            return Err(Error::SegmentState(format!(
                "segment starting at txid {} is already finalized through {}",
                tx_id, end
            )));
        }

        if req.epoch != self.last_writer_epoch {
            self.storage.write_writer_epoch(req.epoch)?;
            self.last_writer_epoch = req.epoch;
        }

        let path = self.storage.inprogress_path(tx_id);
        let file = if path.is_file() {
            // Left over from a previous writer generation. Recovery under
            // this epoch decides its fate; a fresh start may only reuse an
            // empty file.
            let len = std::fs::metadata(&path)?.len();
            if len != 0 {
                return Err(Error::SegmentState(format!(
                    "in-progress segment starting at txid {} already holds {} bytes",
                    tx_id, len
                )));
            }
            self.storage.open_inprogress(tx_id)?
        } else {
            self.storage.create_inprogress(tx_id)?
        };

        self.cur_segment = Some(OpenSegment {
            start_tx_id: tx_id,
            next_tx_id: tx_id,
            bytes_written: 0,
            file,
        });
        info!(jid = %self.jid, epoch = req.epoch, start = tx_id, "started log segment");
        Ok(())
    }

    /// Append `records` to the open segment. The payload is written
    /// verbatim, then synced, before the response is sent.
    pub fn journal(
        &mut self,
        req: &RequestInfo,
        first_tx_id: u64,
        num_txns: u32,
        records: &[u8],
    ) -> Result<()> {
        self.check_write_request(req)?;
        if req.epoch != self.last_writer_epoch {
            return Err(Error::EpochMismatch(format!(
                "epoch {} does not match the last writer epoch {}",
                req.epoch, self.last_writer_epoch
            )));
        }
        let sync_data = self.sync_data;
        let seg = self
            .cur_segment
            .as_mut()
            .ok_or_else(|| Error::SegmentState("no log segment is open for writing".to_owned()))?;
        if first_tx_id != seg.next_tx_id {
            return Err(Error::OutOfSync(format!(
                "can't write txid {} expecting next txid {}",
                first_tx_id, seg.next_tx_id
            )));
        }

        seg.file.write_all(records)?;
        if sync_data {
            seg.file.sync_data()?;
        }
        seg.next_tx_id += num_txns as u64;
        seg.bytes_written += records.len() as u64;
        Ok(())
    }

    pub fn finalize_log_segment(&mut self, req: &RequestInfo, start_tx_id: u64, end_tx_id: u64) -> Result<()> {
        self.check_write_request(req)?;
        if end_tx_id < start_tx_id {
            return Err(Error::SegmentState(format!(
                "invalid segment range [{}, {}]",
                start_tx_id, end_tx_id
            )));
        }

        if let Some((end, _)) = self.storage.find_finalized(start_tx_id)? {
            if end == end_tx_id {
                // Already finalized with the same range.
                return Ok(());
            }
            return Err(Error::SegmentState(format!(
                "segment starting at txid {} is already finalized through {}, refusing to finalize at {}",
                start_tx_id, end, end_tx_id
            )));
        }

        if req.epoch != self.last_writer_epoch {
            return Err(Error::EpochMismatch(format!(
                "epoch {} does not match the last writer epoch {}",
                req.epoch, self.last_writer_epoch
            )));
        }

        let open_matches = match &self.cur_segment {
            Some(seg) if seg.start_tx_id == start_tx_id => {
                let last_written = seg.next_tx_id - 1;
                if last_written != end_tx_id {
                    return Err(Error::SegmentState(format!(
                        "end txid {} does not match the last written txid {}",
                        end_tx_id, last_written
                    )));
                }
                true
            }
            Some(seg) => {
                return Err(Error::SegmentState(format!(
                    "open segment starts at txid {}, not {}",
                    seg.start_tx_id, start_tx_id
                )));
            }
            None => false,
        };

        if open_matches {
            let seg = self.cur_segment.take().expect("segment is open");
            seg.file.sync_all()?;
        } else {
            // A segment written by a previous incarnation of this node.
            let path = self.storage.inprogress_path(start_tx_id);
            if !path.is_file() {
                return Err(Error::SegmentState(format!(
                    "no in-progress segment starting at txid {}",
                    start_tx_id
                )));
            }
            let scan = scan_file(&path, start_tx_id)?;
            if scan.last_tx_id != Some(end_tx_id) {
                return Err(Error::SegmentState(format!(
                    "end txid {} does not match the last recovered txid {:?}",
                    end_tx_id, scan.last_tx_id
                )));
            }
            if scan.torn {
                truncate_file(&path, scan.valid_bytes)?;
            }
        }

        self.storage.finalize_segment(start_tx_id, end_tx_id)?;
        info!(jid = %self.jid, start = start_tx_id, end = end_tx_id, "finalized log segment");
        Ok(())
    }

    /// Paxos prepare: report the local view of the segment starting at
    /// `segment_tx_id` and any previously accepted recovery value.
    pub fn prepare_recovery(&mut self, req: &RequestInfo, segment_tx_id: u64) -> Result<PrepareOutcome> {
        self.check_paxos_request(req)?;
        let segment_state = self.segment_info(segment_tx_id)?;
        let accepted_recovery = self.storage.load_paxos_data(segment_tx_id)?;
        Ok(PrepareOutcome {
            segment_state,
            accepted_recovery,
            last_writer_epoch: Some(self.last_writer_epoch),
        })
    }

    /// Paxos accept: adopt `state` as the definitive version of the
    /// segment, fetching its bytes from `from_url` unless the local copy
    /// already matches. Write order: fetch to temp, persist the accepted
    /// record, install the segment, fsync.
    pub async fn accept_recovery(
        &mut self,
        req: &RequestInfo,
        state: &SegmentInfo,
        from_url: &str,
    ) -> Result<()> {
        self.check_paxos_request(req)?;
        let start = state.start_tx_id;
        if start == 0 {
            return Err(Error::SegmentState(
                "segment start txid must be positive".to_owned(),
            ));
        }

        if let Some((end, _)) = self.storage.find_finalized(start)? {
            if end != state.end_tx_id {
                return Err(Error::SegmentState(format!(
                    "segment starting at txid {} is already finalized through {}, cannot accept [{}, {}]",
                    start, end, start, state.end_tx_id
                )));
            }
            self.persist_acceptance(req, state, from_url)?;
            return Ok(());
        }

        let path = self.storage.inprogress_path(start);
        let local_matches = if path.is_file() {
            let scan = scan_file(&path, start)?;
            scan.valid_bytes == state.size_bytes
                && (state.is_empty() || scan.last_tx_id == Some(state.end_tx_id))
        } else {
            false
        };

        let fetched = if local_matches {
            None
        } else {
            let bytes = self.fetch_segment(from_url, state.size_bytes).await?;
            let tmp = self.storage.temp_path(start);
            write_temp(&tmp, &bytes)?;
            Some(tmp)
        };

        // The segment being replaced can no longer be appended to.
        if matches!(&self.cur_segment, Some(seg) if seg.start_tx_id == start) {
            self.cur_segment = None;
        }

        self.persist_acceptance(req, state, from_url)?;

        match fetched {
            Some(tmp) => self.storage.install_inprogress(&tmp, start)?,
            None => {
                let len = std::fs::metadata(&path)?.len();
                if len > state.size_bytes {
                    // Drop a torn tail past the accepted prefix.
                    truncate_file(&path, state.size_bytes)?;
                }
            }
        }

        let file = self.storage.open_inprogress(start)?;
        self.cur_segment = Some(OpenSegment {
            start_tx_id: start,
            next_tx_id: state.end_tx_id + 1,
            bytes_written: state.size_bytes,
            file,
        });
        info!(
            jid = %self.jid,
            epoch = req.epoch,
            %state,
            from_url,
            "accepted recovery value"
        );
        Ok(())
    }

    fn persist_acceptance(&mut self, req: &RequestInfo, state: &SegmentInfo, from_url: &str) -> Result<()> {
        self.storage.persist_paxos_data(
            state.start_tx_id,
            &PersistedRecoveryData {
                segment_state: Some(state.clone()),
                accepted_in_epoch: req.epoch,
                from_url: from_url.to_owned(),
            },
        )?;
        if req.epoch != self.last_writer_epoch {
            self.storage.write_writer_epoch(req.epoch)?;
            self.last_writer_epoch = req.epoch;
        }
        Ok(())
    }

    async fn fetch_segment(&self, url: &str, expected_size: u64) -> Result<Vec<u8>> {
        let resp = self
            .fetcher
            .get(url)
            .send()
            .await
            .map_err(|err| Error::Io(format!("fetch {url}: {err}")))?;
        if !resp.status().is_success() {
            return Err(Error::Io(format!(
                "fetch {url}: server returned {}",
                resp.status()
            )));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|err| Error::Io(format!("fetch {url}: {err}")))?;
        if body.len() < 4 {
            return Err(Error::InvalidResponse(format!(
                "segment response from {url} is too short"
            )));
        }
        let layout = i32::from_be_bytes(body[0..4].try_into().expect("4-byte prefix"));
        if layout != LAYOUT_VERSION {
            return Err(Error::InvalidResponse(format!(
                "segment from {url} has layout version {layout}, expected {LAYOUT_VERSION}"
            )));
        }
        let payload = &body[4..];
        if (payload.len() as u64) < expected_size {
            return Err(Error::Io(format!(
                "recovered segment from {url} is {} bytes, expected {}",
                payload.len(),
                expected_size
            )));
        }
        if payload.len() as u64 > expected_size {
            warn!(
                url,
                got = payload.len(),
                expected = expected_size,
                "source segment longer than the accepted value, truncating"
            );
        }
        Ok(payload[..expected_size as usize].to_vec())
    }

    /// The local view of the segment starting at `start_tx_id`: the open
    /// segment if it matches, otherwise whatever is on disk.
    fn segment_info(&self, start_tx_id: u64) -> Result<Option<SegmentInfo>> {
        if let Some(seg) = &self.cur_segment {
            if seg.start_tx_id == start_tx_id {
                return Ok(Some(SegmentInfo::in_progress(
                    start_tx_id,
                    seg.next_tx_id - 1,
                    seg.bytes_written,
                )));
            }
        }
        if let Some((end, path)) = self.storage.find_finalized(start_tx_id)? {
            let size = std::fs::metadata(&path)?.len();
            return Ok(Some(SegmentInfo::finalized(start_tx_id, end, size)));
        }
        let path = self.storage.inprogress_path(start_tx_id);
        if path.is_file() {
            let scan = scan_file(&path, start_tx_id)?;
            let end = scan.last_tx_id.unwrap_or(start_tx_id - 1);
            return Ok(Some(SegmentInfo::in_progress(start_tx_id, end, scan.valid_bytes)));
        }
        Ok(None)
    }

    fn check_formatted(&self) -> Result<&NamespaceInfo> {
        self.ns_info
            .as_ref()
            .ok_or_else(|| Error::NotFormatted(self.jid.clone()))
    }

    fn check_namespace(&self, ns_info: Option<&NamespaceInfo>) -> Result<()> {
        let local = self.check_formatted()?;
        let ns_info = ns_info.ok_or_else(|| {
            Error::NamespaceMismatch("request carries no namespace info".to_owned())
        })?;
        if ns_info != local {
            return Err(Error::NamespaceMismatch(format!(
                "request namespace (nsid {}, cluster {:?}, block pool {:?}) does not match \
                 journal namespace (nsid {}, cluster {:?}, block pool {:?})",
                ns_info.namespace_id,
                ns_info.cluster_id,
                ns_info.block_pool_id,
                local.namespace_id,
                local.cluster_id,
                local.block_pool_id,
            )));
        }
        Ok(())
    }

    fn check_epoch(&self, epoch: u64) -> Result<()> {
        if epoch < self.last_promised_epoch {
            return Err(Error::EpochTooLow(format!(
                "epoch {} is less than the last promised epoch {}",
                epoch, self.last_promised_epoch
            )));
        }
        if epoch > self.last_promised_epoch {
            return Err(Error::EpochMismatch(format!(
                "epoch {} was never promised to this journal (last promised epoch {})",
                epoch, self.last_promised_epoch
            )));
        }
        Ok(())
    }

    fn check_write_request(&self, req: &RequestInfo) -> Result<()> {
        self.check_namespace(req.ns_info.as_ref())?;
        self.check_epoch(req.epoch)
    }

    fn check_paxos_request(&self, req: &RequestInfo) -> Result<()> {
        self.check_namespace(req.ns_info.as_ref())?;
        if self.last_promised_epoch == 0 {
            return Err(Error::EpochTooLow(format!(
                "bad epoch: no epoch has been promised to journal {}",
                self.jid
            )));
        }
        self.check_epoch(req.epoch)
    }
}

fn scan_file(path: &Path, first_tx_id: u64) -> Result<record::SegmentScan> {
    let bytes = std::fs::read(path)?;
    Ok(record::scan_segment(&bytes, first_tx_id))
}

fn truncate_file(path: &Path, len: u64) -> Result<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

fn write_temp(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}
