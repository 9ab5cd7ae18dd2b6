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

use std::{collections::HashMap, sync::Arc};

use qjournal_common::{Error, Result};
use qjournal_proto::{NamespaceInfo, PrepareRecoveryResponse, SegmentInfo};
use tracing::{info, warn};

use crate::{
    logger::{AsyncLogger, IpcLoggerChannel},
    opt::QuorumOption,
    quorum_call::{majority, QuorumCall},
    segment_writer::QuorumOutputStream,
};

/// The writer-side manager of one replicated journal: establishes the
/// writer epoch over a quorum, runs tail recovery on takeover, and opens
/// output streams for new segments.
pub struct QuorumJournalManager {
    jid: String,
    ns_info: NamespaceInfo,
    opt: Arc<QuorumOption>,
    loggers: Arc<Vec<Arc<dyn AsyncLogger>>>,
    epoch: u64,
    /// `lastSegmentTxId` as reported by each peer's `newEpoch` response.
    last_segment_tx_ids: HashMap<String, Option<u64>>,
}

impl QuorumJournalManager {
    /// Build a manager speaking to `targets`. Must run inside a tokio
    /// runtime; each peer gets its own serialized channel.
    pub fn connect(
        opt: QuorumOption,
        jid: impl Into<String>,
        ns_info: NamespaceInfo,
        targets: Vec<String>,
    ) -> Self {
        let opt = Arc::new(opt);
        let jid = jid.into();
        let loggers = targets
            .into_iter()
            .map(|target| {
                Arc::new(IpcLoggerChannel::new(
                    opt.clone(),
                    jid.clone(),
                    ns_info.clone(),
                    target,
                )) as Arc<dyn AsyncLogger>
            })
            .collect::<Vec<_>>();
        Self::with_loggers(opt, jid, ns_info, loggers)
    }

    /// Build a manager over pre-built loggers (tests use this with mocks).
    pub fn with_loggers(
        opt: Arc<QuorumOption>,
        jid: impl Into<String>,
        ns_info: NamespaceInfo,
        loggers: Vec<Arc<dyn AsyncLogger>>,
    ) -> Self {
        assert!(!loggers.is_empty(), "quorum needs at least one peer");
        QuorumJournalManager {
            jid: jid.into(),
            ns_info,
            opt,
            loggers: Arc::new(loggers),
            epoch: 0,
            last_segment_tx_ids: HashMap::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn quorum(&self) -> usize {
        majority(self.loggers.len())
    }

    /// Learn the highest promise over a quorum, propose one above it, and
    /// arm every channel with the new epoch. The external election
    /// authority decides *who* runs this; the number comes from the quorum
    /// itself.
    pub async fn establish_new_epoch(&mut self) -> Result<u64> {
        let calls = self
            .loggers
            .iter()
            .map(|l| (l.name().to_owned(), l.get_journal_state()))
            .collect::<Vec<_>>();
        let states = QuorumCall::create(calls)
            .await_quorum(self.quorum(), self.opt.quorum_timeout)
            .await?;
        let max_promised = states
            .values()
            .map(|s| s.last_promised_epoch)
            .max()
            .unwrap_or(0);
        let epoch = max_promised + 1;

        let calls = self
            .loggers
            .iter()
            .map(|l| (l.name().to_owned(), l.new_epoch(epoch)))
            .collect::<Vec<_>>();
        let responses = QuorumCall::create(calls)
            .await_quorum(self.quorum(), self.opt.quorum_timeout)
            .await?;

        for logger in self.loggers.iter() {
            logger.set_epoch(epoch);
        }
        self.epoch = epoch;
        self.last_segment_tx_ids = responses
            .into_iter()
            .map(|(peer, resp)| (peer, resp.last_segment_tx_id))
            .collect();
        info!(jid = %self.jid, epoch, "established new epoch over a quorum");
        Ok(epoch)
    }

    /// Bring the unfinalized tail segment (if any) to one definitive value
    /// on a quorum and finalize it. Returns the finalized range, or `None`
    /// when there was nothing to recover. Call once, right after
    /// `establish_new_epoch`.
    pub async fn recover_unfinalized_segments(&mut self) -> Result<Option<(u64, u64)>> {
        if self.epoch == 0 {
            return Err(Error::SegmentState(
                "no epoch has been established yet".to_owned(),
            ));
        }
        let Some(segment_tx_id) = self.last_segment_tx_ids.values().filter_map(|v| *v).max()
        else {
            info!(jid = %self.jid, "no segments reported, nothing to recover");
            return Ok(None);
        };

        let calls = self
            .loggers
            .iter()
            .map(|l| (l.name().to_owned(), l.prepare_recovery(segment_tx_id)))
            .collect::<Vec<_>>();
        let prepares = QuorumCall::create(calls)
            .await_quorum(self.quorum(), self.opt.quorum_timeout)
            .await?;

        let Some((winner, value)) = choose_recovery_value(&prepares) else {
            warn!(
                jid = %self.jid,
                segment_tx_id,
                "no peer in the quorum holds the reported segment, nothing to recover"
            );
            return Ok(None);
        };
        if value.num_txns() == 0 {
            info!(jid = %self.jid, segment_tx_id, "tail segment is empty, nothing to recover");
            return Ok(None);
        }

        let from_url = self
            .logger_by_name(&winner)
            .and_then(|l| l.http_url(&value))
            .ok_or_else(|| {
                Error::InvalidResponse(format!("no http address known for peer {winner}"))
            })?;
        info!(
            jid = %self.jid,
            epoch = self.epoch,
            winner = %winner,
            %value,
            "recovering tail segment"
        );

        // Accept goes to every peer, not only the prepare quorum.
        let calls = self
            .loggers
            .iter()
            .map(|l| {
                (
                    l.name().to_owned(),
                    l.accept_recovery(value.clone(), from_url.clone()),
                )
            })
            .collect::<Vec<_>>();
        QuorumCall::create(calls)
            .await_quorum(self.quorum(), self.opt.quorum_timeout)
            .await?;

        let calls = self
            .loggers
            .iter()
            .map(|l| {
                (
                    l.name().to_owned(),
                    l.finalize_log_segment(value.start_tx_id, value.end_tx_id),
                )
            })
            .collect::<Vec<_>>();
        QuorumCall::create(calls)
            .await_quorum(self.quorum(), self.opt.quorum_timeout)
            .await?;

        info!(
            jid = %self.jid,
            start = value.start_tx_id,
            end = value.end_tx_id,
            "tail segment recovered and finalized"
        );
        Ok(Some((value.start_tx_id, value.end_tx_id)))
    }

    /// Open a new segment at `tx_id` on a quorum and return its stream.
    pub async fn start_log_segment(&self, tx_id: u64) -> Result<QuorumOutputStream> {
        let calls = self
            .loggers
            .iter()
            .map(|l| (l.name().to_owned(), l.start_log_segment(tx_id)))
            .collect::<Vec<_>>();
        QuorumCall::create(calls)
            .await_quorum(self.quorum(), self.opt.quorum_timeout)
            .await?;
        Ok(QuorumOutputStream::new(
            self.loggers.clone(),
            self.opt.quorum_timeout,
            tx_id,
        ))
    }

    pub async fn finalize_log_segment(&self, start_tx_id: u64, end_tx_id: u64) -> Result<()> {
        let calls = self
            .loggers
            .iter()
            .map(|l| {
                (
                    l.name().to_owned(),
                    l.finalize_log_segment(start_tx_id, end_tx_id),
                )
            })
            .collect::<Vec<_>>();
        QuorumCall::create(calls)
            .await_quorum(self.quorum(), self.opt.quorum_timeout)
            .await?;
        Ok(())
    }

    fn logger_by_name(&self, name: &str) -> Option<&Arc<dyn AsyncLogger>> {
        self.loggers.iter().find(|l| l.name() == name)
    }
}

/// Pick the definitive value for the tail segment out of a quorum of
/// prepare responses. Total order, highest wins:
///
/// 1. any previously accepted value beats any mere on-disk segment, and
///    among accepted values the highest acceptance epoch wins (Paxos
///    safety: an accepted value must never be displaced);
/// 2. otherwise, among on-disk segments, the highest writer epoch wins,
///    and among those the longest;
/// 3. remaining ties break toward the lexically smallest peer, stably.
fn choose_recovery_value(
    prepares: &HashMap<String, PrepareRecoveryResponse>,
) -> Option<(String, SegmentInfo)> {
    let mut peers: Vec<_> = prepares.iter().collect();
    peers.sort_by(|a, b| a.0.cmp(b.0));

    let mut best: Option<(&String, (u8, u64, u64), SegmentInfo)> = None;
    for (peer, resp) in peers {
        let (rank, value) = if let Some(accepted) = &resp.accepted_recovery {
            let Some(state) = accepted.segment_state.clone() else {
                warn!(%peer, "accepted recovery record without segment state, skipping");
                continue;
            };
            ((2, accepted.accepted_in_epoch, 0), state)
        } else if let Some(state) = &resp.segment_state {
            (
                (1, resp.last_writer_epoch.unwrap_or(0), state.end_tx_id),
                state.clone(),
            )
        } else {
            continue;
        };
        match &best {
            Some((_, best_rank, _)) if *best_rank >= rank => {}
            _ => best = Some((peer, rank, value)),
        }
    }
    best.map(|(peer, _, value)| (peer.clone(), value))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use qjournal_proto::{
        GetJournalStateResponse, NewEpochResponse, PersistedRecoveryData, PrepareRecoveryResponse,
    };
    use tokio::sync::oneshot;

    use super::*;
    use crate::deferred::{deferred, Deferred};

    #[derive(Clone)]
    enum Behavior {
        Ok,
        Fail(String),
        Never,
    }

    struct MockLogger {
        name: String,
        start_behaviors: Mutex<VecDeque<Behavior>>,
        send_behaviors: Mutex<VecDeque<Behavior>>,
        sent_edits: Mutex<Vec<(u64, u32)>>,
        held: Mutex<Vec<oneshot::Sender<qjournal_common::Result<()>>>>,
    }

    impl MockLogger {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(MockLogger {
                name: name.to_owned(),
                start_behaviors: Mutex::new(VecDeque::new()),
                send_behaviors: Mutex::new(VecDeque::new()),
                sent_edits: Mutex::new(Vec::new()),
                held: Mutex::new(Vec::new()),
            })
        }

        fn push_start(&self, behavior: Behavior) {
            self.start_behaviors.lock().unwrap().push_back(behavior);
        }

        fn push_send(&self, behavior: Behavior) {
            self.send_behaviors.lock().unwrap().push_back(behavior);
        }

        fn complete(&self, queue: &Mutex<VecDeque<Behavior>>) -> Deferred<()> {
            match queue.lock().unwrap().pop_front().unwrap_or(Behavior::Ok) {
                Behavior::Ok => Deferred::completed(Ok(())),
                Behavior::Fail(msg) => Deferred::completed(Err(Error::Io(msg))),
                Behavior::Never => {
                    let (tx, d) = deferred();
                    self.held.lock().unwrap().push(tx);
                    d
                }
            }
        }
    }

    impl AsyncLogger for MockLogger {
        fn name(&self) -> &str {
            &self.name
        }

        fn set_epoch(&self, _epoch: u64) {}

        fn get_journal_state(&self) -> Deferred<GetJournalStateResponse> {
            Deferred::completed(Ok(GetJournalStateResponse {
                last_promised_epoch: 0,
                http_port: 8480,
            }))
        }

        fn new_epoch(&self, epoch: u64) -> Deferred<NewEpochResponse> {
            Deferred::completed(Ok(NewEpochResponse {
                last_segment_tx_id: None,
                last_promised_epoch: epoch,
            }))
        }

        fn start_log_segment(&self, _tx_id: u64) -> Deferred<()> {
            self.complete(&self.start_behaviors)
        }

        fn send_edits(&self, first_tx_id: u64, num_txns: u32, _records: Vec<u8>) -> Deferred<()> {
            self.sent_edits.lock().unwrap().push((first_tx_id, num_txns));
            self.complete(&self.send_behaviors)
        }

        fn finalize_log_segment(&self, _start_tx_id: u64, _end_tx_id: u64) -> Deferred<()> {
            Deferred::completed(Ok(()))
        }

        fn prepare_recovery(&self, _segment_tx_id: u64) -> Deferred<PrepareRecoveryResponse> {
            Deferred::completed(Ok(PrepareRecoveryResponse::default()))
        }

        fn accept_recovery(&self, _state: SegmentInfo, _from_url: String) -> Deferred<()> {
            Deferred::completed(Ok(()))
        }

        fn http_url(&self, _state: &SegmentInfo) -> Option<String> {
            Some(format!("http://{}:8480/getimage", self.name))
        }
    }

    fn fake_ns() -> NamespaceInfo {
        NamespaceInfo {
            namespace_id: 12345,
            cluster_id: "mycluster".to_owned(),
            block_pool_id: "my-bp".to_owned(),
            creation_time: 0,
            layout_version: qjournal_common::LAYOUT_VERSION,
        }
    }

    fn build_manager(mocks: &[Arc<MockLogger>]) -> QuorumJournalManager {
        let loggers = mocks
            .iter()
            .map(|m| m.clone() as Arc<dyn AsyncLogger>)
            .collect();
        QuorumJournalManager::with_loggers(
            Arc::new(QuorumOption::default()),
            "test-journalid",
            fake_ns(),
            loggers,
        )
    }

    #[tokio::test]
    async fn all_loggers_start_ok() {
        let mocks = [MockLogger::new("jn0"), MockLogger::new("jn1"), MockLogger::new("jn2")];
        let manager = build_manager(&mocks);
        manager.start_log_segment(1).await.unwrap();
    }

    #[tokio::test]
    async fn quorum_of_loggers_start_ok() {
        let mocks = [MockLogger::new("jn0"), MockLogger::new("jn1"), MockLogger::new("jn2")];
        mocks[2].push_start(Behavior::Fail("logger failed".to_owned()));
        let manager = build_manager(&mocks);
        manager.start_log_segment(1).await.unwrap();
    }

    #[tokio::test]
    async fn quorum_of_loggers_fail() {
        let mocks = [MockLogger::new("jn0"), MockLogger::new("jn1"), MockLogger::new("jn2")];
        mocks[1].push_start(Behavior::Fail("logger failed".to_owned()));
        mocks[2].push_start(Behavior::Fail("logger failed".to_owned()));
        let manager = build_manager(&mocks);
        let err = manager.start_log_segment(1).await.unwrap_err();
        assert!(matches!(err, Error::QuorumFailed(_)), "{err}");
        assert!(err.to_string().contains("logger failed"), "{err}");
    }

    #[tokio::test]
    async fn write_edits_batches_by_flush() {
        let mocks = [MockLogger::new("jn0"), MockLogger::new("jn1"), MockLogger::new("jn2")];
        let manager = build_manager(&mocks);
        let mut stream = manager.start_log_segment(1).await.unwrap();

        stream.write(1, b"tx 1").unwrap();
        stream.write(2, b"tx 2").unwrap();
        stream.set_ready_to_flush().unwrap();
        // New writes land in the other buffer while the flush is pending.
        stream.write(3, b"tx 3").unwrap();

        stream.flush().await.unwrap();
        for mock in &mocks {
            assert_eq!(*mock.sent_edits.lock().unwrap(), vec![(1, 2)]);
        }

        stream.set_ready_to_flush().unwrap();
        stream.flush().await.unwrap();
        for mock in &mocks {
            assert_eq!(*mock.sent_edits.lock().unwrap(), vec![(1, 2), (3, 1)]);
        }
    }

    #[tokio::test]
    async fn write_edits_completes_with_one_slow_peer() {
        let mocks = [MockLogger::new("jn0"), MockLogger::new("jn1"), MockLogger::new("jn2")];
        mocks[2].push_send(Behavior::Never);
        let manager = build_manager(&mocks);
        let mut stream = manager.start_log_segment(1).await.unwrap();

        stream.write(1, b"tx 1").unwrap();
        stream.set_ready_to_flush().unwrap();
        stream.flush().await.unwrap();
    }

    #[tokio::test]
    async fn ready_buffer_cannot_be_overwritten() {
        let mocks = [MockLogger::new("jn0"), MockLogger::new("jn1"), MockLogger::new("jn2")];
        let manager = build_manager(&mocks);
        let mut stream = manager.start_log_segment(1).await.unwrap();

        stream.write(1, b"tx 1").unwrap();
        stream.set_ready_to_flush().unwrap();
        stream.write(2, b"tx 2").unwrap();
        let err = stream.set_ready_to_flush().unwrap_err();
        assert!(matches!(err, Error::SegmentState(_)), "{err}");
    }

    #[tokio::test]
    async fn failed_flush_breaks_the_stream() {
        let mocks = [MockLogger::new("jn0"), MockLogger::new("jn1"), MockLogger::new("jn2")];
        mocks[0].push_send(Behavior::Fail("disk full".to_owned()));
        mocks[1].push_send(Behavior::Fail("disk full".to_owned()));
        let manager = build_manager(&mocks);
        let mut stream = manager.start_log_segment(1).await.unwrap();

        stream.write(1, b"tx 1").unwrap();
        stream.set_ready_to_flush().unwrap();
        let err = stream.flush().await.unwrap_err();
        assert!(matches!(err, Error::QuorumFailed(_)), "{err}");
        let err = stream.write(2, b"tx 2").unwrap_err();
        assert!(matches!(err, Error::SegmentState(_)), "{err}");
    }

    fn prepare_with_segment(writer_epoch: u64, end_tx_id: u64) -> PrepareRecoveryResponse {
        PrepareRecoveryResponse {
            segment_state: Some(SegmentInfo::in_progress(1, end_tx_id, end_tx_id * 16)),
            accepted_recovery: None,
            last_writer_epoch: Some(writer_epoch),
            last_promised_epoch: 0,
        }
    }

    fn prepare_with_accepted(accepted_in_epoch: u64, end_tx_id: u64) -> PrepareRecoveryResponse {
        PrepareRecoveryResponse {
            segment_state: Some(SegmentInfo::in_progress(1, end_tx_id, end_tx_id * 16)),
            accepted_recovery: Some(PersistedRecoveryData {
                segment_state: Some(SegmentInfo::in_progress(1, end_tx_id, end_tx_id * 16)),
                accepted_in_epoch,
                from_url: "http://jn:8480/getimage".to_owned(),
            }),
            last_writer_epoch: Some(accepted_in_epoch),
            last_promised_epoch: 0,
        }
    }

    #[test]
    fn recovery_value_prefers_accepted_over_longer_segment() {
        let prepares = HashMap::from([
            ("jn0".to_owned(), prepare_with_segment(1, 5)),
            ("jn1".to_owned(), prepare_with_accepted(2, 2)),
            ("jn2".to_owned(), prepare_with_segment(1, 3)),
        ]);
        let (winner, value) = choose_recovery_value(&prepares).unwrap();
        assert_eq!(winner, "jn1");
        assert_eq!(value.end_tx_id, 2);
    }

    #[test]
    fn recovery_value_prefers_highest_acceptance_epoch() {
        let prepares = HashMap::from([
            ("jn0".to_owned(), prepare_with_accepted(1, 4)),
            ("jn1".to_owned(), prepare_with_accepted(3, 2)),
        ]);
        let (winner, value) = choose_recovery_value(&prepares).unwrap();
        assert_eq!(winner, "jn1");
        assert_eq!(value.end_tx_id, 2);
    }

    #[test]
    fn recovery_value_prefers_highest_writer_epoch_then_length() {
        let prepares = HashMap::from([
            ("jn0".to_owned(), prepare_with_segment(1, 9)),
            ("jn1".to_owned(), prepare_with_segment(2, 3)),
            ("jn2".to_owned(), prepare_with_segment(2, 4)),
        ]);
        let (winner, value) = choose_recovery_value(&prepares).unwrap();
        assert_eq!(winner, "jn2");
        assert_eq!(value.end_tx_id, 4);
    }

    #[test]
    fn recovery_value_tie_breaks_by_peer_name() {
        let prepares = HashMap::from([
            ("jn2".to_owned(), prepare_with_segment(1, 3)),
            ("jn0".to_owned(), prepare_with_segment(1, 3)),
            ("jn1".to_owned(), prepare_with_segment(1, 3)),
        ]);
        let (winner, _) = choose_recovery_value(&prepares).unwrap();
        assert_eq!(winner, "jn0");
    }

    #[test]
    fn recovery_value_absent_when_no_peer_has_the_segment() {
        let prepares = HashMap::from([
            ("jn0".to_owned(), PrepareRecoveryResponse::default()),
            ("jn1".to_owned(), PrepareRecoveryResponse::default()),
        ]);
        assert!(choose_recovery_value(&prepares).is_none());
    }
}
