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

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex,
};

use qjournal_common::{layout, Error, Result};
use qjournal_proto::{
    journal_client::JournalClient, AcceptRecoveryRequest, FinalizeLogSegmentRequest,
    GetJournalStateRequest, GetJournalStateResponse, JournalRequest, NamespaceInfo,
    NewEpochRequest, NewEpochResponse, PrepareRecoveryRequest, PrepareRecoveryResponse,
    RequestInfo, SegmentInfo, StartLogSegmentRequest,
};
use tokio::sync::{mpsc, oneshot};
use tonic::transport::{Channel, Endpoint};
use tracing::warn;

use crate::{
    deferred::{deferred, Deferred},
    opt::QuorumOption,
};

/// One logical channel to one journal node. Mutating calls are applied in
/// submission order; each method hands back a deferred result.
pub trait AsyncLogger: Send + Sync {
    /// Peer identifier, used in quorum bookkeeping and error reports.
    fn name(&self) -> &str;

    /// Arm the channel with the writer's established epoch. Every mutating
    /// request issued afterwards is stamped with it.
    fn set_epoch(&self, epoch: u64);

    fn get_journal_state(&self) -> Deferred<GetJournalStateResponse>;
    fn new_epoch(&self, epoch: u64) -> Deferred<NewEpochResponse>;
    fn start_log_segment(&self, tx_id: u64) -> Deferred<()>;
    fn send_edits(&self, first_tx_id: u64, num_txns: u32, records: Vec<u8>) -> Deferred<()>;
    fn finalize_log_segment(&self, start_tx_id: u64, end_tx_id: u64) -> Deferred<()>;
    fn prepare_recovery(&self, segment_tx_id: u64) -> Deferred<PrepareRecoveryResponse>;
    fn accept_recovery(&self, state: SegmentInfo, from_url: String) -> Deferred<()>;

    /// URL from which this peer serves the given segment, once its HTTP
    /// port has been learned via `get_journal_state`.
    fn http_url(&self, state: &SegmentInfo) -> Option<String>;
}

enum Op {
    NewEpoch {
        epoch: u64,
        done: oneshot::Sender<Result<NewEpochResponse>>,
    },
    StartLogSegment {
        tx_id: u64,
        done: oneshot::Sender<Result<()>>,
    },
    SendEdits {
        first_tx_id: u64,
        num_txns: u32,
        records: Vec<u8>,
        done: oneshot::Sender<Result<()>>,
    },
    FinalizeLogSegment {
        start_tx_id: u64,
        end_tx_id: u64,
        done: oneshot::Sender<Result<()>>,
    },
    AcceptRecovery {
        state: SegmentInfo,
        from_url: String,
        done: oneshot::Sender<Result<()>>,
    },
}

impl Op {
    fn fail(self, err: Error) {
        match self {
            Op::NewEpoch { done, .. } => drop(done.send(Err(err))),
            Op::StartLogSegment { done, .. } => drop(done.send(Err(err))),
            Op::SendEdits { done, .. } => drop(done.send(Err(err))),
            Op::FinalizeLogSegment { done, .. } => drop(done.send(Err(err))),
            Op::AcceptRecovery { done, .. } => drop(done.send(Err(err))),
        }
    }
}

/// The tonic-backed [`AsyncLogger`]. Mutating calls flow through one
/// single-consumer queue so the peer observes them in FIFO order;
/// read-only calls run on their own spawned tasks and never block the
/// write queue.
pub struct IpcLoggerChannel {
    inner: Arc<ChannelInner>,
    tx: mpsc::UnboundedSender<Op>,
}

struct ChannelInner {
    target: String,
    jid: String,
    ns_info: NamespaceInfo,
    opt: Arc<QuorumOption>,
    epoch: AtomicU64,
    /// Highest promise this peer has ever reported. A value above our own
    /// epoch means another writer took over and this channel is fenced.
    observed_promise: AtomicU64,
    queued_edits_bytes: AtomicUsize,
    ipc_serial: AtomicU64,
    http_host: Mutex<Option<String>>,
}

impl IpcLoggerChannel {
    /// Must be called from within a tokio runtime; the per-peer queue
    /// consumer is spawned here.
    pub fn new(
        opt: Arc<QuorumOption>,
        jid: impl Into<String>,
        ns_info: NamespaceInfo,
        target: impl Into<String>,
    ) -> Self {
        let inner = Arc::new(ChannelInner {
            target: target.into(),
            jid: jid.into(),
            ns_info,
            opt,
            epoch: AtomicU64::new(0),
            observed_promise: AtomicU64::new(0),
            queued_edits_bytes: AtomicUsize::new(0),
            ipc_serial: AtomicU64::new(0),
            http_host: Mutex::new(None),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(inner.clone().run(rx));
        IpcLoggerChannel { inner, tx }
    }

    fn enqueue(&self, op: Op) {
        if let Err(mpsc::error::SendError(op)) = self.tx.send(op) {
            op.fail(Error::Cancelled);
        }
    }
}

impl AsyncLogger for IpcLoggerChannel {
    fn name(&self) -> &str {
        &self.inner.target
    }

    fn set_epoch(&self, epoch: u64) {
        self.inner.epoch.store(epoch, Ordering::Release);
    }

    fn get_journal_state(&self) -> Deferred<GetJournalStateResponse> {
        let (tx, d) = deferred();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _ = tx.send(inner.do_get_journal_state().await);
        });
        d
    }

    fn new_epoch(&self, epoch: u64) -> Deferred<NewEpochResponse> {
        let (tx, d) = deferred();
        self.enqueue(Op::NewEpoch { epoch, done: tx });
        d
    }

    fn start_log_segment(&self, tx_id: u64) -> Deferred<()> {
        let (tx, d) = deferred();
        self.enqueue(Op::StartLogSegment { tx_id, done: tx });
        d
    }

    fn send_edits(&self, first_tx_id: u64, num_txns: u32, records: Vec<u8>) -> Deferred<()> {
        let len = records.len();
        let queued = self.inner.queued_edits_bytes.load(Ordering::Acquire);
        if queued + len > self.inner.opt.max_queued_edits_bytes {
            return Deferred::completed(Err(Error::TooManyQueued(format!(
                "{} bytes already queued to {}, limit {}",
                queued, self.inner.target, self.inner.opt.max_queued_edits_bytes
            ))));
        }
        self.inner.queued_edits_bytes.fetch_add(len, Ordering::AcqRel);
        let (tx, d) = deferred();
        self.enqueue(Op::SendEdits {
            first_tx_id,
            num_txns,
            records,
            done: tx,
        });
        d
    }

    fn finalize_log_segment(&self, start_tx_id: u64, end_tx_id: u64) -> Deferred<()> {
        let (tx, d) = deferred();
        self.enqueue(Op::FinalizeLogSegment {
            start_tx_id,
            end_tx_id,
            done: tx,
        });
        d
    }

    fn prepare_recovery(&self, segment_tx_id: u64) -> Deferred<PrepareRecoveryResponse> {
        let (tx, d) = deferred();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _ = tx.send(inner.do_prepare_recovery(segment_tx_id).await);
        });
        d
    }

    fn accept_recovery(&self, state: SegmentInfo, from_url: String) -> Deferred<()> {
        let (tx, d) = deferred();
        self.enqueue(Op::AcceptRecovery {
            state,
            from_url,
            done: tx,
        });
        d
    }

    fn http_url(&self, state: &SegmentInfo) -> Option<String> {
        let host = self.inner.http_host.lock().unwrap().clone()?;
        let name = if state.is_in_progress {
            layout::inprogress_name(state.start_tx_id)
        } else {
            layout::finalized_name(state.start_tx_id, state.end_tx_id)
        };
        Some(format!(
            "http://{}/getimage?filename={}&jid={}",
            host, name, self.inner.jid
        ))
    }
}

impl ChannelInner {
    /// Consume the mutating-call queue. One op is in flight at a time, so
    /// the peer sees writes in exactly the submitted order.
    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Op>) {
        let mut client: Option<JournalClient<Channel>> = None;
        while let Some(op) = rx.recv().await {
            match op {
                Op::NewEpoch { epoch, done } => {
                    let _ = done.send(self.do_new_epoch(&mut client, epoch).await);
                }
                Op::StartLogSegment { tx_id, done } => {
                    let _ = done.send(self.do_start_log_segment(&mut client, tx_id).await);
                }
                Op::SendEdits {
                    first_tx_id,
                    num_txns,
                    records,
                    done,
                } => {
                    let len = records.len();
                    let result = self
                        .do_send_edits(&mut client, first_tx_id, num_txns, records)
                        .await;
                    self.queued_edits_bytes.fetch_sub(len, Ordering::AcqRel);
                    let _ = done.send(result);
                }
                Op::FinalizeLogSegment {
                    start_tx_id,
                    end_tx_id,
                    done,
                } => {
                    let _ = done.send(
                        self.do_finalize_log_segment(&mut client, start_tx_id, end_tx_id)
                            .await,
                    );
                }
                Op::AcceptRecovery {
                    state,
                    from_url,
                    done,
                } => {
                    let _ = done.send(self.do_accept_recovery(&mut client, state, from_url).await);
                }
            }
        }
    }

    async fn get_client(
        &self,
        cache: &mut Option<JournalClient<Channel>>,
    ) -> Result<JournalClient<Channel>> {
        if let Some(client) = cache {
            return Ok(client.clone());
        }
        let channel = Endpoint::new(self.target.clone())?.connect().await?;
        let client = JournalClient::new(channel);
        *cache = Some(client.clone());
        Ok(client)
    }

    fn request_info(&self) -> RequestInfo {
        RequestInfo::new(
            self.jid.clone(),
            self.ns_info.clone(),
            self.epoch.load(Ordering::Acquire),
            self.ipc_serial.fetch_add(1, Ordering::AcqRel),
        )
    }

    fn fence_error(&self, promised: u64, epoch: u64) -> Error {
        Error::EpochTooLow(format!(
            "journal node {} has promised epoch {}, ours is {}",
            self.target, promised, epoch
        ))
    }

    /// A channel whose peer has promised a later epoch fails fast; the
    /// writer must abort rather than keep retrying into a fence.
    fn check_fence(&self) -> Result<()> {
        let promised = self.observed_promise.load(Ordering::Acquire);
        let epoch = self.epoch.load(Ordering::Acquire);
        if epoch > 0 && promised > epoch {
            return Err(self.fence_error(promised, epoch));
        }
        Ok(())
    }

    /// Every response reports the peer's current promise; seeing one above
    /// our own epoch means this writer has been superseded.
    fn observe_promise(&self, promised: u64) -> Result<()> {
        self.observed_promise.fetch_max(promised, Ordering::AcqRel);
        let epoch = self.epoch.load(Ordering::Acquire);
        if epoch > 0 && promised > epoch {
            warn!(
                peer = %self.target,
                promised,
                epoch,
                "peer has promised a later epoch, fencing this channel"
            );
            return Err(self.fence_error(promised, epoch));
        }
        Ok(())
    }

    async fn with_timeout<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
    {
        match tokio::time::timeout(self.opt.rpc_timeout, fut).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(status)) => Err(status.into()),
            Err(_) => Err(Error::Timeout(format!(
                "{} to {} timed out after {:?}",
                what, self.target, self.opt.rpc_timeout
            ))),
        }
    }

    async fn do_get_journal_state(&self) -> Result<GetJournalStateResponse> {
        // Read-only calls use their own connection so a stalled write
        // queue cannot delay them.
        let channel = Endpoint::new(self.target.clone())?.connect().await?;
        let mut client = JournalClient::new(channel);
        let req = GetJournalStateRequest {
            journal_id: self.jid.clone(),
        };
        let resp = self
            .with_timeout("getJournalState", client.get_journal_state(req))
            .await?;
        self.observed_promise
            .fetch_max(resp.last_promised_epoch, Ordering::AcqRel);
        if resp.http_port != 0 {
            if let Some(host) = host_of(&self.target) {
                *self.http_host.lock().unwrap() = Some(format!("{}:{}", host, resp.http_port));
            }
        }
        Ok(resp)
    }

    async fn do_prepare_recovery(&self, segment_tx_id: u64) -> Result<PrepareRecoveryResponse> {
        self.check_fence()?;
        let channel = Endpoint::new(self.target.clone())?.connect().await?;
        let mut client = JournalClient::new(channel);
        let req = PrepareRecoveryRequest {
            req_info: Some(self.request_info()),
            segment_tx_id,
        };
        let resp = self
            .with_timeout("prepareRecovery", client.prepare_recovery(req))
            .await?;
        self.observe_promise(resp.last_promised_epoch)?;
        Ok(resp)
    }

    async fn do_new_epoch(
        &self,
        cache: &mut Option<JournalClient<Channel>>,
        epoch: u64,
    ) -> Result<NewEpochResponse> {
        let mut client = self.get_client(cache).await?;
        let req = NewEpochRequest {
            journal_id: self.jid.clone(),
            ns_info: Some(self.ns_info.clone()),
            epoch,
        };
        let resp = self.with_timeout("newEpoch", client.new_epoch(req)).await?;
        self.observed_promise
            .fetch_max(resp.last_promised_epoch, Ordering::AcqRel);
        Ok(resp)
    }

    async fn do_start_log_segment(
        &self,
        cache: &mut Option<JournalClient<Channel>>,
        tx_id: u64,
    ) -> Result<()> {
        self.check_fence()?;
        let mut client = self.get_client(cache).await?;
        let req = StartLogSegmentRequest {
            req_info: Some(self.request_info()),
            tx_id,
        };
        let resp = self
            .with_timeout("startLogSegment", client.start_log_segment(req))
            .await?;
        self.observe_promise(resp.last_promised_epoch)
    }

    async fn do_send_edits(
        &self,
        cache: &mut Option<JournalClient<Channel>>,
        first_tx_id: u64,
        num_txns: u32,
        records: Vec<u8>,
    ) -> Result<()> {
        self.check_fence()?;
        let mut client = self.get_client(cache).await?;
        let req = JournalRequest {
            req_info: Some(self.request_info()),
            first_tx_id,
            num_txns,
            records,
        };
        let resp = self.with_timeout("journal", client.journal(req)).await?;
        self.observe_promise(resp.last_promised_epoch)
    }

    async fn do_finalize_log_segment(
        &self,
        cache: &mut Option<JournalClient<Channel>>,
        start_tx_id: u64,
        end_tx_id: u64,
    ) -> Result<()> {
        self.check_fence()?;
        let mut client = self.get_client(cache).await?;
        let req = FinalizeLogSegmentRequest {
            req_info: Some(self.request_info()),
            start_tx_id,
            end_tx_id,
        };
        let resp = self
            .with_timeout("finalizeLogSegment", client.finalize_log_segment(req))
            .await?;
        self.observe_promise(resp.last_promised_epoch)
    }

    async fn do_accept_recovery(
        &self,
        cache: &mut Option<JournalClient<Channel>>,
        state: SegmentInfo,
        from_url: String,
    ) -> Result<()> {
        self.check_fence()?;
        let mut client = self.get_client(cache).await?;
        let req = AcceptRecoveryRequest {
            req_info: Some(self.request_info()),
            state_to_accept: Some(state),
            from_url,
        };
        let resp = self
            .with_timeout("acceptRecovery", client.accept_recovery(req))
            .await?;
        self.observe_promise(resp.last_promised_epoch)
    }
}

fn host_of(target: &str) -> Option<&str> {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
        .unwrap_or(target);
    let rest = rest.split('/').next()?;
    Some(rest.rsplit_once(':').map(|(host, _)| host).unwrap_or(rest))
}
