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

use std::{sync::Arc, time::Duration};

use qjournal_common::{record, Error, Result};

use crate::{
    logger::AsyncLogger,
    quorum_call::{majority, QuorumCall},
};

/// The writer-side face of one open segment. Two buffers: `current`
/// accepts new transactions while `ready` (if any) is in flight to the
/// quorum, so writes never wait on the network and the stream never
/// reorders or gaps.
pub struct QuorumOutputStream {
    loggers: Arc<Vec<Arc<dyn AsyncLogger>>>,
    quorum_timeout: Duration,
    next_tx_id: u64,
    current: EditsBuffer,
    ready: Option<EditsBuffer>,
    aborted: bool,
}

impl std::fmt::Debug for QuorumOutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuorumOutputStream")
            .field("quorum_timeout", &self.quorum_timeout)
            .field("next_tx_id", &self.next_tx_id)
            .field("aborted", &self.aborted)
            .finish()
    }
}

#[derive(Default)]
struct EditsBuffer {
    first_tx_id: u64,
    num_txns: u32,
    data: Vec<u8>,
}

impl QuorumOutputStream {
    pub(crate) fn new(
        loggers: Arc<Vec<Arc<dyn AsyncLogger>>>,
        quorum_timeout: Duration,
        start_tx_id: u64,
    ) -> Self {
        QuorumOutputStream {
            loggers,
            quorum_timeout,
            next_tx_id: start_tx_id,
            current: EditsBuffer::default(),
            ready: None,
            aborted: false,
        }
    }

    /// The txid the next write must carry.
    pub fn next_tx_id(&self) -> u64 {
        self.next_tx_id
    }

    /// Buffer one transaction locally. Never touches the network.
    pub fn write(&mut self, tx_id: u64, op: &[u8]) -> Result<()> {
        self.check_not_aborted()?;
        if tx_id != self.next_tx_id {
            return Err(Error::OutOfSync(format!(
                "can't buffer txid {} expecting next txid {}",
                tx_id, self.next_tx_id
            )));
        }
        if self.current.num_txns == 0 {
            self.current.first_tx_id = tx_id;
        }
        record::encode_record(&mut self.current.data, tx_id, op);
        self.current.num_txns += 1;
        self.next_tx_id += 1;
        Ok(())
    }

    /// Freeze the buffered transactions for the next `flush`. The previous
    /// frozen batch must have been flushed already.
    pub fn set_ready_to_flush(&mut self) -> Result<()> {
        self.check_not_aborted()?;
        if let Some(ready) = &self.ready {
            if ready.num_txns > 0 {
                return Err(Error::SegmentState(
                    "previous flush buffer has not been sent yet".to_owned(),
                ));
            }
        }
        self.ready = Some(std::mem::take(&mut self.current));
        Ok(())
    }

    /// Send the frozen batch to every peer as one `sendEdits` and wait for
    /// a strict majority. On quorum failure the stream is broken for good:
    /// the writer must give up its epoch and let the next leader recover.
    pub async fn flush(&mut self) -> Result<()> {
        self.check_not_aborted()?;
        let Some(buf) = self.ready.take() else {
            return Ok(());
        };
        if buf.num_txns == 0 {
            return Ok(());
        }

        let calls = self
            .loggers
            .iter()
            .map(|logger| {
                (
                    logger.name().to_owned(),
                    logger.send_edits(buf.first_tx_id, buf.num_txns, buf.data.clone()),
                )
            })
            .collect::<Vec<_>>();
        let result = QuorumCall::create(calls)
            .await_quorum(majority(self.loggers.len()), self.quorum_timeout)
            .await;
        if let Err(err) = result {
            self.aborted = true;
            return Err(err);
        }
        Ok(())
    }

    fn check_not_aborted(&self) -> Result<()> {
        if self.aborted {
            return Err(Error::SegmentState(
                "output stream is aborted after a failed flush".to_owned(),
            ));
        }
        Ok(())
    }
}
