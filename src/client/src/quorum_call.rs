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
    collections::{BTreeMap, HashMap},
    future::Future,
    pin::Pin,
    time::Duration,
};

use futures::{stream::FuturesUnordered, StreamExt};
use qjournal_common::{Error, Result};
use tracing::warn;

use crate::deferred::Deferred;

/// Strict majority of `num_peers`.
pub fn majority(num_peers: usize) -> usize {
    num_peers / 2 + 1
}

type PeerFuture<T> = Pin<Box<dyn Future<Output = (String, Result<T>)> + Send>>;

/// A single-use fan-out join: complete as soon as a strict majority of the
/// peers succeeded, or fail as soon as a majority is impossible. Purely a
/// synchronization primitive; it never retries or re-orders.
pub struct QuorumCall<T> {
    total: usize,
    successes: HashMap<String, T>,
    exceptions: BTreeMap<String, Error>,
    pending: FuturesUnordered<PeerFuture<T>>,
}

impl<T: Send + 'static> QuorumCall<T> {
    pub fn create(calls: impl IntoIterator<Item = (String, Deferred<T>)>) -> Self {
        let pending: FuturesUnordered<PeerFuture<T>> = calls
            .into_iter()
            .map(|(name, deferred)| {
                Box::pin(async move { (name, deferred.await) }) as PeerFuture<T>
            })
            .collect();
        QuorumCall {
            total: pending.len(),
            successes: HashMap::new(),
            exceptions: BTreeMap::new(),
            pending,
        }
    }

    /// Wait until `quorum` peers have succeeded and return their results.
    /// Outstanding per-peer calls are dropped (a cancellation hint, not a
    /// guarantee the server won't still apply them).
    pub async fn await_quorum(mut self, quorum: usize, timeout: Duration) -> Result<HashMap<String, T>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.successes.len() >= quorum {
                return Ok(self.successes);
            }
            if self.exceptions.len() > self.total - quorum {
                return Err(Error::QuorumFailed(format!(
                    "got too many exceptions to achieve quorum size {}/{}: [{}]",
                    quorum,
                    self.total,
                    self.format_exceptions()
                )));
            }

            match tokio::time::timeout_at(deadline, self.pending.next()).await {
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "timed out waiting {:?} for a quorum of {}: {} successful, {} failed, {} pending",
                        timeout,
                        quorum,
                        self.successes.len(),
                        self.exceptions.len(),
                        self.total - self.successes.len() - self.exceptions.len(),
                    )));
                }
                Ok(Some((peer, Ok(value)))) => {
                    self.successes.insert(peer, value);
                }
                Ok(Some((peer, Err(err)))) => {
                    warn!(%peer, "quorum call failed on peer: {err}");
                    self.exceptions.insert(peer, err);
                }
                Ok(None) => {
                    // Every peer resolved yet neither branch above fired;
                    // only possible for an empty peer set.
                    return Err(Error::QuorumFailed(format!(
                        "no responses for quorum of {} out of {} peers",
                        quorum, self.total
                    )));
                }
            }
        }
    }

    fn format_exceptions(&self) -> String {
        self.exceptions
            .iter()
            .map(|(peer, err)| format!("{}: {}", peer, err))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::deferred;

    #[tokio::test]
    async fn completes_on_majority_with_one_pending() {
        let (tx0, d0) = deferred();
        let (tx1, d1) = deferred();
        let (_tx2, d2) = deferred::<u32>();

        tx0.send(Ok(10)).unwrap();
        tx1.send(Ok(11)).unwrap();

        let call = QuorumCall::create(vec![
            ("jn0".to_owned(), d0),
            ("jn1".to_owned(), d1),
            ("jn2".to_owned(), d2),
        ]);
        let results = call
            .await_quorum(majority(3), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results["jn0"], 10);
        // The third peer never responded and that is fine.
    }

    #[tokio::test]
    async fn fails_as_soon_as_majority_impossible() {
        let (tx0, d0) = deferred::<()>();
        let (tx1, d1) = deferred();
        let (_tx2, d2) = deferred();

        tx0.send(Err(Error::Io("disk failed on jn0".to_owned()))).unwrap();
        tx1.send(Err(Error::Io("disk failed on jn1".to_owned()))).unwrap();

        let call = QuorumCall::create(vec![
            ("jn0".to_owned(), d0),
            ("jn1".to_owned(), d1),
            ("jn2".to_owned(), d2),
        ]);
        let err = call
            .await_quorum(majority(3), Duration::from_secs(5))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("disk failed on jn0"), "{msg}");
        assert!(msg.contains("disk failed on jn1"), "{msg}");
        assert!(matches!(err, Error::QuorumFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_no_quorum_arrives() {
        let (_tx0, d0) = deferred::<()>();
        let (tx1, d1) = deferred();
        let (_tx2, d2) = deferred();
        tx1.send(Ok(())).unwrap();

        let call = QuorumCall::create(vec![
            ("jn0".to_owned(), d0),
            ("jn1".to_owned(), d1),
            ("jn2".to_owned(), d2),
        ]);
        let err = call
            .await_quorum(majority(3), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err}");
    }

    #[tokio::test]
    async fn cancelled_peers_count_as_failures() {
        let (tx0, d0) = deferred::<()>();
        let (tx1, d1) = deferred();
        let (tx2, d2) = deferred();
        tx0.send(Ok(())).unwrap();
        drop(tx1);
        drop(tx2);

        let call = QuorumCall::create(vec![
            ("jn0".to_owned(), d0),
            ("jn1".to_owned(), d1),
            ("jn2".to_owned(), d2),
        ]);
        let err = call
            .await_quorum(majority(3), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuorumFailed(_)), "{err}");
    }
}
