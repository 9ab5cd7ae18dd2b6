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
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use qjournal_common::{Error, Result};
use tokio::sync::oneshot;

/// A single-assignment result handle. Dropping the completer side resolves
/// the deferred as cancelled.
pub struct Deferred<T> {
    rx: oneshot::Receiver<Result<T>>,
}

pub(crate) fn deferred<T>() -> (oneshot::Sender<Result<T>>, Deferred<T>) {
    let (tx, rx) = oneshot::channel();
    (tx, Deferred { rx })
}

impl<T> Deferred<T> {
    /// A deferred that is already resolved.
    pub fn completed(result: Result<T>) -> Self {
        let (tx, deferred) = deferred();
        let _ = tx.send(result);
        deferred
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completed_resolves_immediately() {
        let d = Deferred::completed(Ok(7u64));
        assert_eq!(d.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn dropped_completer_is_cancellation() {
        let (tx, d) = deferred::<u64>();
        drop(tx);
        assert!(matches!(d.await, Err(Error::Cancelled)));
    }
}
