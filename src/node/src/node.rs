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
use tokio::sync::Mutex;

use crate::{journal::Journal, opt::NodeOption};

pub type JournalHandle = Arc<Mutex<Journal>>;

/// One process hosting any number of journals, each in its own directory
/// under `base_dir` and each serialized behind its own mutex.
#[derive(Clone)]
pub struct JournalNode {
    opt: Arc<NodeOption>,
    inner: Arc<Mutex<NodeInner>>,
}

struct NodeInner {
    journals: HashMap<String, JournalHandle>,
    http_port: u16,
}

impl JournalNode {
    pub fn new(opt: NodeOption) -> Self {
        JournalNode {
            opt: Arc::new(opt),
            inner: Arc::new(Mutex::new(NodeInner {
                journals: HashMap::new(),
                http_port: 0,
            })),
        }
    }

    pub fn option(&self) -> &NodeOption {
        &self.opt
    }

    /// Look a journal up by id, opening its directory on first use. The
    /// journal still rejects everything until it is formatted.
    pub async fn get_or_create_journal(&self, jid: &str) -> Result<JournalHandle> {
        validate_jid(jid)?;
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.journals.get(jid) {
            return Ok(handle.clone());
        }
        let journal = Journal::open(jid, self.opt.base_dir.join(jid), &self.opt)?;
        let handle = Arc::new(Mutex::new(journal));
        inner.journals.insert(jid.to_owned(), handle.clone());
        Ok(handle)
    }

    /// Port of the HTTP segment server, reported via `getJournalState` so
    /// writers can build fetch URLs. Recorded once the listener is bound.
    pub async fn http_port(&self) -> u16 {
        self.inner.lock().await.http_port
    }

    pub async fn set_http_port(&self, port: u16) {
        self.inner.lock().await.http_port = port;
    }
}

/// A journal id doubles as a directory name, so restrict it to a safe
/// character set.
fn validate_jid(jid: &str) -> Result<()> {
    let ok = !jid.is_empty()
        && jid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !jid.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(Error::Unknown(format!("invalid journal id {jid:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jid_validation() {
        assert!(validate_jid("test-journalid").is_ok());
        assert!(validate_jid("ns_1.edits").is_ok());
        assert!(validate_jid("").is_err());
        assert!(validate_jid("../escape").is_err());
        assert!(validate_jid("a/b").is_err());
    }
}
