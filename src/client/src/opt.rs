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

use std::time::Duration;

/// The option structure of the quorum writer.
#[derive(Debug, Clone)]
pub struct QuorumOption {
    /// Deadline for a single RPC to one journal node.
    ///
    /// DEFAULT: 20s
    pub rpc_timeout: Duration,

    /// Deadline for a fan-out call to reach a majority.
    ///
    /// DEFAULT: 20s
    pub quorum_timeout: Duration,

    /// Upper bound on edit bytes queued to one peer. Beyond it, sends to
    /// that peer fail fast instead of blocking the writer.
    ///
    /// DEFAULT: 10 MiB
    pub max_queued_edits_bytes: usize,
}

impl Default for QuorumOption {
    fn default() -> Self {
        QuorumOption {
            rpc_timeout: Duration::from_secs(20),
            quorum_timeout: Duration::from_secs(20),
            max_queued_edits_bytes: 10 * 1024 * 1024,
        }
    }
}
