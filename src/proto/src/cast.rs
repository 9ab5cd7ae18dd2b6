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

use crate::v1::{NamespaceInfo, RequestInfo, SegmentInfo};

impl SegmentInfo {
    pub fn in_progress(start_tx_id: u64, end_tx_id: u64, size_bytes: u64) -> Self {
        SegmentInfo {
            start_tx_id,
            end_tx_id,
            is_in_progress: true,
            size_bytes,
        }
    }

    pub fn finalized(start_tx_id: u64, end_tx_id: u64, size_bytes: u64) -> Self {
        SegmentInfo {
            start_tx_id,
            end_tx_id,
            is_in_progress: false,
            size_bytes,
        }
    }

    /// Whether the segment holds no transactions at all.
    pub fn is_empty(&self) -> bool {
        self.end_tx_id < self.start_tx_id
    }

    pub fn num_txns(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.end_tx_id - self.start_tx_id + 1
        }
    }
}

impl std::fmt::Display for SegmentInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_in_progress {
            write!(f, "segment [{}, {}) (in progress)", self.start_tx_id, self.end_tx_id + 1)
        } else {
            write!(f, "segment [{}, {}]", self.start_tx_id, self.end_tx_id)
        }
    }
}

impl RequestInfo {
    pub fn new(journal_id: String, ns_info: NamespaceInfo, epoch: u64, ipc_serial: u64) -> Self {
        RequestInfo {
            journal_id,
            ns_info: Some(ns_info),
            epoch,
            ipc_serial,
        }
    }
}
