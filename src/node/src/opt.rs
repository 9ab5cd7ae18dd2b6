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

use std::path::PathBuf;

/// The option structure of a journal node.
#[derive(Debug, Clone)]
pub struct NodeOption {
    /// Directory under which one sub-directory per journal id is kept.
    pub base_dir: PathBuf,

    /// Sync segment data before acknowledging a write.
    ///
    /// DEFAULT: true
    pub sync_data: bool,
}

impl NodeOption {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        NodeOption {
            base_dir: base_dir.into(),
            sync_data: true,
        }
    }
}
