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

mod ext;
mod layout;

pub use ext::{atomic_write, fsync_dir};
pub use layout::{parse_file_name, FileType};
pub(crate) use layout::{
    current_dir, finalized_path, inprogress_path, paxos_dir, paxos_path, promised_epoch_file,
    temp_path, version_file, writer_epoch_file,
};
