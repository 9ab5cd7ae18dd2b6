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

mod deferred;
mod logger;
mod manager;
mod opt;
mod quorum_call;
mod segment_writer;

pub use deferred::Deferred;
pub use logger::{AsyncLogger, IpcLoggerChannel};
pub use manager::QuorumJournalManager;
pub use opt::QuorumOption;
pub use quorum_call::{majority, QuorumCall};
pub use segment_writer::QuorumOutputStream;
