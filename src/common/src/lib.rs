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

pub mod error;
pub mod layout;
pub mod record;

pub use error::{Error, Result};

/// Version of the on-disk and over-the-wire segment format. Served as a
/// 4-byte big-endian prefix ahead of raw segment bytes over HTTP.
pub const LAYOUT_VERSION: i32 = -40;
