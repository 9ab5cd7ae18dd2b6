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

//! Canonical segment file names. Finalized names are used verbatim as the
//! `filename` parameter of the HTTP segment endpoint, so both sides of the
//! wire share this module.

const INPROGRESS_PREFIX: &str = "edits_inprogress_";
const FINALIZED_PREFIX: &str = "edits_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFileKind {
    InProgress(u64),
    Finalized(u64, u64),
}

pub fn inprogress_name(start_tx_id: u64) -> String {
    format!("{}{:019}", INPROGRESS_PREFIX, start_tx_id)
}

pub fn finalized_name(start_tx_id: u64, end_tx_id: u64) -> String {
    format!("{}{:019}-{:019}", FINALIZED_PREFIX, start_tx_id, end_tx_id)
}

/// Parse a segment file name back into its kind. Returns `None` for
/// anything that is not a canonical segment name.
pub fn parse_segment_name(name: &str) -> Option<SegmentFileKind> {
    if let Some(rest) = name.strip_prefix(INPROGRESS_PREFIX) {
        return rest.parse::<u64>().ok().map(SegmentFileKind::InProgress);
    }
    if let Some(rest) = name.strip_prefix(FINALIZED_PREFIX) {
        let (start, end) = rest.split_once('-')?;
        let start = start.parse::<u64>().ok()?;
        let end = end.parse::<u64>().ok()?;
        return Some(SegmentFileKind::Finalized(start, end));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalized_name_is_zero_padded() {
        assert_eq!(
            finalized_name(1, 3),
            "edits_0000000000000000001-0000000000000000003"
        );
    }

    #[test]
    fn inprogress_name_round_trips() {
        let name = inprogress_name(42);
        assert_eq!(name, "edits_inprogress_0000000000000000042");
        assert_eq!(parse_segment_name(&name), Some(SegmentFileKind::InProgress(42)));
    }

    #[test]
    fn finalized_name_round_trips() {
        let name = finalized_name(7, 123);
        assert_eq!(parse_segment_name(&name), Some(SegmentFileKind::Finalized(7, 123)));
    }

    #[test]
    fn rejects_non_segment_names() {
        assert_eq!(parse_segment_name("VERSION"), None);
        assert_eq!(parse_segment_name("edits_xxxDoesNotExist"), None);
        assert_eq!(parse_segment_name("edits_1-2-3"), None);
        assert_eq!(parse_segment_name("../../etc/passwd"), None);
    }
}
