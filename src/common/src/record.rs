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

//! Transaction record framing inside segment files.
//!
//! The writer frames every transaction before it is handed to the quorum;
//! journal nodes append the framed payload verbatim and only decode it when
//! they have to re-establish the tail of a segment they did not write in
//! this process lifetime.
//!
//! ```text
//! record := tx_id  u64 BE
//!         | length u32 BE
//!         | crc32  u32 BE   (over the payload)
//!         | payload
//! ```

pub const RECORD_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub tx_id: u64,
    pub payload: &'a [u8],
}

/// Append one framed record to `buf`.
pub fn encode_record(buf: &mut Vec<u8>, tx_id: u64, payload: &[u8]) {
    buf.reserve(RECORD_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&tx_id.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
    buf.extend_from_slice(payload);
}

/// Decode the record starting at `offset`. Returns the record and the
/// offset one past it, or `None` when the bytes are truncated or fail the
/// checksum.
pub fn decode_record(bytes: &[u8], offset: usize) -> Option<(Record<'_>, usize)> {
    let header = bytes.get(offset..offset + RECORD_HEADER_SIZE)?;
    let tx_id = u64::from_be_bytes(header[0..8].try_into().unwrap());
    let len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
    let crc = u32::from_be_bytes(header[12..16].try_into().unwrap());

    let start = offset + RECORD_HEADER_SIZE;
    let payload = bytes.get(start..start + len)?;
    if crc32fast::hash(payload) != crc {
        return None;
    }
    Some((Record { tx_id, payload }, start + len))
}

/// Result of scanning a segment's bytes for its valid record prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentScan {
    /// Highest transaction id in the valid prefix, `None` when the segment
    /// holds no complete record.
    pub last_tx_id: Option<u64>,
    pub num_txns: u64,
    /// Byte length of the valid prefix.
    pub valid_bytes: u64,
    /// Whether bytes remain past the valid prefix (a torn trailing write).
    pub torn: bool,
}

/// Scan a segment, enforcing strictly consecutive transaction ids starting
/// at `first_tx_id`. The scan stops at the first truncated, corrupt, or
/// out-of-order record; everything before it is the valid prefix.
pub fn scan_segment(bytes: &[u8], first_tx_id: u64) -> SegmentScan {
    let mut offset = 0usize;
    let mut next_tx_id = first_tx_id;
    while let Some((record, end)) = decode_record(bytes, offset) {
        if record.tx_id != next_tx_id {
            break;
        }
        next_tx_id += 1;
        offset = end;
    }
    SegmentScan {
        last_tx_id: next_tx_id.checked_sub(1).filter(|_| next_tx_id > first_tx_id),
        num_txns: next_tx_id - first_tx_id,
        valid_bytes: offset as u64,
        torn: offset < bytes.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_txns(first: u64, num: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        for tx_id in first..first + num {
            encode_record(&mut buf, tx_id, format!("tx {}", tx_id).as_bytes());
        }
        buf
    }

    #[test]
    fn scan_counts_consecutive_records() {
        let buf = encode_txns(1, 3);
        let scan = scan_segment(&buf, 1);
        assert_eq!(scan.last_tx_id, Some(3));
        assert_eq!(scan.num_txns, 3);
        assert_eq!(scan.valid_bytes, buf.len() as u64);
        assert!(!scan.torn);
    }

    #[test]
    fn scan_of_empty_segment() {
        let scan = scan_segment(&[], 5);
        assert_eq!(scan.last_tx_id, None);
        assert_eq!(scan.num_txns, 0);
        assert_eq!(scan.valid_bytes, 0);
        assert!(!scan.torn);
    }

    #[test]
    fn torn_tail_is_ignored() {
        let mut buf = encode_txns(1, 2);
        let full_len = buf.len();
        let mut partial = Vec::new();
        encode_record(&mut partial, 3, b"tx 3");
        partial.truncate(partial.len() - 2);
        buf.extend_from_slice(&partial);

        let scan = scan_segment(&buf, 1);
        assert_eq!(scan.last_tx_id, Some(2));
        assert_eq!(scan.valid_bytes, full_len as u64);
        assert!(scan.torn);
    }

    #[test]
    fn corrupt_payload_stops_scan() {
        let mut buf = encode_txns(1, 2);
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        let scan = scan_segment(&buf, 1);
        assert_eq!(scan.last_tx_id, Some(1));
        assert!(scan.torn);
    }

    #[test]
    fn txid_gap_stops_scan() {
        let mut buf = Vec::new();
        encode_record(&mut buf, 1, b"a");
        encode_record(&mut buf, 3, b"b");
        let scan = scan_segment(&buf, 1);
        assert_eq!(scan.last_tx_id, Some(1));
        assert_eq!(scan.num_txns, 1);
        assert!(scan.torn);
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let mut buf = Vec::new();
        encode_record(&mut buf, 1, b"a");
        assert!(decode_record(&buf[..RECORD_HEADER_SIZE - 1], 0).is_none());
    }
}
