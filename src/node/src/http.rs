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

//! HTTP retrieval of segment files, used by peers during recovery and by
//! external readers. The byte contract is a 4-byte big-endian layout
//! version followed by the raw segment bytes.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use qjournal_common::{
    layout::{self, SegmentFileKind},
    Error, Result, LAYOUT_VERSION,
};
use serde::Deserialize;
use tracing::warn;

use crate::node::JournalNode;

#[derive(Debug, Deserialize)]
struct GetImageQuery {
    filename: String,
    jid: String,
}

pub fn router(node: JournalNode) -> Router {
    Router::new().route("/getimage", get(get_image)).with_state(node)
}

async fn get_image(State(node): State<JournalNode>, Query(query): Query<GetImageQuery>) -> Response {
    match serve_segment(&node, &query).await {
        Ok(body) => body.into_response(),
        Err(err) => {
            warn!(filename = %query.filename, jid = %query.jid, "getimage failed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn serve_segment(node: &JournalNode, query: &GetImageQuery) -> Result<Vec<u8>> {
    // Only canonical segment names are served; anything else (including
    // path traversal attempts) is refused.
    let kind = layout::parse_segment_name(&query.filename)
        .ok_or_else(|| Error::Io(format!("not a segment file name: {}", query.filename)))?;

    let handle = node.get_or_create_journal(&query.jid).await?;
    let path = {
        let journal = handle.lock().await;
        match kind {
            SegmentFileKind::InProgress(start) => journal.storage().inprogress_path(start),
            SegmentFileKind::Finalized(start, end) => journal.storage().finalized_path(start, end),
        }
    };

    let bytes = std::fs::read(&path)?;
    let mut body = Vec::with_capacity(4 + bytes.len());
    body.extend_from_slice(&LAYOUT_VERSION.to_be_bytes());
    body.extend_from_slice(&bytes);
    Ok(body)
}
