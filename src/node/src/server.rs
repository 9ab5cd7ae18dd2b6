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

use qjournal_proto::*;
use tonic::{Request, Response, Status};

use crate::node::JournalNode;

type Result<T> = std::result::Result<T, Status>;

/// The gRPC face of a journal node. Thin: it resolves the journal, takes
/// its mutex, and delegates to the state machine.
#[derive(Clone)]
pub struct Server {
    node: JournalNode,
}

impl Server {
    pub fn new(node: JournalNode) -> Self {
        Server { node }
    }

    pub fn into_service(self) -> journal_server::JournalServer<Server> {
        journal_server::JournalServer::new(self)
    }
}

fn req_info(req_info: Option<RequestInfo>) -> Result<RequestInfo> {
    req_info.ok_or_else(|| Status::invalid_argument("request info is required"))
}

#[tonic::async_trait]
impl journal_server::Journal for Server {
    async fn get_journal_state(
        &self,
        request: Request<GetJournalStateRequest>,
    ) -> Result<Response<GetJournalStateResponse>> {
        let req = request.into_inner();
        let handle = self.node.get_or_create_journal(&req.journal_id).await?;
        let journal = handle.lock().await;
        Ok(Response::new(GetJournalStateResponse {
            last_promised_epoch: journal.last_promised_epoch(),
            http_port: self.node.http_port().await as u32,
        }))
    }

    async fn new_epoch(
        &self,
        request: Request<NewEpochRequest>,
    ) -> Result<Response<NewEpochResponse>> {
        let req = request.into_inner();
        let ns_info = req
            .ns_info
            .ok_or_else(|| Status::invalid_argument("namespace info is required"))?;
        let handle = self.node.get_or_create_journal(&req.journal_id).await?;
        let mut journal = handle.lock().await;
        let last_segment_tx_id = journal.new_epoch(&ns_info, req.epoch)?;
        Ok(Response::new(NewEpochResponse {
            last_segment_tx_id,
            last_promised_epoch: journal.last_promised_epoch(),
        }))
    }

    async fn start_log_segment(
        &self,
        request: Request<StartLogSegmentRequest>,
    ) -> Result<Response<StartLogSegmentResponse>> {
        let req = request.into_inner();
        let info = req_info(req.req_info)?;
        let handle = self.node.get_or_create_journal(&info.journal_id).await?;
        let mut journal = handle.lock().await;
        journal.start_log_segment(&info, req.tx_id)?;
        Ok(Response::new(StartLogSegmentResponse {
            last_promised_epoch: journal.last_promised_epoch(),
        }))
    }

    async fn journal(&self, request: Request<JournalRequest>) -> Result<Response<JournalResponse>> {
        let req = request.into_inner();
        let info = req_info(req.req_info)?;
        let handle = self.node.get_or_create_journal(&info.journal_id).await?;
        let mut journal = handle.lock().await;
        journal.journal(&info, req.first_tx_id, req.num_txns, &req.records)?;
        Ok(Response::new(JournalResponse {
            last_promised_epoch: journal.last_promised_epoch(),
        }))
    }

    async fn finalize_log_segment(
        &self,
        request: Request<FinalizeLogSegmentRequest>,
    ) -> Result<Response<FinalizeLogSegmentResponse>> {
        let req = request.into_inner();
        let info = req_info(req.req_info)?;
        let handle = self.node.get_or_create_journal(&info.journal_id).await?;
        let mut journal = handle.lock().await;
        journal.finalize_log_segment(&info, req.start_tx_id, req.end_tx_id)?;
        Ok(Response::new(FinalizeLogSegmentResponse {
            last_promised_epoch: journal.last_promised_epoch(),
        }))
    }

    async fn prepare_recovery(
        &self,
        request: Request<PrepareRecoveryRequest>,
    ) -> Result<Response<PrepareRecoveryResponse>> {
        let req = request.into_inner();
        let info = req_info(req.req_info)?;
        let handle = self.node.get_or_create_journal(&info.journal_id).await?;
        let mut journal = handle.lock().await;
        let outcome = journal.prepare_recovery(&info, req.segment_tx_id)?;
        Ok(Response::new(PrepareRecoveryResponse {
            segment_state: outcome.segment_state,
            accepted_recovery: outcome.accepted_recovery,
            last_writer_epoch: outcome.last_writer_epoch,
            last_promised_epoch: journal.last_promised_epoch(),
        }))
    }

    async fn accept_recovery(
        &self,
        request: Request<AcceptRecoveryRequest>,
    ) -> Result<Response<AcceptRecoveryResponse>> {
        let req = request.into_inner();
        let info = req_info(req.req_info)?;
        let state = req
            .state_to_accept
            .ok_or_else(|| Status::invalid_argument("segment state is required"))?;
        let handle = self.node.get_or_create_journal(&info.journal_id).await?;
        let mut journal = handle.lock().await;
        journal.accept_recovery(&info, &state, &req.from_url).await?;
        Ok(Response::new(AcceptRecoveryResponse {
            last_promised_epoch: journal.last_promised_epoch(),
        }))
    }
}
