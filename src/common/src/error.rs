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

use thiserror::Error;
use tonic::{Code, Status};

/// Every failure class of the journal protocol. Each variant maps to a
/// distinct gRPC status code so the kind survives a round trip through
/// the RPC layer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("journal {0} is not formatted")]
    NotFormatted(String),
    #[error("namespace mismatch: {0}")]
    NamespaceMismatch(String),
    #[error("{0}")]
    EpochTooLow(String),
    #[error("{0}")]
    EpochMismatch(String),
    #[error("out of sync: {0}")]
    OutOfSync(String),
    #[error("{0}")]
    SegmentState(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("{0}")]
    Timeout(String),
    #[error("too many queued edits: {0}")]
    TooManyQueued(String),
    #[error("{0}")]
    QuorumFailed(String),
    #[error("call cancelled")]
    Cancelled,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn unknown(s: impl ToString) -> Self {
        Self::Unknown(s.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::Io(format!("transport: {err}"))
    }
}

impl From<Status> for Error {
    fn from(s: Status) -> Self {
        let msg = s.message().to_owned();
        match s.code() {
            Code::NotFound => Error::NotFormatted(msg),
            Code::InvalidArgument => Error::NamespaceMismatch(msg),
            Code::FailedPrecondition => Error::EpochTooLow(msg),
            Code::PermissionDenied => Error::EpochMismatch(msg),
            Code::OutOfRange => Error::OutOfSync(msg),
            Code::Aborted => Error::SegmentState(msg),
            Code::Internal => Error::Io(msg),
            Code::DeadlineExceeded => Error::Timeout(msg),
            Code::ResourceExhausted => Error::TooManyQueued(msg),
            Code::Unavailable => Error::QuorumFailed(msg),
            Code::Cancelled => Error::Cancelled,
            _ => Error::Unknown(s.to_string()),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Status {
        let code = match &err {
            Error::NotFormatted(_) => Code::NotFound,
            Error::NamespaceMismatch(_) => Code::InvalidArgument,
            Error::EpochTooLow(_) => Code::FailedPrecondition,
            Error::EpochMismatch(_) => Code::PermissionDenied,
            Error::OutOfSync(_) => Code::OutOfRange,
            Error::SegmentState(_) => Code::Aborted,
            Error::Io(_) => Code::Internal,
            Error::Timeout(_) => Code::DeadlineExceeded,
            Error::TooManyQueued(_) => Code::ResourceExhausted,
            Error::QuorumFailed(_) => Code::Unavailable,
            Error::Cancelled => Code::Cancelled,
            Error::InvalidResponse(_) | Error::Unknown(_) => Code::Unknown,
        };
        Status::new(code, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_status_round_trip() {
        let err = Error::EpochTooLow("epoch 1 is less than the last promised epoch 2".to_owned());
        let status: Status = err.into();
        let back: Error = status.into();
        match back {
            Error::EpochTooLow(msg) => {
                assert_eq!(msg, "epoch 1 is less than the last promised epoch 2");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn out_of_sync_keeps_code() {
        let err = Error::OutOfSync("expected txid 3 but got 5".to_owned());
        let status: Status = err.into();
        assert_eq!(status.code(), Code::OutOfRange);
    }
}
