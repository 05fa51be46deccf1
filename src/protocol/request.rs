use bincode::{Decode, Encode};
use uuid::Uuid;

use crate::types::Parameter;

/// Wire identity of a server-side run. Both halves are required to address it.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq, Hash)]
pub struct OperationHandle {
    pub query_id: [u8; 16],
    pub query_secret: [u8; 16],
}

impl OperationHandle {
    pub fn new(query_id: Uuid, query_secret: Uuid) -> Self {
        Self {
            query_id: query_id.into_bytes(),
            query_secret: query_secret.into_bytes(),
        }
    }

    pub fn query_id(&self) -> Uuid {
        Uuid::from_bytes(self.query_id)
    }

    pub fn query_secret(&self) -> Uuid {
        Uuid::from_bytes(self.query_secret)
    }
}

/// Execution hints sent with a statement.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Return as soon as the run is accepted instead of waiting for a direct result.
    pub run_async: bool,
    /// Largest result, in rows, the server may embed inline.
    pub max_inline_rows: u64,
    /// Largest result, in bytes, the server may embed inline.
    pub max_inline_bytes: u64,
    /// Whether the server may stage large results as downloadable files.
    pub allow_staged: bool,
    /// Whether staged files may be lz4 compressed.
    pub compression: bool,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub enum Request {
    Execute {
        statement: String,
        parameters: Vec<Parameter>,
        options: ExecuteOptions,
    },
    GetStatus {
        handle: OperationHandle,
    },
    GetMetadata {
        handle: OperationHandle,
    },
    FetchResults {
        handle: OperationHandle,
        start_row_offset: i64,
        max_rows: u64,
    },
    Cancel {
        handle: OperationHandle,
    },
    CloseOperation {
        handle: OperationHandle,
    },
    Ping,
}

impl Request {
    /// Short name used in logs; never includes statement text or parameters.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Execute { .. } => "Execute",
            Request::GetStatus { .. } => "GetStatus",
            Request::GetMetadata { .. } => "GetMetadata",
            Request::FetchResults { .. } => "FetchResults",
            Request::Cancel { .. } => "Cancel",
            Request::CloseOperation { .. } => "CloseOperation",
            Request::Ping => "Ping",
        }
    }
}
