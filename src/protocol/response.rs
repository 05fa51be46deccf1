use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};

use crate::types::{ColumnDescriptor, RowBatch};

use super::OperationHandle;

/// Server-side lifecycle of a run.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Running,
    Finished,
    Canceled,
    Failed,
    Closed,
    TimedOut,
}

/// Failure detail reported by the server for a FAILED run.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ServerFailure {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum ResultFormat {
    Inline,
    Staged,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ResultMetadata {
    pub columns: Vec<ColumnDescriptor>,
    /// -1 when the server does not know the total.
    pub total_row_count: i64,
    pub format: ResultFormat,
    pub compressed: bool,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct EncryptionInfo {
    pub key_id: String,
    pub nonce: Vec<u8>,
}

/// Pre-signed, time-limited link to one staged result file.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct FileReference {
    pub url: String,
    /// Position of the file's first row in the logical result.
    pub row_offset: i64,
    pub row_count: u64,
    pub byte_len: u64,
    /// Unix milliseconds after which the url stops working; 0 when unknown.
    pub expires_at_ms: u64,
    /// CRC32 of the bytes served at `url`.
    pub checksum: Option<u32>,
    pub encryption: Option<EncryptionInfo>,
}

impl FileReference {
    /// Whether the link is expired, or will be within `buffer`.
    pub fn is_expired(&self, buffer: Duration) -> bool {
        if self.expires_at_ms == 0 {
            return false;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.expires_at_ms <= now.saturating_add(buffer.as_millis() as u64)
    }

    /// One past the last row offset covered by this file.
    pub fn end_row_offset(&self) -> i64 {
        self.row_offset + self.row_count as i64
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub enum RowPayload {
    Inline(Vec<RowBatch>),
    Links(Vec<FileReference>),
}

/// One page of results starting at `start_row_offset`.
#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub struct RowSet {
    pub start_row_offset: i64,
    pub payload: RowPayload,
    pub has_more_rows: bool,
}

/// Result embedded in the execute response. Never persisted server-side.
#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub struct DirectResult {
    pub metadata: ResultMetadata,
    pub rows: RowSet,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub enum Response {
    Executed {
        handle: OperationHandle,
        state: OperationState,
        failure: Option<ServerFailure>,
        direct: Option<DirectResult>,
    },
    Status {
        state: OperationState,
        failure: Option<ServerFailure>,
    },
    Metadata(ResultMetadata),
    Rows(RowSet),
    Canceled,
    Closed,
    Pong,
    Err {
        code: ResponseError,
        description: String,
    },
    /// Coarse status signal in the spirit of an HTTP status line: throttling,
    /// unavailability, authorization failures and redirects.
    Rejected {
        status: u16,
        retry_after_ms: Option<u64>,
        location: Option<String>,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum ResponseError {
    UnknownOperation,
    ExpiredOperation,
    InvalidRequest,
    Internal,
}
