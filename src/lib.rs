//! Client-side engine that drives a remote SQL statement from submission to rows.
//!
//! A [`Session`] submits statements through an [`RpcGateway`], which wraps every protocol
//! call in the [`RetryPolicy`]. Each submission yields an [`ExecutionHandle`] that can be
//! polled, canceled, serialized and resumed. A finished handle opens a [`ResultSet`] whose
//! rows arrive either inline or as staged files fetched by the [`CloudFetchDownloader`].
pub mod cloudfetch;
pub mod config;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod protocol;
pub mod result;
pub mod retry;
pub mod session;
pub mod thread;
pub mod types;
pub mod warehouse;

pub use cloudfetch::{CloudFetchDownloader, Decryptor, FileFetcher, LinkResolver};
pub use config::{ClientConfig, CloudFetchConfig, RetryConfig};
pub use error::{Error, Result};
pub use execution::{Canceller, ExecutionHandle, ExecutionStatus};
pub use gateway::RpcGateway;
pub use result::{ResultDescriptor, ResultSet};
pub use retry::{CancelToken, RetryPolicy};
pub use session::Session;
pub use types::{ColumnDescriptor, LogicalType, Parameter, Row, RowBatch, Value};
pub use warehouse::{LocalTransport, Table, Warehouse, WarehouseConfig};
