//! Client-server communication protocol.
//!
//! Every exchange is one [`Request`] answered by one [`Response`]. Requests cover the life
//! of a run: submission, status polls, metadata, result pages (inline rows or staged file
//! links), cancellation and close.
//!
//! # Binary Format
//!
//! Messages are bincode encoded with big-endian, fixed-width integers and written back to
//! back on the stream; the enum discriminant comes first. [`ProtocolTransport`] reads and
//! writes them over any `Read + Write`.
//!
//! # Status signals
//!
//! Throttling, unavailability, authorization failures and redirects travel as
//! [`Response::Rejected`]. Transports lift them into [`TransportError`] values with
//! [`lift_rejection`] so the retry engine can classify them.
//!
//! # See Also
//!
//! - [`gateway`](crate::gateway): retried protocol calls built on [`Transport`].
//! - [`warehouse`](crate::warehouse): the in-memory server side.
mod request;
mod response;
mod server;
mod transport;

pub use request::{ExecuteOptions, OperationHandle, Request};
pub use response::{
    DirectResult, EncryptionInfo, FileReference, OperationState, ResultFormat, ResultMetadata,
    Response, ResponseError, RowPayload, RowSet, ServerFailure,
};
pub use server::WarehouseServer;
pub use transport::{ProtocolTransport, TcpTransport, Transport, TransportError, lift_rejection};
