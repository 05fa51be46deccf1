//! Individual protocol calls, each wrapped in the retry policy.
use std::sync::Arc;

use log::debug;

use crate::{
    error::{Error, Result},
    protocol::{
        DirectResult, ExecuteOptions, OperationHandle, OperationState, Request, Response,
        ResponseError, ResultMetadata, RowSet, ServerFailure, Transport,
    },
    retry::{CancelToken, Idempotency, RetryPolicy},
    types::Parameter,
};

/// What the server said about a freshly submitted statement.
#[derive(Debug, Clone)]
pub struct Submitted {
    pub handle: OperationHandle,
    pub state: OperationState,
    pub failure: Option<ServerFailure>,
    pub direct: Option<DirectResult>,
}

pub struct RpcGateway {
    transport: Arc<dyn Transport>,
    endpoint: String,
    policy: RetryPolicy,
    never: CancelToken,
}

impl RpcGateway {
    pub fn new(transport: Arc<dyn Transport>, endpoint: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            policy,
            never: CancelToken::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn call(&self, request: Request, idempotency: Idempotency) -> Result<Response> {
        let name = request.name();
        let response = self
            .policy
            .run(name, idempotency, &self.endpoint, &self.never, |endpoint| {
                self.transport.send(endpoint, &request)
            })?;

        match response {
            Response::Err { code, description } => Err(match code {
                ResponseError::UnknownOperation | ResponseError::ExpiredOperation => {
                    Error::UnrecoverableResult(format!("{code:?}: {description}"))
                }
                _ => Error::ServerOperation {
                    code: format!("{code:?}"),
                    message: description,
                },
            }),
            other => Ok(other),
        }
    }

    pub fn submit(
        &self,
        statement: &str,
        parameters: &[Parameter],
        options: ExecuteOptions,
    ) -> Result<Submitted> {
        let request = Request::Execute {
            statement: statement.to_string(),
            parameters: parameters.to_vec(),
            options,
        };

        match self.call(request, Idempotency::Submit)? {
            Response::Executed {
                handle,
                state,
                failure,
                direct,
            } => {
                debug!(
                    "submitted {} state={state:?} direct={}",
                    handle.query_id(),
                    direct.is_some()
                );
                Ok(Submitted {
                    handle,
                    state,
                    failure,
                    direct,
                })
            }
            other => Err(unexpected("Execute", other)),
        }
    }

    pub fn get_status(
        &self,
        handle: &OperationHandle,
    ) -> Result<(OperationState, Option<ServerFailure>)> {
        match self.call(Request::GetStatus { handle: *handle }, Idempotency::Idempotent)? {
            Response::Status { state, failure } => Ok((state, failure)),
            other => Err(unexpected("GetStatus", other)),
        }
    }

    pub fn get_metadata(&self, handle: &OperationHandle) -> Result<ResultMetadata> {
        match self.call(Request::GetMetadata { handle: *handle }, Idempotency::Idempotent)? {
            Response::Metadata(metadata) => Ok(metadata),
            other => Err(unexpected("GetMetadata", other)),
        }
    }

    pub fn fetch_results(
        &self,
        handle: &OperationHandle,
        start_row_offset: i64,
        max_rows: u64,
    ) -> Result<RowSet> {
        let request = Request::FetchResults {
            handle: *handle,
            start_row_offset,
            max_rows,
        };
        match self.call(request, Idempotency::Idempotent)? {
            Response::Rows(rows) => Ok(rows),
            other => Err(unexpected("FetchResults", other)),
        }
    }

    pub fn cancel(&self, handle: &OperationHandle) -> Result<()> {
        match self.call(Request::Cancel { handle: *handle }, Idempotency::Idempotent)? {
            Response::Canceled => Ok(()),
            other => Err(unexpected("Cancel", other)),
        }
    }

    pub fn close_operation(&self, handle: &OperationHandle) -> Result<()> {
        match self.call(
            Request::CloseOperation { handle: *handle },
            Idempotency::Idempotent,
        )? {
            Response::Closed => Ok(()),
            other => Err(unexpected("CloseOperation", other)),
        }
    }
}

fn unexpected(request: &'static str, response: Response) -> Error {
    let detail = match response {
        Response::Executed { .. } => "Executed".to_string(),
        Response::Status { state, .. } => format!("Status({state:?})"),
        Response::Metadata(_) => "Metadata".to_string(),
        Response::Rows(_) => "Rows".to_string(),
        other => format!("{other:?}"),
    };
    Error::Protocol { request, detail }
}
