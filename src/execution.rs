//! Client-side state machine for one server-side run.
//!
//! ```text
//!            +-----------+
//!  submit -> |  RUNNING  | --(poll)--> FINISHED | FAILED
//!            +-----------+ --(cancel)-> CANCELED
//!  any state --(close)--> CLOSED
//! ```
//!
//! Terminal states never revert to RUNNING, and once a handle reaches a terminal state no
//! further status RPC is issued for it.
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use log::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    gateway::RpcGateway,
    protocol::{OperationHandle, OperationState, ResultFormat, ServerFailure},
    result::{ResultDescriptor, ResultSet},
    retry::CancelToken,
    session::SessionInner,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    Running,
    Finished,
    Canceled,
    Failed,
    Closed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        self != ExecutionStatus::Running
    }
}

impl From<OperationState> for ExecutionStatus {
    fn from(state: OperationState) -> Self {
        match state {
            OperationState::Pending | OperationState::Running => ExecutionStatus::Running,
            OperationState::Finished => ExecutionStatus::Finished,
            OperationState::Canceled => ExecutionStatus::Canceled,
            OperationState::Failed | OperationState::TimedOut => ExecutionStatus::Failed,
            OperationState::Closed => ExecutionStatus::Closed,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Finished => "FINISHED",
            ExecutionStatus::Canceled => "CANCELED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Status shared between a handle, its result set and its session.
#[derive(Debug)]
pub(crate) struct StatusCell(Mutex<ExecutionStatus>);

impl StatusCell {
    pub fn new(status: ExecutionStatus) -> Self {
        Self(Mutex::new(status))
    }

    pub fn get(&self) -> ExecutionStatus {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `next` if allowed and returns the resulting status.
    ///
    /// CLOSED absorbs everything; RUNNING may move anywhere; other terminal states only
    /// move to CLOSED.
    pub fn advance(&self, next: ExecutionStatus) -> ExecutionStatus {
        let mut current = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let allowed = match *current {
            ExecutionStatus::Closed => false,
            ExecutionStatus::Running => true,
            _ => next == ExecutionStatus::Closed,
        };
        if allowed && *current != next {
            debug!("status {} -> {next}", *current);
            *current = next;
        }
        *current
    }
}

/// Thread-safe trigger that cancels a run while its owner blocks in
/// [`ExecutionHandle::get_results`].
#[derive(Clone)]
pub struct Canceller {
    gateway: Arc<RpcGateway>,
    operation: OperationHandle,
    status: Arc<StatusCell>,
    wake: CancelToken,
}

impl Canceller {
    /// Requests cancellation. A no-op once the run is terminal.
    pub fn cancel(&self) -> Result<()> {
        match self.status.get() {
            ExecutionStatus::Closed => return Err(Error::Closed),
            ExecutionStatus::Running => {}
            status => {
                debug!(
                    "cancel of {} ignored, already {status}",
                    self.operation.query_id()
                );
                return Ok(());
            }
        }

        self.gateway.cancel(&self.operation)?;
        info!("canceled {}", self.operation.query_id());
        self.status.advance(ExecutionStatus::Canceled);
        self.wake.cancel();
        Ok(())
    }
}

pub struct ExecutionHandle {
    session: Arc<SessionInner>,
    operation: OperationHandle,
    returned_as_direct_result: bool,
    status: Arc<StatusCell>,
    failure: Option<ServerFailure>,
    descriptor: Option<ResultDescriptor>,
    /// Interrupts the polling wait in `get_results`.
    wake: CancelToken,
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("query_id", &self.query_id())
            .field("status", &self.status())
            .field("returned_as_direct_result", &self.returned_as_direct_result)
            .finish_non_exhaustive()
    }
}

impl ExecutionHandle {
    pub(crate) fn new(
        session: Arc<SessionInner>,
        operation: OperationHandle,
        status: Arc<StatusCell>,
        failure: Option<ServerFailure>,
        descriptor: Option<ResultDescriptor>,
    ) -> Self {
        Self {
            session,
            operation,
            returned_as_direct_result: descriptor.is_some(),
            status,
            failure,
            descriptor,
            wake: CancelToken::new(),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status.get()
    }

    pub fn query_id(&self) -> Uuid {
        self.operation.query_id()
    }

    pub fn query_secret(&self) -> Uuid {
        self.operation.query_secret()
    }

    /// Whether rows came back with the submission. Such runs are never persisted by the
    /// server and cannot be resumed.
    pub fn returned_as_direct_result(&self) -> bool {
        self.returned_as_direct_result
    }

    /// Server failure detail, once the run is FAILED.
    pub fn failure(&self) -> Option<&ServerFailure> {
        self.failure.as_ref()
    }

    /// Refreshes the status from the server. No RPC is issued once the run is terminal.
    pub fn sync_status(&mut self) -> Result<ExecutionStatus> {
        let current = self.status.get();
        if current == ExecutionStatus::Closed {
            return Err(Error::Closed);
        }
        if current.is_terminal() {
            return Ok(current);
        }

        let (state, failure) = self.session.gateway.get_status(&self.operation)?;
        let next = self.status.advance(state.into());
        if next == ExecutionStatus::Failed && self.failure.is_none() {
            self.failure = Some(failure.unwrap_or_else(|| ServerFailure {
                code: format!("{state:?}").to_uppercase(),
                message: "server reported no failure detail".to_string(),
            }));
        }
        Ok(next)
    }

    /// Blocks until the run is terminal, polling on the retry backoff schedule.
    fn wait(&mut self) -> Result<ExecutionStatus> {
        let policy = self.session.gateway.policy().clone();
        let mut polls = 0;

        loop {
            let status = self.sync_status()?;
            if status.is_terminal() {
                return Ok(status);
            }
            polls += 1;
            let delay = policy.base_delay(polls);
            debug!("{} still running, polling again in {delay:?}", self.query_id());
            if !policy.pause(delay, &self.wake) {
                debug!("poll wait for {} interrupted", self.query_id());
            }
        }
    }

    /// Waits for the run to finish and opens its rows.
    ///
    /// Direct results are opened without any network call.
    pub fn get_results(&mut self) -> Result<ResultSet> {
        match self.wait()? {
            ExecutionStatus::Finished => {}
            ExecutionStatus::Canceled => return Err(Error::Cancellation),
            ExecutionStatus::Failed => {
                let failure = self.failure.clone().unwrap_or_else(|| ServerFailure {
                    code: "UNKNOWN".to_string(),
                    message: String::new(),
                });
                return Err(Error::ServerOperation {
                    code: failure.code,
                    message: failure.message,
                });
            }
            ExecutionStatus::Closed | ExecutionStatus::Running => return Err(Error::Closed),
        }

        let descriptor = self.descriptor()?;
        ResultSet::open(
            descriptor,
            &self.session,
            self.operation,
            Arc::clone(&self.status),
            self.returned_as_direct_result,
        )
    }

    fn descriptor(&mut self) -> Result<ResultDescriptor> {
        if let Some(descriptor) = &self.descriptor {
            return Ok(descriptor.clone());
        }

        let gateway = &self.session.gateway;
        let config = &self.session.config;
        let metadata = gateway.get_metadata(&self.operation)?;
        let page_rows = match metadata.format {
            ResultFormat::Inline => config.fetch_page_rows,
            ResultFormat::Staged => config.cloudfetch.link_page_rows,
        };
        let rows = gateway.fetch_results(&self.operation, 0, page_rows)?;

        let descriptor = ResultDescriptor::new(metadata, rows);
        self.descriptor = Some(descriptor.clone());
        Ok(descriptor)
    }

    /// Requests cancellation of a RUNNING run. A no-op from any terminal state.
    pub fn cancel(&self) -> Result<()> {
        self.canceller().cancel()
    }

    pub fn canceller(&self) -> Canceller {
        Canceller {
            gateway: Arc::clone(&self.session.gateway),
            operation: self.operation,
            status: Arc::clone(&self.status),
            wake: self.wake.clone(),
        }
    }

    /// Releases the run on the server, best effort, and moves to CLOSED.
    pub fn close(&mut self) {
        if self.status.get() == ExecutionStatus::Closed {
            return;
        }
        if !self.returned_as_direct_result {
            if let Err(err) = self.session.gateway.close_operation(&self.operation) {
                warn!("failed to close operation {}: {err}", self.query_id());
            }
        }
        self.status.advance(ExecutionStatus::Closed);
        self.descriptor = None;
        self.session.unregister(&self.query_id());
        debug!("closed {}", self.query_id());
    }

    /// `query_id:query_secret`, for [`Session::resume_serialized`](crate::Session::resume_serialized).
    pub fn serialize(&self) -> Result<String> {
        if self.status.get() == ExecutionStatus::Closed {
            return Err(Error::Closed);
        }
        Ok(format!("{}:{}", self.query_id(), self.query_secret()))
    }

    /// Releases the handle from its session without closing the run, so it can be resumed
    /// after the session is gone. Returns the serialized identifier.
    pub fn detach(self) -> Result<String> {
        let serialized = self.serialize()?;
        self.session.unregister(&self.query_id());
        debug!("detached {}", self.query_id());
        Ok(serialized)
    }
}

/// Parses the output of [`ExecutionHandle::serialize`].
pub(crate) fn parse_identifier(serialized: &str) -> Result<(Uuid, Uuid)> {
    let invalid = || Error::InvalidIdentifier(serialized.to_string());
    let (id, secret) = serialized.trim().split_once(':').ok_or_else(invalid)?;
    let id = Uuid::parse_str(id).map_err(|_| invalid())?;
    let secret = Uuid::parse_str(secret).map_err(|_| invalid())?;
    Ok((id, secret))
}
