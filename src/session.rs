//! Owner of execution handles.
//!
//! A session tracks every operation it started or resumed. Closing it (explicitly or by
//! dropping it) releases the operations still open on the server and moves every handle to
//! CLOSED, so nothing outlives the session that created it.
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    cloudfetch::{FileFetcher, LocalFileFetcher},
    config::ClientConfig,
    error::{Error, Result},
    execution::{ExecutionHandle, ExecutionStatus, StatusCell, parse_identifier},
    gateway::RpcGateway,
    protocol::{OperationHandle, TcpTransport, Transport},
    result::{ResultDescriptor, ResultSet},
    retry::RetryPolicy,
    types::Parameter,
};

struct Registered {
    operation: OperationHandle,
    status: Arc<StatusCell>,
    direct: bool,
}

pub(crate) struct SessionInner {
    pub(crate) gateway: Arc<RpcGateway>,
    pub(crate) fetcher: Arc<dyn FileFetcher>,
    pub(crate) config: ClientConfig,
    handles: Mutex<HashMap<Uuid, Registered>>,
    closed: AtomicBool,
}

impl SessionInner {
    fn register(&self, operation: OperationHandle, status: &Arc<StatusCell>, direct: bool) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                operation.query_id(),
                Registered {
                    operation,
                    status: Arc::clone(status),
                    direct,
                },
            );
    }

    pub(crate) fn unregister(&self, query_id: &Uuid) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(query_id);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Session over `transport`, reading staged files from `file://` links.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let policy = RetryPolicy::new(config.retry.clone());
        Self::with_parts(transport, Arc::new(LocalFileFetcher), policy, config)
    }

    pub fn with_parts(
        transport: Arc<dyn Transport>,
        fetcher: Arc<dyn FileFetcher>,
        policy: RetryPolicy,
        config: ClientConfig,
    ) -> Self {
        let gateway = RpcGateway::new(transport, config.endpoint.clone(), policy);
        Self {
            inner: Arc::new(SessionInner {
                gateway: Arc::new(gateway),
                fetcher,
                config,
                handles: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Session over [`TcpTransport`] to `config.endpoint`.
    pub fn connect_tcp(config: ClientConfig) -> Self {
        Self::new(Arc::new(TcpTransport::default()), config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Number of handles still owned by this session.
    pub fn open_handles(&self) -> usize {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Submits a rendered statement with its bound parameters.
    pub fn execute(&self, statement: &str, parameters: &[Parameter]) -> Result<ExecutionHandle> {
        self.inner.ensure_open()?;
        trace!("executing {statement:?} with {parameters:?}");

        let options = self.inner.config.execute_options();
        let submitted = self.inner.gateway.submit(statement, parameters, options)?;

        let descriptor = submitted.direct.map(ResultDescriptor::from);
        let status = if descriptor.is_some() {
            ExecutionStatus::Finished
        } else {
            submitted.state.into()
        };
        let status = Arc::new(StatusCell::new(status));
        let direct = descriptor.is_some();

        self.inner.register(submitted.handle, &status, direct);
        debug!(
            "{} started as {}{}",
            submitted.handle.query_id(),
            status.get(),
            if direct { " (direct result)" } else { "" }
        );
        Ok(ExecutionHandle::new(
            Arc::clone(&self.inner),
            submitted.handle,
            status,
            submitted.failure,
            descriptor,
        ))
    }

    /// Submits a statement and opens its rows. The returned result set owns the operation
    /// and closes it when closed or dropped.
    pub fn query(&self, statement: &str, parameters: &[Parameter]) -> Result<ResultSet> {
        let mut handle = self.execute(statement, parameters)?;
        match handle.get_results() {
            Ok(mut results) => {
                results.set_owner(handle);
                Ok(results)
            }
            Err(err) => {
                handle.close();
                Err(err)
            }
        }
    }

    /// Rebuilds a handle for a run started elsewhere.
    ///
    /// The run's status is fetched right away, so unknown, expired and direct-result runs
    /// fail here with [`Error::UnrecoverableResult`].
    pub fn resume(&self, query_id: Uuid, query_secret: Uuid) -> Result<ExecutionHandle> {
        self.inner.ensure_open()?;

        let operation = OperationHandle::new(query_id, query_secret);
        let status = Arc::new(StatusCell::new(ExecutionStatus::Running));
        let mut handle = ExecutionHandle::new(
            Arc::clone(&self.inner),
            operation,
            Arc::clone(&status),
            None,
            None,
        );
        let current = handle.sync_status()?;

        self.inner.register(operation, &status, false);
        info!("resumed {query_id} as {current}");
        Ok(handle)
    }

    /// Like [`Session::resume`], taking the output of [`ExecutionHandle::serialize`].
    pub fn resume_serialized(&self, serialized: &str) -> Result<ExecutionHandle> {
        let (query_id, query_secret) = parse_identifier(serialized)?;
        self.resume(query_id, query_secret)
    }

    /// Closes every operation this session still owns. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let handles: Vec<Registered> = self
            .inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, registered)| registered)
            .collect();

        let count = handles.len();
        for registered in handles {
            let query_id = registered.operation.query_id();
            let open = registered.status.get() != ExecutionStatus::Closed;
            if open && !registered.direct {
                if let Err(err) = self.inner.gateway.close_operation(&registered.operation) {
                    warn!("failed to close operation {query_id}: {err}");
                }
            }
            registered.status.advance(ExecutionStatus::Closed);
        }
        info!("session closed, released {count} operations");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
