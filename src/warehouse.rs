//! In-memory warehouse speaking the server side of the protocol.
//!
//! Results are registered per statement text. Small synchronous results come back directly
//! with the submission and are never stored; everything else becomes a run that is polled,
//! described and fetched. Large results are written to the staging directory as files in the
//! staged format and handed out as expiring `file://` links.
use std::{
    collections::{HashMap, VecDeque},
    env, fs,
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    cloudfetch::{codec, file_url},
    protocol::{
        DirectResult, ExecuteOptions, FileReference, OperationHandle, OperationState, Request,
        Response, ResponseError, ResultFormat, ResultMetadata, RowPayload, RowSet, ServerFailure,
        Transport, TransportError, lift_rejection,
    },
    types::{ColumnDescriptor, Row, RowBatch},
};

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// Status polls answered with RUNNING before a run finishes. With 0 a synchronous
    /// submission finishes immediately.
    pub polls_until_finished: u32,
    /// Largest result returned directly with a synchronous submission.
    pub direct_result_max_rows: u64,
    /// Rows per staged file, and per inline batch.
    pub rows_per_file: u64,
    pub link_ttl: Duration,
    pub staging_dir: PathBuf,
    /// Hand out links in descending offset order.
    pub reverse_links: bool,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            polls_until_finished: 0,
            direct_result_max_rows: 1_000,
            rows_per_file: 1_000,
            link_ttl: Duration::from_secs(15 * 60),
            staging_dir: env::temp_dir().join("sluice-staging"),
            reverse_links: false,
        }
    }
}

impl WarehouseConfig {
    pub fn with_polls_until_finished(mut self, polls: u32) -> Self {
        self.polls_until_finished = polls;
        self
    }

    pub fn with_direct_result_max_rows(mut self, rows: u64) -> Self {
        self.direct_result_max_rows = rows;
        self
    }

    pub fn with_rows_per_file(mut self, rows: u64) -> Self {
        self.rows_per_file = rows.max(1);
        self
    }

    pub fn with_link_ttl(mut self, ttl: Duration) -> Self {
        self.link_ttl = ttl;
        self
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub fn with_reverse_links(mut self, reverse: bool) -> Self {
        self.reverse_links = reverse;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub columns: Vec<ColumnDescriptor>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(columns: Vec<ColumnDescriptor>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }
}

#[derive(Debug)]
struct StagedFile {
    path: PathBuf,
    row_offset: i64,
    row_count: u64,
    byte_len: u64,
    checksum: u32,
}

#[derive(Debug)]
enum Stored {
    Inline,
    Staged { dir: PathBuf, files: Vec<StagedFile> },
}

#[derive(Debug)]
struct Run {
    secret: Uuid,
    state: OperationState,
    polls_left: u32,
    table: Option<Arc<Table>>,
    failure: Option<ServerFailure>,
    options: ExecuteOptions,
    stored: Option<Stored>,
    expired: bool,
}

impl Run {
    /// Failure detail is only visible once the run has actually failed.
    fn reported_failure(&self) -> Option<ServerFailure> {
        match self.state {
            OperationState::Failed => self.failure.clone(),
            _ => None,
        }
    }

    fn metadata(&self) -> ResultMetadata {
        let (columns, total) = match &self.table {
            Some(table) => (table.columns.clone(), table.rows.len() as i64),
            None => (Vec::new(), 0),
        };
        let staged = matches!(self.stored, Some(Stored::Staged { .. }));
        ResultMetadata {
            columns,
            total_row_count: total,
            format: if staged {
                ResultFormat::Staged
            } else {
                ResultFormat::Inline
            },
            compressed: staged && self.options.compression,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn err(code: ResponseError, description: impl Into<String>) -> Response {
    Response::Err {
        code,
        description: description.into(),
    }
}

pub struct Warehouse {
    config: WarehouseConfig,
    tables: Mutex<HashMap<String, Arc<Table>>>,
    failures: Mutex<HashMap<String, ServerFailure>>,
    runs: Mutex<HashMap<Uuid, Run>>,
    rejections: Mutex<VecDeque<Response>>,
}

impl Warehouse {
    pub fn new(config: WarehouseConfig) -> Self {
        Self {
            config,
            tables: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            rejections: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    /// Makes `statement` produce `table`.
    pub fn register(&self, statement: impl Into<String>, table: Table) {
        lock(&self.tables).insert(statement.into(), Arc::new(table));
    }

    /// Makes `statement` fail with the given server code and message.
    pub fn register_failure(
        &self,
        statement: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) {
        lock(&self.failures).insert(
            statement.into(),
            ServerFailure {
                code: code.into(),
                message: message.into(),
            },
        );
    }

    /// Answers the next request with a status signal instead of handling it.
    pub fn reject_next(&self, status: u16, retry_after: Option<Duration>, location: Option<String>) {
        lock(&self.rejections).push_back(Response::Rejected {
            status,
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
            location,
            message: format!("injected status {status}"),
        });
    }

    /// Forgets a run's results, as a server does once its retention window passes.
    pub fn expire(&self, query_id: Uuid) {
        if let Some(run) = lock(&self.runs).get_mut(&query_id) {
            run.expired = true;
            remove_staged(run.stored.take());
        }
    }

    pub fn run_state(&self, query_id: Uuid) -> Option<OperationState> {
        lock(&self.runs).get(&query_id).map(|run| run.state)
    }

    /// Runs the server still tracks (not closed).
    pub fn open_runs(&self) -> usize {
        lock(&self.runs)
            .values()
            .filter(|run| run.state != OperationState::Closed)
            .count()
    }

    pub fn handle(&self, request: Request) -> Response {
        if let Some(rejection) = lock(&self.rejections).pop_front() {
            debug!("rejecting {}", request.name());
            return rejection;
        }
        trace!("handling {}", request.name());

        match request {
            Request::Execute {
                statement, options, ..
            } => self.execute(&statement, options),
            Request::GetStatus { handle } => self.with_run(&handle, |run| {
                if run.state == OperationState::Running {
                    if run.polls_left == 0 {
                        self.finish(handle.query_id(), run);
                    } else {
                        run.polls_left -= 1;
                    }
                }
                Response::Status {
                    state: run.state,
                    failure: run.reported_failure(),
                }
            }),
            Request::GetMetadata { handle } => {
                self.with_finished(&handle, |run| Response::Metadata(run.metadata()))
            }
            Request::FetchResults {
                handle,
                start_row_offset,
                max_rows,
            } => self.with_finished(&handle, |run| {
                self.fetch(run, start_row_offset, max_rows.max(1))
            }),
            Request::Cancel { handle } => self.with_run(&handle, |run| {
                if matches!(run.state, OperationState::Pending | OperationState::Running) {
                    info!("canceling {}", handle.query_id());
                    run.state = OperationState::Canceled;
                }
                Response::Canceled
            }),
            Request::CloseOperation { handle } => self.with_run(&handle, |run| {
                run.state = OperationState::Closed;
                remove_staged(run.stored.take());
                debug!("closed {}", handle.query_id());
                Response::Closed
            }),
            Request::Ping => Response::Pong,
        }
    }

    fn execute(&self, statement: &str, options: ExecuteOptions) -> Response {
        let query_id = Uuid::new_v4();
        let secret = Uuid::new_v4();
        let handle = OperationHandle::new(query_id, secret);

        let table = lock(&self.tables).get(statement).cloned();
        let failure = lock(&self.failures).get(statement).cloned().or_else(|| {
            table.is_none().then(|| ServerFailure {
                code: "TABLE_OR_VIEW_NOT_FOUND".to_string(),
                message: format!("nothing registered for statement '{statement}'"),
            })
        });

        let mut run = Run {
            secret,
            state: OperationState::Running,
            polls_left: self.config.polls_until_finished,
            table,
            failure,
            options,
            stored: None,
            expired: false,
        };

        if !run.options.run_async && run.polls_left == 0 {
            self.finish(query_id, &mut run);
            if let Some(direct) = self.direct_result(&run) {
                debug!("{query_id} answered directly");
                return Response::Executed {
                    handle,
                    state: run.state,
                    failure: None,
                    direct: Some(direct),
                };
            }
        }

        let state = run.state;
        let failure = run.reported_failure();
        lock(&self.runs).insert(query_id, run);
        debug!("{query_id} accepted as {state:?}");
        Response::Executed {
            handle,
            state,
            failure,
            direct: None,
        }
    }

    fn direct_result(&self, run: &Run) -> Option<DirectResult> {
        let table = run.table.as_ref()?;
        let small = table.rows.len() as u64 <= self.config.direct_result_max_rows;
        if run.state != OperationState::Finished
            || !small
            || !matches!(run.stored, Some(Stored::Inline))
        {
            return None;
        }
        Some(DirectResult {
            metadata: run.metadata(),
            rows: RowSet {
                start_row_offset: 0,
                payload: RowPayload::Inline(self.batches(&table.rows)),
                has_more_rows: false,
            },
        })
    }

    /// Completes a running run: fails it or materializes its result.
    fn finish(&self, query_id: Uuid, run: &mut Run) {
        if run.failure.is_some() {
            run.state = OperationState::Failed;
            return;
        }
        let Some(table) = run.table.clone() else {
            run.state = OperationState::Failed;
            return;
        };

        match self.store(query_id, &table, &run.options) {
            Ok(stored) => {
                run.stored = Some(stored);
                run.state = OperationState::Finished;
            }
            Err(e) => {
                warn!("failed to stage result of {query_id}: {e}");
                run.failure = Some(ServerFailure {
                    code: "INTERNAL_ERROR".to_string(),
                    message: e.to_string(),
                });
                run.state = OperationState::Failed;
            }
        }
    }

    fn store(
        &self,
        query_id: Uuid,
        table: &Table,
        options: &ExecuteOptions,
    ) -> Result<Stored, Box<dyn std::error::Error>> {
        let rows = table.rows.len() as u64;
        let inline = !options.allow_staged
            || (rows <= options.max_inline_rows
                && codec::encode_file(&table.rows, false)?.len() as u64 <= options.max_inline_bytes);
        if inline {
            return Ok(Stored::Inline);
        }

        let dir = self.config.staging_dir.join(query_id.to_string());
        fs::create_dir_all(&dir)?;
        let mut files = Vec::new();
        let mut row_offset = 0;
        for (i, chunk) in table
            .rows
            .chunks(self.config.rows_per_file.max(1) as usize)
            .enumerate()
        {
            let bytes = codec::encode_file(chunk, options.compression)?;
            let path = dir.join(format!("part-{i:05}.bin"));
            fs::write(&path, &bytes)?;
            files.push(StagedFile {
                path,
                row_offset,
                row_count: chunk.len() as u64,
                byte_len: bytes.len() as u64,
                checksum: codec::checksum(&bytes),
            });
            row_offset += chunk.len() as i64;
        }
        info!("staged {rows} rows of {query_id} in {} files", files.len());
        Ok(Stored::Staged { dir, files })
    }

    fn batches(&self, rows: &[Row]) -> Vec<RowBatch> {
        rows.chunks(self.config.rows_per_file.max(1) as usize)
            .map(|chunk| RowBatch::new(chunk.to_vec()))
            .collect()
    }

    fn fetch(&self, run: &Run, start: i64, max_rows: u64) -> Response {
        let Some(table) = &run.table else {
            return err(ResponseError::Internal, "finished run without a result");
        };
        let total = table.rows.len() as i64;
        let start = start.clamp(0, total);

        match &run.stored {
            Some(Stored::Staged { files, .. }) => {
                let expires_at_ms = now_ms() + self.config.link_ttl.as_millis() as u64;
                let mut links = Vec::new();
                let mut rows = 0;
                for file in files
                    .iter()
                    .filter(|f| f.row_offset + f.row_count as i64 > start)
                {
                    if rows >= max_rows {
                        break;
                    }
                    rows += file.row_count;
                    links.push(FileReference {
                        url: file_url(&file.path, expires_at_ms),
                        row_offset: file.row_offset,
                        row_count: file.row_count,
                        byte_len: file.byte_len,
                        expires_at_ms,
                        checksum: Some(file.checksum),
                        encryption: None,
                    });
                }
                let end = links.last().map_or(start, FileReference::end_row_offset);
                if self.config.reverse_links {
                    links.reverse();
                }
                Response::Rows(RowSet {
                    start_row_offset: start,
                    payload: RowPayload::Links(links),
                    has_more_rows: end < total,
                })
            }
            _ => {
                let end = start
                    .saturating_add(max_rows.min(i64::MAX as u64) as i64)
                    .min(total);
                let page = &table.rows[start as usize..end as usize];
                Response::Rows(RowSet {
                    start_row_offset: start,
                    payload: RowPayload::Inline(self.batches(page)),
                    has_more_rows: end < total,
                })
            }
        }
    }

    fn with_run(&self, handle: &OperationHandle, f: impl FnOnce(&mut Run) -> Response) -> Response {
        let mut runs = lock(&self.runs);
        match runs.get_mut(&handle.query_id()) {
            Some(run) if run.secret != handle.query_secret() => {
                err(ResponseError::UnknownOperation, "query secret does not match")
            }
            Some(run) if run.expired => err(
                ResponseError::ExpiredOperation,
                format!("operation {} has expired", handle.query_id()),
            ),
            Some(run) => f(run),
            None => err(
                ResponseError::UnknownOperation,
                format!("no operation {}", handle.query_id()),
            ),
        }
    }

    fn with_finished(&self, handle: &OperationHandle, f: impl FnOnce(&Run) -> Response) -> Response {
        self.with_run(handle, |run| match run.state {
            OperationState::Finished => f(run),
            OperationState::Closed => err(
                ResponseError::ExpiredOperation,
                format!("operation {} is closed", handle.query_id()),
            ),
            state => err(
                ResponseError::InvalidRequest,
                format!("operation {} is {state:?}", handle.query_id()),
            ),
        })
    }
}

fn remove_staged(stored: Option<Stored>) {
    if let Some(Stored::Staged { dir, .. }) = stored {
        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!("failed to remove {}: {e}", dir.display());
        }
    }
}

/// In-process [`Transport`] straight into a [`Warehouse`]. Counts calls and can inject
/// connection-level faults.
pub struct LocalTransport {
    warehouse: Arc<Warehouse>,
    calls: AtomicUsize,
    faults: Mutex<VecDeque<TransportError>>,
}

impl LocalTransport {
    pub fn new(warehouse: Arc<Warehouse>) -> Self {
        Self {
            warehouse,
            calls: AtomicUsize::new(0),
            faults: Mutex::new(VecDeque::new()),
        }
    }

    /// Requests sent so far, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fails the next send with `fault` without reaching the warehouse.
    pub fn fail_next(&self, fault: TransportError) {
        lock(&self.faults).push_back(fault);
    }
}

impl Transport for LocalTransport {
    fn send(&self, endpoint: &str, request: &Request) -> Result<Response, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = lock(&self.faults).pop_front() {
            return Err(fault);
        }
        trace!("local send of {} to {endpoint}", request.name());
        lift_rejection(self.warehouse.handle(request.clone()))
    }
}
