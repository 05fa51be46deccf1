//! Row access for a finished operation.
//!
//! A [`ResultSet`] is a consume-once sequence of rows. Whether the rows arrived inline in RPC
//! responses or are being downloaded from staged files is decided when it is opened and is
//! invisible afterwards: `fetch_one`, `fetch_many` and `fetch_all` behave the same and always
//! yield rows in the server-declared order.
mod source;

use std::{collections::VecDeque, sync::Arc};

use log::debug;

use crate::{
    cloudfetch::{CloudFetchDownloader, DownloaderOptions},
    error::{Error, Result},
    execution::{ExecutionHandle, ExecutionStatus, StatusCell},
    protocol::{
        DirectResult, OperationHandle, ResultFormat, ResultMetadata, RowPayload, RowSet,
    },
    session::SessionInner,
    types::{ColumnDescriptor, Row},
};

use source::{InlinePager, InlineSource, OperationLinks, RowSource};

/// Shape of a result plus its first page of rows or links.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultDescriptor {
    pub columns: Vec<ColumnDescriptor>,
    /// -1 when unknown.
    pub total_row_count: i64,
    pub compressed: bool,
    pub rows: RowSet,
}

impl ResultDescriptor {
    pub fn new(metadata: ResultMetadata, rows: RowSet) -> Self {
        Self {
            columns: metadata.columns,
            total_row_count: metadata.total_row_count,
            compressed: metadata.compressed,
            rows,
        }
    }

    pub fn delivery(&self) -> ResultFormat {
        match self.rows.payload {
            RowPayload::Inline(_) => ResultFormat::Inline,
            RowPayload::Links(_) => ResultFormat::Staged,
        }
    }
}

impl From<DirectResult> for ResultDescriptor {
    fn from(direct: DirectResult) -> Self {
        Self::new(direct.metadata, direct.rows)
    }
}

pub struct ResultSet {
    columns: Vec<ColumnDescriptor>,
    total_row_count: i64,
    source: RowSource,
    buffer: VecDeque<Row>,
    status: Option<Arc<StatusCell>>,
    exhausted: bool,
    errored: bool,
    closed: bool,
    /// Set when the result set is the only thing the caller holds of its operation.
    owner: Option<ExecutionHandle>,
}

impl std::fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("columns", &self.columns)
            .field("total_row_count", &self.total_row_count)
            .field("buffered", &self.buffer.len())
            .field("exhausted", &self.exhausted)
            .field("errored", &self.errored)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ResultSet {
    pub(crate) fn open(
        descriptor: ResultDescriptor,
        session: &SessionInner,
        handle: OperationHandle,
        status: Arc<StatusCell>,
        direct: bool,
    ) -> Result<Self> {
        let config = &session.config;
        let format = descriptor.delivery();
        let rows = descriptor.rows;

        let source = match rows.payload {
            RowPayload::Inline(batches) => {
                let pager = (!direct).then(|| InlinePager {
                    gateway: Arc::clone(&session.gateway),
                    handle,
                    page_rows: config.fetch_page_rows,
                });
                RowSource::Inline(InlineSource::new(
                    batches,
                    rows.start_row_offset,
                    rows.has_more_rows,
                    pager,
                ))
            }
            RowPayload::Links(links) => {
                let resolver = Arc::new(OperationLinks {
                    gateway: Arc::clone(&session.gateway),
                    handle,
                    page_rows: config.cloudfetch.link_page_rows,
                });
                RowSource::Staged(CloudFetchDownloader::new(
                    links,
                    rows.start_row_offset,
                    rows.has_more_rows,
                    Arc::clone(&session.fetcher),
                    resolver,
                    session.gateway.policy().clone(),
                    DownloaderOptions::from_config(&config.cloudfetch, descriptor.compressed),
                )?)
            }
        };
        debug!(
            "opened {format:?} result for {} ({} columns, {} rows)",
            handle.query_id(),
            descriptor.columns.len(),
            descriptor.total_row_count
        );

        Ok(Self::from_source(
            descriptor.columns,
            descriptor.total_row_count,
            source,
            Some(status),
        ))
    }

    fn from_source(
        columns: Vec<ColumnDescriptor>,
        total_row_count: i64,
        source: RowSource,
        status: Option<Arc<StatusCell>>,
    ) -> Self {
        Self {
            columns,
            total_row_count,
            source,
            buffer: VecDeque::new(),
            status,
            exhausted: false,
            errored: false,
            closed: false,
            owner: None,
        }
    }

    pub(crate) fn set_owner(&mut self, handle: ExecutionHandle) {
        self.owner = Some(handle);
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// Total rows in the result, when the server declared it.
    pub fn total_row_count(&self) -> Option<u64> {
        u64::try_from(self.total_row_count).ok()
    }

    fn check(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        match self.status.as_ref().map(|s| s.get()) {
            Some(ExecutionStatus::Closed) => Err(Error::Closed),
            Some(ExecutionStatus::Canceled) => Err(Error::Cancellation),
            _ => Ok(()),
        }
    }

    /// Makes sure the buffer holds at least one row unless the result is exhausted.
    fn fill(&mut self) -> Result<()> {
        while self.buffer.is_empty() && !self.exhausted {
            match self.source.next_batch()? {
                Some(batch) => self.buffer.extend(batch.rows),
                None => self.exhausted = true,
            }
        }
        Ok(())
    }

    pub fn fetch_one(&mut self) -> Result<Option<Row>> {
        self.check()?;
        self.fill()?;
        Ok(self.buffer.pop_front())
    }

    /// Returns up to `n` rows; fewer only when the result is exhausted.
    pub fn fetch_many(&mut self, n: usize) -> Result<Vec<Row>> {
        self.check()?;
        let mut rows = Vec::with_capacity(n.min(1024));
        while rows.len() < n {
            self.fill()?;
            if self.buffer.is_empty() {
                break;
            }
            let take = (n - rows.len()).min(self.buffer.len());
            rows.extend(self.buffer.drain(..take));
        }
        Ok(rows)
    }

    pub fn fetch_all(&mut self) -> Result<Vec<Row>> {
        self.check()?;
        let mut rows = Vec::new();
        loop {
            self.fill()?;
            if self.buffer.is_empty() {
                return Ok(rows);
            }
            rows.extend(self.buffer.drain(..));
        }
    }

    /// Stops any downloads, drops buffered rows and closes the owned operation, if any.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.buffer.clear();
        self.source.close();
        if let Some(mut owner) = self.owner.take() {
            owner.close();
        }
    }
}

impl Iterator for ResultSet {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.errored {
            return None;
        }
        match self.fetch_one() {
            Ok(row) => row.map(Ok),
            Err(err) => {
                self.errored = true;
                Some(Err(err))
            }
        }
    }
}

impl Drop for ResultSet {
    fn drop(&mut self) {
        self.close();
    }
}
