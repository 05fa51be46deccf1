use std::{collections::VecDeque, sync::Arc};

use log::{debug, warn};

use crate::{
    cloudfetch::{CloudFetchDownloader, LinkResolver},
    error::{Error, Result},
    gateway::RpcGateway,
    protocol::{FileReference, OperationHandle, RowPayload},
    types::RowBatch,
};

/// Pages further inline batches from the server.
pub(crate) struct InlinePager {
    pub gateway: Arc<RpcGateway>,
    pub handle: OperationHandle,
    pub page_rows: u64,
}

pub(crate) struct InlineSource {
    batches: VecDeque<RowBatch>,
    next_offset: i64,
    has_more: bool,
    pager: Option<InlinePager>,
}

impl InlineSource {
    pub fn new(
        batches: Vec<RowBatch>,
        start_row_offset: i64,
        has_more: bool,
        pager: Option<InlinePager>,
    ) -> Self {
        let rows: usize = batches.iter().map(RowBatch::len).sum();
        Self {
            batches: batches.into(),
            next_offset: start_row_offset + rows as i64,
            has_more: has_more && pager.is_some(),
            pager,
        }
    }

    fn fetch_page(&mut self) -> Result<()> {
        let Some(pager) = &self.pager else {
            self.has_more = false;
            return Ok(());
        };

        let page = pager
            .gateway
            .fetch_results(&pager.handle, self.next_offset, pager.page_rows)?;
        if page.start_row_offset != self.next_offset {
            return Err(Error::integrity(
                self.next_offset,
                format!("server returned rows from offset {}", page.start_row_offset),
            ));
        }
        let batches = match page.payload {
            RowPayload::Inline(batches) => batches,
            RowPayload::Links(_) => {
                return Err(Error::Protocol {
                    request: "FetchResults",
                    detail: "links in an inline result".to_string(),
                });
            }
        };

        let rows: usize = batches.iter().map(RowBatch::len).sum();
        debug!("fetched {rows} inline rows from offset {}", self.next_offset);
        if rows == 0 && page.has_more_rows {
            warn!(
                "server reported more rows after offset {} but sent none",
                self.next_offset
            );
        }
        self.next_offset += rows as i64;
        self.has_more = page.has_more_rows && rows > 0;
        self.batches.extend(batches);
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        loop {
            if let Some(batch) = self.batches.pop_front() {
                return Ok(Some(batch));
            }
            if !self.has_more {
                return Ok(None);
            }
            self.fetch_page()?;
        }
    }
}

/// The two ways rows reach the client, chosen once when the result is opened.
pub(crate) enum RowSource {
    Inline(InlineSource),
    Staged(CloudFetchDownloader),
}

impl RowSource {
    pub fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        match self {
            RowSource::Inline(source) => source.next_batch(),
            RowSource::Staged(downloader) => downloader.next_batch(),
        }
    }

    pub fn close(&mut self) {
        match self {
            RowSource::Inline(source) => {
                source.batches.clear();
                source.has_more = false;
            }
            RowSource::Staged(downloader) => downloader.close(),
        }
    }
}

/// Resolves links of one finished operation through `FetchResults`.
pub(crate) struct OperationLinks {
    pub gateway: Arc<RpcGateway>,
    pub handle: OperationHandle,
    pub page_rows: u64,
}

impl LinkResolver for OperationLinks {
    fn fetch_links(&self, start_row_offset: i64) -> Result<(Vec<FileReference>, bool)> {
        let page = self
            .gateway
            .fetch_results(&self.handle, start_row_offset, self.page_rows)?;
        match page.payload {
            RowPayload::Links(links) => Ok((links, page.has_more_rows)),
            RowPayload::Inline(_) => Err(Error::Protocol {
                request: "FetchResults",
                detail: "inline rows in a staged result".to_string(),
            }),
        }
    }
}
