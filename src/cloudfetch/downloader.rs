use std::{
    collections::BTreeMap,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use log::{debug, info, trace, warn};

use crate::{
    error::{Error, Result},
    protocol::{FileReference, TransportError},
    retry::{CancelToken, Idempotency, RetryDecision, RetryPolicy},
    thread::ThreadPool,
    types::RowBatch,
};

use super::{DownloaderOptions, FileFetcher, LinkResolver, codec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// One staged file and where it is in its download.
#[derive(Debug)]
pub struct DownloadTask {
    pub reference: FileReference,
    pub state: TaskState,
    batch: Option<RowBatch>,
}

#[derive(Debug, Default)]
struct State {
    /// Keyed by `row_offset`; the consumer always takes the first entry.
    tasks: BTreeMap<i64, DownloadTask>,
    in_flight: usize,
    ready: usize,
    failure: Option<Error>,
    closed: bool,
}

impl State {
    fn has_pending(&self) -> bool {
        self.tasks.values().any(|t| t.state == TaskState::Pending)
    }
}

struct Shared {
    state: Mutex<State>,
    /// Workers wait here for work or buffer space.
    work: Condvar,
    /// The consumer waits here for completions.
    done: Condvar,
    cancel: CancelToken,
    policy: RetryPolicy,
    fetcher: Arc<dyn FileFetcher>,
    resolver: Arc<dyn LinkResolver>,
    options: DownloaderOptions,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Materializes staged results with a bounded pool of download workers.
///
/// Batches are handed out strictly by ascending `row_offset` no matter which download
/// finishes first. Workers stop starting new downloads once
/// [`DownloaderOptions::max_buffered_batches`] completed batches are waiting for the
/// consumer. Link pages are requested by the consuming thread when the queue runs dry.
pub struct CloudFetchDownloader {
    shared: Arc<Shared>,
    pool: Option<ThreadPool>,
    next_offset: i64,
    next_link_offset: i64,
    links_exhausted: bool,
}

impl CloudFetchDownloader {
    pub fn new(
        links: Vec<FileReference>,
        start_row_offset: i64,
        has_more_links: bool,
        fetcher: Arc<dyn FileFetcher>,
        resolver: Arc<dyn LinkResolver>,
        policy: RetryPolicy,
        options: DownloaderOptions,
    ) -> Result<Self> {
        let threads = options.max_download_threads.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            work: Condvar::new(),
            done: Condvar::new(),
            cancel: CancelToken::new(),
            policy,
            fetcher,
            resolver,
            options,
        });

        let mut downloader = Self {
            shared: Arc::clone(&shared),
            pool: None,
            next_offset: start_row_offset,
            next_link_offset: start_row_offset,
            links_exhausted: !has_more_links,
        };
        downloader.enqueue(links);

        let pool =
            ThreadPool::new("cloudfetch", threads).map_err(|e| Error::WorkerPool(Box::new(e)))?;
        for _ in 0..threads {
            let shared = Arc::clone(&shared);
            pool.execute(move || worker_loop(&shared))
                .map_err(|e| Error::WorkerPool(Box::new(e)))?;
        }
        downloader.pool = Some(pool);

        debug!(
            "cloudfetch started at offset {start_row_offset} with {threads} workers, more links: {has_more_links}"
        );
        Ok(downloader)
    }

    fn enqueue(&mut self, links: Vec<FileReference>) {
        let mut state = self.shared.lock();
        for link in links {
            if link.row_count == 0 {
                continue;
            }
            self.next_link_offset = self.next_link_offset.max(link.end_row_offset());
            state.tasks.entry(link.row_offset).or_insert(DownloadTask {
                reference: link,
                state: TaskState::Pending,
                batch: None,
            });
        }
        drop(state);
        self.shared.work.notify_all();
    }

    fn fetch_more_links(&mut self) -> Result<()> {
        let (links, has_more) = self.shared.resolver.fetch_links(self.next_link_offset)?;
        debug!(
            "fetched {} links from offset {}, more: {has_more}",
            links.len(),
            self.next_link_offset
        );
        if links.is_empty() && has_more {
            warn!(
                "server reported more rows after offset {} but returned no links",
                self.next_link_offset
            );
        }
        self.links_exhausted = !has_more || links.is_empty();
        self.enqueue(links);
        Ok(())
    }

    /// Row offset of the next batch the consumer will receive.
    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    /// Blocks until the batch at the next offset is available.
    ///
    /// Returns `Ok(None)` once every declared file has been consumed.
    pub fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        loop {
            let mut state = self.shared.lock();
            if let Some(err) = state.failure.take() {
                drop(state);
                self.close();
                return Err(err);
            }
            if state.closed {
                return Err(Error::Closed);
            }

            let head = state
                .tasks
                .first_key_value()
                .map(|(offset, task)| (*offset, task.state));
            match head {
                Some((offset, TaskState::Done)) if offset == self.next_offset => {
                    let task = state.tasks.remove(&offset).map(|t| (t.reference, t.batch));
                    state.ready -= 1;
                    drop(state);
                    self.shared.work.notify_all();

                    if let Some((reference, Some(batch))) = task {
                        trace!("releasing batch at offset {offset} ({} rows)", batch.len());
                        self.next_offset = reference.end_row_offset();
                        return Ok(Some(batch));
                    }
                    continue;
                }
                Some((offset, _)) if offset != self.next_offset => {
                    drop(state);
                    self.close();
                    return Err(Error::integrity(
                        self.next_offset,
                        format!("next staged file starts at offset {offset}"),
                    ));
                }
                None if self.links_exhausted => return Ok(None),
                _ => {}
            }

            if !state.has_pending() && !self.links_exhausted {
                drop(state);
                self.fetch_more_links()?;
                continue;
            }

            trace!(
                "waiting for offset {} ({} downloads in flight, {} ready)",
                self.next_offset, state.in_flight, state.ready
            );
            drop(
                self.shared
                    .done
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            );
        }
    }

    /// Stops all downloads without waiting for in-flight ones and drops buffered batches.
    pub fn close(&mut self) {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.tasks.clear();
            state.ready = 0;
        }
        self.shared.cancel.cancel();
        self.shared.work.notify_all();
        self.shared.done.notify_all();
        if let Some(pool) = self.pool.take() {
            pool.detach();
        }
        debug!("cloudfetch closed at offset {}", self.next_offset);
    }

    #[cfg(test)]
    fn task_states(&self) -> Vec<(i64, TaskState)> {
        self.shared
            .lock()
            .tasks
            .iter()
            .map(|(o, t)| (*o, t.state))
            .collect()
    }
}

impl Drop for CloudFetchDownloader {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let (offset, reference) = {
            let mut guard = shared.lock();
            loop {
                if guard.closed {
                    return;
                }
                let state = &mut *guard;
                if state.ready < shared.options.max_buffered_batches.max(1) {
                    let next = state
                        .tasks
                        .iter_mut()
                        .find(|(_, t)| t.state == TaskState::Pending);
                    if let Some((offset, task)) = next {
                        task.state = TaskState::InFlight;
                        let picked = (*offset, task.reference.clone());
                        state.in_flight += 1;
                        break picked;
                    }
                }
                guard = shared
                    .work
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        debug!("downloading file at offset {offset}");
        let result = download(shared, reference);

        let mut state = shared.lock();
        state.in_flight -= 1;
        if state.closed {
            return;
        }
        match result {
            Ok(batch) => {
                if let Some(task) = state.tasks.get_mut(&offset) {
                    trace!("file at offset {offset} done ({} rows)", batch.len());
                    task.state = TaskState::Done;
                    task.batch = Some(batch);
                    state.ready += 1;
                }
            }
            Err(Error::Cancellation) => return,
            Err(err) => {
                warn!("download of file at offset {offset} failed: {err}");
                if let Some(task) = state.tasks.get_mut(&offset) {
                    task.state = TaskState::Failed;
                }
                if state.failure.is_none() {
                    state.failure = Some(err);
                }
                shared.cancel.cancel();
            }
        }
        drop(state);
        shared.done.notify_all();
    }
}

/// Fetches one file, re-resolving its link on expiry and retrying transient failures.
fn download(shared: &Shared, mut reference: FileReference) -> Result<RowBatch> {
    let policy = &shared.policy;
    let mut retry = policy.begin();
    let mut refreshes = 0u32;

    loop {
        if shared.cancel.is_cancelled() {
            return Err(Error::Cancellation);
        }
        retry.attempts += 1;

        let fetched = if reference.is_expired(shared.options.link_expiry_buffer) {
            Err(TransportError::LinkExpired {
                url: reference.url.clone(),
            })
        } else {
            shared.fetcher.fetch(&reference)
        };

        match fetched {
            Ok(bytes) => {
                return codec::decode_file(
                    &reference,
                    bytes,
                    shared.options.compressed,
                    shared.options.decryptor.as_deref(),
                );
            }
            Err(err @ TransportError::LinkExpired { .. }) => {
                if retry.attempts >= policy.config().max_attempts {
                    return Err(Error::RetriesExhausted {
                        attempts: retry.attempts,
                        elapsed: retry.elapsed(),
                        source: err,
                    });
                }
                if refreshes > 0 {
                    let Some(delay) = policy.backoff(&mut retry) else {
                        return Err(Error::RetriesExhausted {
                            attempts: retry.attempts,
                            elapsed: retry.elapsed(),
                            source: err,
                        });
                    };
                    debug!(
                        "fresh link for offset {} expired again, waiting {delay:?}",
                        reference.row_offset
                    );
                    if !policy.pause(delay, &shared.cancel) {
                        return Err(Error::Cancellation);
                    }
                }
                refreshes += 1;
                info!(
                    "link for file at offset {} expired, re-resolving",
                    reference.row_offset
                );
                reference = shared.resolver.refresh(&reference)?;
            }
            Err(err) => match policy.on_failure(&mut retry, Idempotency::Idempotent, err) {
                RetryDecision::RetryAfter(delay) => {
                    debug!(
                        "download at offset {} failed ({:?}), retrying in {delay:?}",
                        reference.row_offset, retry.last_failure
                    );
                    if !policy.pause(delay, &shared.cancel) {
                        return Err(Error::Cancellation);
                    }
                }
                RetryDecision::Redirect(location) => {
                    retry.attempts -= 1;
                    reference.url = location;
                }
                RetryDecision::GiveUp(err) => return Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{
        config::RetryConfig, retry::tests::RecordingSleeper, thread::PoolShutdown, types::Value,
    };

    fn link(row_offset: i64, row_count: u64, generation: u32) -> FileReference {
        FileReference {
            url: format!("mem://{row_offset}/{generation}"),
            row_offset,
            row_count,
            byte_len: 0,
            expires_at_ms: 0,
            checksum: None,
            encryption: None,
        }
    }

    fn payload(row_offset: i64, row_count: u64) -> Vec<u8> {
        let rows: Vec<_> = (0..row_count as i64)
            .map(|i| vec![Value::Int(row_offset + i)])
            .collect();
        codec::encode_file(&rows, false).unwrap()
    }

    /// Serves generated payloads with per-offset delays and scripted failures.
    #[derive(Default)]
    struct FakeFetcher {
        delays: HashMap<i64, Duration>,
        /// Failures to return (in order) before succeeding, per offset.
        failures: Mutex<HashMap<i64, Vec<TransportError>>>,
        /// Overrides the served row count, per offset.
        short: HashMap<i64, u64>,
        completed: Mutex<Vec<i64>>,
        urls: Mutex<Vec<String>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FileFetcher for FakeFetcher {
        fn fetch(&self, reference: &FileReference) -> std::result::Result<Vec<u8>, TransportError> {
            let offset = reference.row_offset;
            self.urls.lock().unwrap().push(reference.url.clone());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.delays.get(&offset) {
                thread::sleep(*delay);
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            if let Some(failures) = self.failures.lock().unwrap().get_mut(&offset) {
                if !failures.is_empty() {
                    return Err(failures.remove(0));
                }
            }
            self.completed.lock().unwrap().push(offset);
            let count = self.short.get(&offset).copied().unwrap_or(reference.row_count);
            Ok(payload(offset, count))
        }
    }

    /// Hands out pages of links and fresh links on refresh.
    #[derive(Default)]
    struct FakeResolver {
        /// Refreshed links are already expired.
        stale: bool,
        pages: Mutex<Vec<(Vec<FileReference>, bool)>>,
        refreshed: Mutex<Vec<i64>>,
        requested: Mutex<Vec<i64>>,
    }

    impl LinkResolver for FakeResolver {
        fn fetch_links(&self, start_row_offset: i64) -> Result<(Vec<FileReference>, bool)> {
            self.requested.lock().unwrap().push(start_row_offset);
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                return Ok((vec![], false));
            }
            Ok(pages.remove(0))
        }

        fn refresh(&self, stale: &FileReference) -> Result<FileReference> {
            self.refreshed.lock().unwrap().push(stale.row_offset);
            let mut fresh = link(stale.row_offset, stale.row_count, 1);
            if self.stale {
                fresh.expires_at_ms = 1;
            }
            Ok(fresh)
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::default()
                .with_delay_min(Duration::from_millis(1))
                .with_delay_max(Duration::from_millis(5))
                .with_max_attempts(5),
        )
    }

    fn options(threads: usize, buffered: usize) -> DownloaderOptions {
        DownloaderOptions {
            max_download_threads: threads,
            max_buffered_batches: buffered,
            ..DownloaderOptions::default()
        }
    }

    fn drain(downloader: &mut CloudFetchDownloader) -> Result<Vec<i64>> {
        let mut seen = Vec::new();
        while let Some(batch) = downloader.next_batch()? {
            for row in batch.rows {
                match row[0] {
                    Value::Int(i) => seen.push(i),
                    _ => unreachable!(),
                }
            }
        }
        Ok(seen)
    }

    #[test]
    fn releases_batches_by_offset_not_arrival() {
        let fetcher = Arc::new(FakeFetcher {
            delays: HashMap::from([
                (0, Duration::from_millis(150)),
                (1, Duration::from_millis(10)),
                (2, Duration::from_millis(60)),
            ]),
            ..FakeFetcher::default()
        });
        let mut downloader = CloudFetchDownloader::new(
            vec![link(2, 1, 0), link(0, 1, 0), link(1, 1, 0)],
            0,
            false,
            fetcher.clone(),
            Arc::new(FakeResolver::default()),
            policy(),
            options(3, 4),
        )
        .unwrap();

        let seen = drain(&mut downloader).unwrap();

        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(*fetcher.completed.lock().unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn pages_in_more_links() {
        let resolver = Arc::new(FakeResolver::default());
        resolver
            .pages
            .lock()
            .unwrap()
            .extend([(vec![link(10, 5, 0), link(15, 5, 0)], true), (vec![link(20, 3, 0)], false)]);
        let mut downloader = CloudFetchDownloader::new(
            vec![link(0, 10, 0)],
            0,
            true,
            Arc::new(FakeFetcher::default()),
            resolver.clone(),
            policy(),
            options(2, 2),
        )
        .unwrap();

        let seen = drain(&mut downloader).unwrap();

        assert_eq!(seen, (0..23).collect::<Vec<_>>());
        assert_eq!(*resolver.requested.lock().unwrap(), vec![10, 20]);
    }

    #[test]
    fn expired_link_is_re_resolved() {
        let fetcher = Arc::new(FakeFetcher {
            failures: Mutex::new(HashMap::from([(
                1,
                vec![TransportError::LinkExpired {
                    url: "mem://1/0".into(),
                }],
            )])),
            ..FakeFetcher::default()
        });
        let resolver = Arc::new(FakeResolver::default());
        let mut downloader = CloudFetchDownloader::new(
            vec![link(0, 1, 0), link(1, 1, 0), link(2, 1, 0)],
            0,
            false,
            fetcher.clone(),
            resolver.clone(),
            policy(),
            options(2, 4),
        )
        .unwrap();

        let seen = drain(&mut downloader).unwrap();

        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(*resolver.refreshed.lock().unwrap(), vec![1]);
        assert!(fetcher.urls.lock().unwrap().contains(&"mem://1/1".to_string()));
    }

    #[test]
    fn link_expired_before_use_is_refreshed_without_fetching() {
        let fetcher = Arc::new(FakeFetcher::default());
        let resolver = Arc::new(FakeResolver::default());
        let mut stale = link(0, 2, 0);
        stale.expires_at_ms = 1;
        let mut downloader = CloudFetchDownloader::new(
            vec![stale],
            0,
            false,
            fetcher.clone(),
            resolver.clone(),
            policy(),
            options(1, 1),
        )
        .unwrap();

        assert_eq!(drain(&mut downloader).unwrap(), vec![0, 1]);
        assert_eq!(*fetcher.urls.lock().unwrap(), vec!["mem://0/1".to_string()]);
    }

    #[test]
    fn repeatedly_expired_links_back_off() {
        let fetcher = Arc::new(FakeFetcher::default());
        let resolver = Arc::new(FakeResolver {
            stale: true,
            ..FakeResolver::default()
        });
        let sleeper = Arc::new(RecordingSleeper::default());
        let policy = RetryPolicy::with_sleeper(
            RetryConfig::default()
                .with_delay_min(Duration::from_millis(50))
                .with_delay_max(Duration::from_millis(400))
                .with_max_attempts(6),
            sleeper.clone(),
        );
        let mut stale = link(0, 2, 0);
        stale.expires_at_ms = 1;
        let mut downloader = CloudFetchDownloader::new(
            vec![stale],
            0,
            false,
            fetcher.clone(),
            resolver.clone(),
            policy,
            options(1, 1),
        )
        .unwrap();

        let err = drain(&mut downloader).unwrap_err();

        assert!(matches!(err, Error::RetriesExhausted { attempts: 6, .. }));
        assert_eq!(resolver.refreshed.lock().unwrap().len(), 5);
        assert!(fetcher.urls.lock().unwrap().is_empty());
        let delays = sleeper.delays.lock().unwrap();
        assert_eq!(delays.len(), 4);
        assert!(delays[0] >= Duration::from_millis(50));
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "delays shrank: {delays:?}");
        }
    }

    #[test]
    fn expiry_stops_at_elapsed_budget() {
        let resolver = Arc::new(FakeResolver {
            stale: true,
            ..FakeResolver::default()
        });
        let sleeper = Arc::new(RecordingSleeper::default());
        let policy = RetryPolicy::with_sleeper(
            RetryConfig::default()
                .with_delay_min(Duration::from_secs(10))
                .with_max_duration(Duration::from_secs(1)),
            sleeper.clone(),
        );
        let mut stale = link(0, 2, 0);
        stale.expires_at_ms = 1;
        let mut downloader = CloudFetchDownloader::new(
            vec![stale],
            0,
            false,
            Arc::new(FakeFetcher::default()),
            resolver.clone(),
            policy,
            options(1, 1),
        )
        .unwrap();

        let err = drain(&mut downloader).unwrap_err();

        assert!(matches!(err, Error::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(resolver.refreshed.lock().unwrap().len(), 1);
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[test]
    fn worker_pool_failure_keeps_its_source() {
        let err = Error::WorkerPool(Box::new(PoolShutdown("cloudfetch".into())));

        let source = std::error::Error::source(&err).unwrap();
        assert!(source.downcast_ref::<PoolShutdown>().is_some());
        assert!(err.to_string().contains("cloudfetch"));
    }

    #[test]
    fn transient_failures_are_retried() {
        let unavailable = || TransportError::Status {
            status: 503,
            retry_after: None,
            message: "busy".into(),
        };
        let fetcher = Arc::new(FakeFetcher {
            failures: Mutex::new(HashMap::from([(0, vec![unavailable(), unavailable()])])),
            ..FakeFetcher::default()
        });
        let mut downloader = CloudFetchDownloader::new(
            vec![link(0, 3, 0)],
            0,
            false,
            fetcher.clone(),
            Arc::new(FakeResolver::default()),
            policy(),
            options(1, 1),
        )
        .unwrap();

        assert_eq!(drain(&mut downloader).unwrap(), vec![0, 1, 2]);
        assert_eq!(fetcher.urls.lock().unwrap().len(), 3);
    }

    #[test]
    fn row_count_mismatch_is_fatal() {
        let fetcher = Arc::new(FakeFetcher {
            short: HashMap::from([(4, 3)]),
            ..FakeFetcher::default()
        });
        let mut downloader = CloudFetchDownloader::new(
            vec![link(0, 4, 0), link(4, 4, 0)],
            0,
            false,
            fetcher.clone(),
            Arc::new(FakeResolver::default()),
            policy(),
            options(2, 2),
        )
        .unwrap();

        let err = drain(&mut downloader).unwrap_err();

        assert!(matches!(err, Error::Integrity { row_offset: 4, .. }));
        // Integrity failures are not retried.
        let fetches_of_4 = fetcher
            .urls
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.starts_with("mem://4/"))
            .count();
        assert_eq!(fetches_of_4, 1);
    }

    #[test]
    fn gap_in_offsets_is_detected() {
        let mut downloader = CloudFetchDownloader::new(
            vec![link(0, 2, 0), link(5, 2, 0)],
            0,
            false,
            Arc::new(FakeFetcher::default()),
            Arc::new(FakeResolver::default()),
            policy(),
            options(2, 2),
        )
        .unwrap();

        let err = drain(&mut downloader).unwrap_err();

        assert!(matches!(err, Error::Integrity { row_offset: 2, .. }));
    }

    #[test]
    fn empty_files_are_skipped() {
        let mut downloader = CloudFetchDownloader::new(
            vec![link(0, 2, 0), link(2, 0, 0), link(2, 1, 0)],
            0,
            false,
            Arc::new(FakeFetcher::default()),
            Arc::new(FakeResolver::default()),
            policy(),
            options(2, 2),
        )
        .unwrap();

        assert_eq!(drain(&mut downloader).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn in_flight_downloads_never_exceed_pool_size() {
        let links: Vec<_> = (0..20).map(|i| link(i * 2, 2, 0)).collect();
        let delays = (0..20).map(|i| (i * 2, Duration::from_millis(5))).collect();
        let fetcher = Arc::new(FakeFetcher {
            delays,
            ..FakeFetcher::default()
        });
        let mut downloader = CloudFetchDownloader::new(
            links,
            0,
            false,
            fetcher.clone(),
            Arc::new(FakeResolver::default()),
            policy(),
            options(3, 8),
        )
        .unwrap();

        assert_eq!(drain(&mut downloader).unwrap(), (0..40).collect::<Vec<_>>());
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn workers_block_when_buffer_is_full() {
        let links: Vec<_> = (0..10).map(|i| link(i, 1, 0)).collect();
        let fetcher = Arc::new(FakeFetcher::default());
        let mut downloader = CloudFetchDownloader::new(
            links,
            0,
            false,
            fetcher.clone(),
            Arc::new(FakeResolver::default()),
            policy(),
            options(4, 2),
        )
        .unwrap();

        // Nobody consumes; let the workers run until they block.
        thread::sleep(Duration::from_millis(200));
        let done = downloader
            .task_states()
            .iter()
            .filter(|(_, s)| *s == TaskState::Done)
            .count();
        // At most the buffer, plus downloads that were already in flight when it filled.
        assert!(done <= 2 + 4, "{done} batches buffered");
        assert!(fetcher.completed.lock().unwrap().len() < 10);

        assert_eq!(drain(&mut downloader).unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn close_does_not_wait_for_in_flight_downloads() {
        let links: Vec<_> = (0..4).map(|i| link(i, 1, 0)).collect();
        let delays = (0..4).map(|i| (i, Duration::from_secs(3))).collect();
        let mut downloader = CloudFetchDownloader::new(
            links,
            0,
            false,
            Arc::new(FakeFetcher {
                delays,
                ..FakeFetcher::default()
            }),
            Arc::new(FakeResolver::default()),
            policy(),
            options(4, 4),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        downloader.close();

        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(matches!(downloader.next_batch(), Err(Error::Closed)));
    }
}
