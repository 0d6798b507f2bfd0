//! Standalone scan pipeline
//!
//! seed → poke → rate limit → crawl → fuzz
//!
//! Scans flow through an in-process queue. Rate-limited scans are requeued
//! on a detached timer, crawls are admitted through a semaphore, unique pages
//! go to every configured fuzzer and new links re-enter the queue once they
//! pass the link dedup check. A run ends when no scan is outstanding.
//!
//! With several workers, each owns a replicated store joined to the others
//! through a [`LocalBus`], and scans are dispatched round-robin.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::fuzzer::{build_fuzzer, Fuzzer};
use crate::renderer::{NoScriptRenderer, RenderStreams, Renderer};
use crate::scan::{poke, Scan, ScanGate};
use crate::store::{LocalBus, MemoryKv, ReplicatedStore};

/// One worker: its decision gate (and store) plus the renderer it crawls with
#[derive(Clone)]
pub struct Worker {
    pub gate: ScanGate,
    pub renderer: Arc<dyn Renderer>,
}

/// Pipeline-level settings
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_concurrency: usize,
    pub poke_timeout: Duration,
    pub skip_unreachable: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            poke_timeout: Duration::from_secs(3),
            skip_unreachable: true,
        }
    }
}

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// The seed failed its liveness check
    pub seed_unreachable: bool,
    /// Scans handed to a renderer
    pub crawled: usize,
    /// Pages that passed the near-duplicate check
    pub unique_pages: usize,
    /// Follow-up links accepted into the queue
    pub links_queued: usize,
    /// Times a scan was requeued for rate limiting
    pub rate_limited: usize,
    /// Successful fuzzer runs
    pub fuzz_runs: usize,
    /// Failed fuzzer runs
    pub fuzz_errors: usize,
    /// Issues reported, per fuzzer
    pub issues: BTreeMap<String, usize>,
}

impl PipelineStats {
    pub fn total_issues(&self) -> usize {
        self.issues.values().sum()
    }
}

#[derive(Default)]
struct Counters {
    crawled: AtomicUsize,
    unique_pages: AtomicUsize,
    links_queued: AtomicUsize,
    rate_limited: AtomicUsize,
    fuzz_runs: AtomicUsize,
    fuzz_errors: AtomicUsize,
    issues: Mutex<BTreeMap<String, usize>>,
}

impl Counters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            seed_unreachable: false,
            crawled: self.crawled.load(Ordering::Relaxed),
            unique_pages: self.unique_pages.load(Ordering::Relaxed),
            links_queued: self.links_queued.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            fuzz_runs: self.fuzz_runs.load(Ordering::Relaxed),
            fuzz_errors: self.fuzz_errors.load(Ordering::Relaxed),
            issues: self.issues.lock().clone(),
        }
    }
}

/// Shared state of one run
struct Run {
    workers: Arc<Vec<Worker>>,
    fuzzers: Arc<Vec<Arc<dyn Fuzzer>>>,
    queue: mpsc::UnboundedSender<Scan>,
    /// Scans queued, waiting out a backoff, or in flight
    pending: AtomicUsize,
    done: Notify,
    permits: Semaphore,
    next_worker: AtomicUsize,
    counters: Counters,
}

impl Run {
    fn enqueue(&self, scan: Scan) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.requeue(scan);
    }

    /// Put an already-counted scan back on the queue
    fn requeue(&self, scan: Scan) {
        if self.queue.send(scan).is_err() {
            self.finish();
        }
    }

    fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.done.notify_one();
        }
    }

    fn pick_worker(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    /// Rate-limit stage: crawl now or requeue after the backoff
    fn dispatch(self: &Arc<Self>, scan: Scan) {
        let index = self.pick_worker();
        let delay = self.workers[index].gate.rate_limit(&scan);

        if !delay.is_zero() {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            let run = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                run.requeue(scan);
            });
            return;
        }

        let run = Arc::clone(self);
        tokio::spawn(async move {
            run.crawl(index, scan).await;
            run.finish();
        });
    }

    /// Crawl stage: render, fuzz the page and queue its new links
    async fn crawl(self: &Arc<Self>, index: usize, scan: Scan) {
        let Ok(_permit) = self.permits.acquire().await else {
            return;
        };
        let worker = &self.workers[index];

        if !scan.is_scan_allowed() {
            scan.log("Crawl", "Scan not allowed");
            return;
        }
        scan.log("Crawl", "Started");
        self.counters.crawled.fetch_add(1, Ordering::Relaxed);

        let RenderStreams { mut page, mut links } = worker.renderer.render(scan);

        let fuzz_page = async {
            if let Some(page) = page.recv().await {
                self.counters.unique_pages.fetch_add(1, Ordering::Relaxed);
                self.fuzz(page).await;
            }
        };

        // Pages that turn out to be duplicates close both streams
        let queue_links = async {
            while let Some(mut link) = links.recv().await {
                if worker.gate.should_crawl(&mut link) {
                    self.counters.links_queued.fetch_add(1, Ordering::Relaxed);
                    self.enqueue(link.for_transit());
                }
            }
        };

        tokio::join!(fuzz_page, queue_links);
    }

    /// Fuzz stage: run every fuzzer on the page concurrently
    async fn fuzz(&self, page: Scan) {
        let page = Arc::new(page);
        let mut runs = JoinSet::new();
        for fuzzer in self.fuzzers.iter() {
            let fuzzer = Arc::clone(fuzzer);
            let page = Arc::clone(&page);
            runs.spawn(async move {
                let result = fuzzer.fuzz(&page).await;
                (fuzzer.name(), result)
            });
        }

        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok((name, Ok(count))) => {
                    self.counters.fuzz_runs.fetch_add(1, Ordering::Relaxed);
                    *self.counters.issues.lock().entry(name.to_string()).or_insert(0) += count;
                    page.log("Fuzz", &format!("{} reported {} issues", name, count));
                }
                Ok((name, Err(e))) => {
                    self.counters.fuzz_errors.fetch_add(1, Ordering::Relaxed);
                    page.log("Fuzz", &format!("{} failed: {}", name, e));
                }
                Err(e) => {
                    self.counters.fuzz_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Fuzzer task panicked: {}", e);
                }
            }
        }
    }
}

/// The standalone pipeline
pub struct Pipeline {
    workers: Arc<Vec<Worker>>,
    fuzzers: Arc<Vec<Arc<dyn Fuzzer>>>,
    client: reqwest::Client,
    settings: PipelineSettings,
    bus_tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn new(
        workers: Vec<Worker>,
        fuzzers: Vec<Arc<dyn Fuzzer>>,
        client: reqwest::Client,
        settings: PipelineSettings,
    ) -> Result<Self> {
        anyhow::ensure!(!workers.is_empty(), "pipeline needs at least one worker");
        Ok(Self {
            workers: Arc::new(workers),
            fuzzers: Arc::new(fuzzers),
            client,
            settings,
            bus_tasks: Vec::new(),
        })
    }

    /// Build workers, stores and fuzzers from configuration.
    ///
    /// Replicated stores spawn background tasks, so this must be called
    /// inside a tokio runtime.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.scan.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;

        let fuzzers = config
            .scan
            .fuzzers
            .iter()
            .map(|name| build_fuzzer(name))
            .collect::<Result<Vec<_>, _>>()?;

        let store_config = config.store_config();
        let policy = config.scan_policy();
        let render_timeout = Duration::from_secs(config.scan.render_timeout_secs);
        let worker_count = config.scan.workers.max(1);

        let mut stores = Vec::with_capacity(worker_count);
        let mut bus_tasks = Vec::new();
        if worker_count > 1 || config.replication.enabled {
            let bus = LocalBus::new(config.replication.bus_capacity);
            for _ in 0..worker_count {
                let (store, handle) =
                    ReplicatedStore::replicated(store_config.clone(), Arc::new(MemoryKv::new()));
                bus_tasks.push(bus.attach(handle));
                stores.push(store);
            }
            info!(workers = worker_count, "Replicating store writes over the local bus");
        } else {
            stores.push(ReplicatedStore::new(store_config));
        }

        let workers = stores
            .into_iter()
            .map(|store| {
                let gate = ScanGate::new(store, policy.clone());
                let renderer: Arc<dyn Renderer> =
                    Arc::new(NoScriptRenderer::new(client.clone(), gate.clone(), render_timeout));
                Worker { gate, renderer }
            })
            .collect();

        let settings = PipelineSettings {
            max_concurrency: config.scan.max_concurrency,
            poke_timeout: Duration::from_secs(config.scan.poke_timeout_secs),
            skip_unreachable: config.scan.skip_unreachable,
        };

        let mut pipeline = Self::new(workers, fuzzers, client, settings)?;
        pipeline.bus_tasks = bus_tasks;
        Ok(pipeline)
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Scan from `seed` until no work is outstanding
    pub async fn run(&self, mut seed: Scan) -> Result<PipelineStats> {
        seed.log("Main", "Started");
        let first = &self.workers[0];

        let store = first.gate.store();
        if let Err(e) = poke(&mut seed, &self.client, store, self.settings.poke_timeout).await {
            if self.settings.skip_unreachable {
                warn!("Skipping scan: {}", e);
                return Ok(PipelineStats {
                    seed_unreachable: true,
                    ..PipelineStats::default()
                });
            }
            warn!("Seed unreachable, crawling anyway: {}", e);
        }

        // Record the seed URL so links back to it are not queued again
        first.gate.should_crawl(&mut seed);

        let (queue, mut rx) = mpsc::unbounded_channel();
        let run = Arc::new(Run {
            workers: Arc::clone(&self.workers),
            fuzzers: Arc::clone(&self.fuzzers),
            queue,
            pending: AtomicUsize::new(0),
            done: Notify::new(),
            permits: Semaphore::new(self.settings.max_concurrency.max(1)),
            next_worker: AtomicUsize::new(0),
            counters: Counters::default(),
        });

        run.enqueue(seed.for_transit());

        loop {
            tokio::select! {
                Some(scan) = rx.recv() => run.dispatch(scan),
                _ = run.done.notified() => break,
            }
        }

        let stats = run.counters.snapshot();
        debug!(?stats, "Pipeline drained");
        Ok(stats)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        for task in &self.bus_tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzzer::FuzzError;
    use crate::scan::{test_server, ScanPolicy, ScanResponse};
    use crate::store::StoreConfig;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Serves a fixed site map without touching the network
    struct SiteRenderer {
        gate: ScanGate,
        pages: HashMap<&'static str, (&'static str, Vec<&'static str>)>,
        visits: Arc<Mutex<Vec<String>>>,
    }

    impl Renderer for SiteRenderer {
        fn render(&self, mut scan: Scan) -> RenderStreams {
            let (page_tx, page) = mpsc::channel(1);
            let (link_tx, links) = mpsc::channel(16);
            let path = scan.request.url.path().to_string();
            self.visits.lock().push(path.clone());

            let entry = self.pages.get(path.as_str()).cloned();
            let gate = self.gate.clone();
            tokio::spawn(async move {
                let Some((body, hrefs)) = entry else {
                    return;
                };
                scan.response = Some(ScanResponse {
                    status: 200,
                    headers: Vec::new(),
                    body: body.to_string(),
                });
                if gate.is_duplicate_page(&mut scan) {
                    return;
                }
                let _ = page_tx.send(scan.clone()).await;
                for href in hrefs {
                    let mut link = scan.spawn();
                    if link.merge_request("GET", href, "").is_ok() && link.is_scan_allowed() {
                        let _ = link_tx.send(link).await;
                    }
                }
            });
            RenderStreams { page, links }
        }
    }

    struct CountingFuzzer {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Fuzzer for CountingFuzzer {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn fuzz(&self, _scan: &Scan) -> Result<usize, FuzzError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    fn site() -> HashMap<&'static str, (&'static str, Vec<&'static str>)> {
        let shallow = "<html><body><p>home</p></body></html>";
        let list = "<html><body><ul class=\"list\"><li>a</li><li>b</li></ul></body></html>";
        let form = concat!(
            "<html><body><form action=\"/x\"><input name=\"q\"></form>",
            "<div id=\"x\"></div></body></html>"
        );
        HashMap::from([
            ("/", (shallow, vec!["/a", "/b", "/a", "http://elsewhere.org/"])),
            ("/a", (list, vec!["/", "/b"])),
            ("/b", (form, vec!["/c"])),
            // Same markup as /b
            ("/c", (form, vec!["/d"])),
        ])
    }

    fn workers(
        stores: Vec<ReplicatedStore>,
        visits: &Arc<Mutex<Vec<String>>>,
        policy: &ScanPolicy,
    ) -> Vec<Worker> {
        stores
            .into_iter()
            .map(|store| {
                let gate = ScanGate::new(store, policy.clone());
                let renderer: Arc<dyn Renderer> = Arc::new(SiteRenderer {
                    gate: gate.clone(),
                    pages: site(),
                    visits: Arc::clone(visits),
                });
                Worker { gate, renderer }
            })
            .collect()
    }

    async fn seed() -> Scan {
        let addr = test_server::serve(&[("/", "<html></html>")]).await;
        Scan::new("GET", &format!("http://{}/", addr), "").unwrap()
    }

    #[tokio::test]
    async fn test_single_worker_run() {
        let visits = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let store_config = StoreConfig {
            rate_max_hits: 1000,
            ..StoreConfig::default()
        };
        let pipeline = Pipeline::new(
            workers(vec![ReplicatedStore::new(store_config)], &visits, &ScanPolicy::default()),
            vec![Arc::new(CountingFuzzer { calls: Arc::clone(&calls) })],
            reqwest::Client::new(),
            PipelineSettings::default(),
        )
        .unwrap();

        let stats = pipeline.run(seed().await).await.unwrap();

        let mut visited = visits.lock().clone();
        visited.sort();
        assert_eq!(visited, vec!["/", "/a", "/b", "/c"]);
        assert_eq!(stats.crawled, 4);
        assert_eq!(stats.unique_pages, 3);
        assert_eq!(stats.links_queued, 3);
        assert_eq!(stats.fuzz_runs, 3);
        assert_eq!(stats.total_issues(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!stats.seed_unreachable);
    }

    #[tokio::test]
    async fn test_rate_limited_scans_are_requeued() {
        let visits = Arc::new(Mutex::new(Vec::new()));
        let store_config = StoreConfig {
            rate_window: Duration::from_secs(1),
            rate_max_hits: 2,
            ..StoreConfig::default()
        };
        let policy = ScanPolicy {
            backoff: Duration::from_millis(50),
            ..ScanPolicy::default()
        };
        let pipeline = Pipeline::new(
            workers(vec![ReplicatedStore::new(store_config)], &visits, &policy),
            Vec::new(),
            reqwest::Client::new(),
            PipelineSettings::default(),
        )
        .unwrap();

        let stats = pipeline.run(seed().await).await.unwrap();
        assert_eq!(stats.crawled, 4);
        assert!(stats.rate_limited > 0);
    }

    #[tokio::test]
    async fn test_unreachable_seed_is_skipped() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let visits = Arc::new(Mutex::new(Vec::new()));
        let store = ReplicatedStore::new(StoreConfig::default());
        let pipeline = Pipeline::new(
            workers(vec![store], &visits, &ScanPolicy::default()),
            Vec::new(),
            reqwest::Client::new(),
            PipelineSettings::default(),
        )
        .unwrap();

        let seed = Scan::new("GET", &format!("http://{}/", addr), "").unwrap();
        let stats = pipeline.run(seed).await.unwrap();
        assert!(stats.seed_unreachable);
        assert_eq!(stats.crawled, 0);
        assert!(visits.lock().is_empty());
    }

    #[tokio::test]
    async fn test_workers_share_state_over_bus() {
        let visits = Arc::new(Mutex::new(Vec::new()));
        let bus = LocalBus::new(256);
        let store_config = StoreConfig {
            rate_max_hits: 1000,
            ..StoreConfig::default()
        };
        let mut stores = Vec::new();
        let mut pumps = Vec::new();
        for _ in 0..3 {
            let (store, handle) =
                ReplicatedStore::replicated(store_config.clone(), Arc::new(MemoryKv::new()));
            pumps.push(bus.attach(handle));
            stores.push(store);
        }

        let pipeline = Pipeline::new(
            workers(stores, &visits, &ScanPolicy::default()),
            Vec::new(),
            reqwest::Client::new(),
            PipelineSettings::default(),
        )
        .unwrap();

        let stats = pipeline.run(seed().await).await.unwrap();

        // Replication is eventual, so a page may be crawled more than once
        let visited = visits.lock().clone();
        for path in ["/", "/a", "/b", "/c"] {
            assert!(visited.iter().any(|v| v == path), "{} not visited", path);
        }
        assert!(stats.crawled >= 4);
        assert!(stats.unique_pages >= 3);

        for pump in pumps {
            pump.abort();
        }
    }

    #[tokio::test]
    async fn test_from_config_builds_workers() {
        let mut config = Config::default();
        config.scan.workers = 2;
        let pipeline = Pipeline::from_config(&config).unwrap();
        assert_eq!(pipeline.workers().len(), 2);

        config.scan.workers = 1;
        let pipeline = Pipeline::from_config(&config).unwrap();
        assert_eq!(pipeline.workers().len(), 1);
    }
}
