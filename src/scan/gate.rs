//! Scan decision logic
//!
//! Three decision points built on the replicated store. Each is safe to call
//! repeatedly on the same scan: fingerprints are cached on the scan and the
//! store's check-then-record is atomic.

use std::time::Duration;

use crate::fingerprint::DEFAULT_MAX_TOKENS;
use crate::store::{IndexKind, ReplicatedStore};

use super::Scan;

/// Tunables for the decision points
#[derive(Debug, Clone)]
pub struct ScanPolicy {
    /// Shingle width for page fingerprints
    pub shingle_factor: usize,
    /// Pages closer than this many bits to a seen page are duplicates
    pub similarity_radius: u32,
    /// Tokenizer cap for page fingerprints
    pub max_tokens: usize,
    /// Suggested delay when a host is over its rate budget
    pub backoff: Duration,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            shingle_factor: 3,
            similarity_radius: 2,
            max_tokens: DEFAULT_MAX_TOKENS,
            backoff: Duration::from_secs(5),
        }
    }
}

/// Crawl/fuzz admission decisions for one worker
#[derive(Debug, Clone)]
pub struct ScanGate {
    store: ReplicatedStore,
    policy: ScanPolicy,
}

impl ScanGate {
    pub fn new(store: ReplicatedStore, policy: ScanPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &ReplicatedStore {
        &self.store
    }

    pub fn policy(&self) -> &ScanPolicy {
        &self.policy
    }

    fn fingerprint(&self, scan: &mut Scan) {
        scan.update_fingerprint(self.policy.shingle_factor, self.policy.max_tokens);
    }

    /// Whether a discovered link should be queued.
    ///
    /// Returns `true` exactly once per (job, URL); the URL is recorded as seen.
    pub fn should_crawl(&self, scan: &mut Scan) -> bool {
        self.fingerprint(scan);
        let duplicate = self
            .store
            .see_if_unseen(&scan.job.id, IndexKind::Exact, scan.fingerprint.url, 0);

        if duplicate {
            scan.log("ShouldCrawl", "Duplicate link");
        } else {
            scan.log("ShouldCrawl", "Unique link");
        }
        !duplicate
    }

    /// Whether a fetched page is a near-duplicate of one already seen in its job.
    /// Unique pages are recorded.
    pub fn is_duplicate_page(&self, scan: &mut Scan) -> bool {
        self.fingerprint(scan);
        let duplicate = self.store.see_if_unseen(
            &scan.job.id,
            IndexKind::Similarity,
            scan.fingerprint.response_similarity,
            self.policy.similarity_radius,
        );

        if duplicate {
            scan.log("IsDuplicatePage", "Duplicate page");
        } else {
            scan.log("IsDuplicatePage", "Unique page");
        }
        duplicate
    }

    /// Delay before the scan may be crawled: zero if the host is within its
    /// budget (the hit is counted), otherwise the backoff.
    ///
    /// Callers requeue after the delay instead of blocking on it.
    pub fn rate_limit(&self, scan: &Scan) -> Duration {
        if self.store.allow(&scan.host()) {
            Duration::ZERO
        } else {
            scan.log("RateLimit", "Over budget, backing off");
            self.policy.backoff
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::ScanResponse;
    use crate::store::StoreConfig;

    fn gate() -> ScanGate {
        ScanGate::new(ReplicatedStore::new(StoreConfig::default()), ScanPolicy::default())
    }

    fn with_body(scan: &Scan, body: &str) -> Scan {
        let mut page = scan.spawn();
        page.response = Some(ScanResponse {
            status: 200,
            headers: Vec::new(),
            body: body.to_string(),
        });
        page
    }

    #[test]
    fn test_should_crawl_once_per_url() {
        let gate = gate();
        let seed = Scan::new("GET", "http://example.com/", "").unwrap();

        let mut a = seed.spawn();
        a.merge_request("GET", "/a", "").unwrap();
        assert!(gate.should_crawl(&mut a));
        assert!(!gate.should_crawl(&mut a));

        let mut again = seed.spawn();
        again.merge_request("GET", "/a#section", "").unwrap();
        assert!(!gate.should_crawl(&mut again));

        let mut b = seed.spawn();
        b.merge_request("GET", "/b", "").unwrap();
        assert!(gate.should_crawl(&mut b));
    }

    #[test]
    fn test_should_crawl_is_scoped_by_job() {
        let gate = gate();
        let mut first = Scan::new("GET", "http://example.com/", "").unwrap();
        let mut second = Scan::new("GET", "http://example.com/", "").unwrap();
        assert!(gate.should_crawl(&mut first));
        assert!(gate.should_crawl(&mut second));
    }

    #[test]
    fn test_duplicate_pages() {
        let gate = gate();
        let seed = Scan::new("GET", "http://example.com/", "").unwrap();
        let listing = concat!(
            r#"<html><body><ul class="items"><li><a href="/1">one</a></li>"#,
            r#"<li><a href="/2">two</a></li></ul></body></html>"#
        );
        let same_shape = concat!(
            r#"<html><body><ul class="items"><li><a href="/3">three</a></li>"#,
            r#"<li><a href="/4">four</a></li></ul></body></html>"#
        );
        let other = concat!(
            r#"<!DOCTYPE html><html><head><title>t</title></head><body>"#,
            r#"<form action="/login"><input name="user"><input name="pass" type="password">"#,
            r#"</form></body></html>"#
        );

        let mut first = with_body(&seed, listing);
        assert!(!gate.is_duplicate_page(&mut first));
        assert!(gate.is_duplicate_page(&mut first));

        let mut second = with_body(&seed, same_shape);
        assert!(gate.is_duplicate_page(&mut second));

        let mut third = with_body(&seed, other);
        assert!(!gate.is_duplicate_page(&mut third));
        assert_eq!(gate.store().similarity_len(&seed.job.id), 2);
    }

    #[test]
    fn test_rate_limit_backs_off() {
        let gate = gate();
        let scan = Scan::new("GET", "http://limited.example/", "").unwrap();
        let delays: Vec<Duration> = (0..6).map(|_| gate.rate_limit(&scan)).collect();

        // The epoch may roll over mid-loop, so at least five calls pass
        let passed = delays.iter().filter(|d| d.is_zero()).count();
        assert!(passed >= 5);
        assert!(delays.iter().all(|d| d.is_zero() || *d == gate.policy().backoff));
    }
}
