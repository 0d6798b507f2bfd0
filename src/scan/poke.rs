//! Liveness check run before a fresh crawl session

use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::store::ReplicatedStore;

use super::{Scan, ScanError};

/// Check that the target answers.
///
/// On success the response is stored on the scan, the hit count goes up, a
/// fresh session is started for the host (clearing the seen links of its
/// previous session), and the poke time is recorded.
pub async fn poke(
    scan: &mut Scan,
    client: &reqwest::Client,
    store: &ReplicatedStore,
    timeout: Duration,
) -> Result<(), ScanError> {
    scan.log("Poke", "Poking");

    let response = match scan.send(client, timeout).await {
        Ok(response) => response,
        Err(source) => {
            scan.log("Poke", "Failed");
            return Err(ScanError::Unreachable {
                url: scan.request.url.to_string(),
                source,
            });
        }
    };

    debug!(status = response.status, url = %scan.request.url, "Target answered");
    scan.response = Some(response);
    scan.hit_count += 1;

    let host = scan.host();
    let cleared = store.begin_session(&host, &scan.job.id);
    if cleared > 0 {
        debug!(job_id = %scan.job.id, %host, cleared, "Cleared seen links of previous session");
    }
    store.record_poke(&host, Utc::now());
    Ok(())
}
