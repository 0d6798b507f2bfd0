use async_trait::async_trait;

use super::{run_program, FuzzError, Fuzzer};
use crate::scan::Scan;

/// Smoke-test engine: echoes the target host and reports no issues
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyFuzzer;

#[async_trait]
impl Fuzzer for DummyFuzzer {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn fuzz(&self, scan: &Scan) -> Result<usize, FuzzError> {
        let result = run_program("echo", &[scan.host()]).await;
        scan.log("Dummy.Scan", &format!("Echo returned {}", result.is_ok()));
        result.map(|_| 0)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dummy_reports_no_issues() {
        let scan = Scan::new("GET", "http://example.com/", "").unwrap();
        assert_eq!(DummyFuzzer.fuzz(&scan).await.unwrap(), 0);
    }
}
