use async_trait::async_trait;

use super::{run_program, FuzzError, Fuzzer};
use crate::scan::Scan;

const BASE_ARGS: &[&str] = &[
    "--checks",
    "xss*",
    "--output-only-positives",
    "--http-request-concurrency",
    "1",
    "--http-request-timeout",
    "10000",
    "--timeout",
    "00:03:00",
    "--scope-dom-depth-limit",
    "0",
    "--scope-directory-depth-limit",
    "0",
    "--scope-page-limit",
    "1",
    "--audit-with-both-methods",
    "--report-save-path",
    "/dev/null",
    "--snapshot-save-path",
    "/dev/null",
];

const FINDING_PREFIX: &str = "[~] Affected page";

/// Cross-site scripting engine driving the `arachni` binary.
///
/// Audits the single page only; request bodies are not forwarded.
#[derive(Debug, Clone)]
pub struct ArachniFuzzer {
    program: String,
}

impl Default for ArachniFuzzer {
    fn default() -> Self {
        Self::new("arachni")
    }
}

impl ArachniFuzzer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Command line for a scan
    pub fn build_args(scan: &Scan) -> Vec<String> {
        let mut args: Vec<String> = BASE_ARGS.iter().map(|a| a.to_string()).collect();

        if !scan.cookies.is_empty() {
            let cookies: Vec<String> = scan
                .cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect();
            args.push("--http-cookie-string".to_string());
            args.push(cookies.join(";"));
        }

        args.push(scan.request.url.to_string());
        args
    }

    /// Count affected pages, logging each finding
    pub fn extract(scan: &Scan, output: &str) -> usize {
        let mut count = 0;
        for line in output.lines().map(str::trim) {
            if line.starts_with(FINDING_PREFIX) {
                scan.log("Arachni.Findings", line);
                count += 1;
            }
        }
        count
    }
}

#[async_trait]
impl Fuzzer for ArachniFuzzer {
    fn name(&self) -> &'static str {
        "arachni"
    }

    async fn fuzz(&self, scan: &Scan) -> Result<usize, FuzzError> {
        let args = Self::build_args(scan);
        scan.log("Arachni.Scan", &format!("Running {} {}", self.program, args.join(" ")));

        let output = run_program(&self.program, &args).await?;
        let count = Self::extract(scan, &output);
        scan.log("Arachni.Scan", &format!("Finished with {} findings", count));
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::Cookie;

    #[test]
    fn test_build_args() {
        let mut scan = Scan::new("GET", "http://example.com/xss?in=change_me", "").unwrap();
        let args = ArachniFuzzer::build_args(&scan);
        assert_eq!(args[..2], ["--checks", "xss*"]);
        assert!(!args.contains(&"--http-cookie-string".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("http://example.com/xss?in=change_me"));

        scan.cookies.push(Cookie::new("sid", "abc"));
        scan.cookies.push(Cookie::new("lang", "en"));
        let args = ArachniFuzzer::build_args(&scan);
        let c = args.iter().position(|a| a == "--http-cookie-string").unwrap();
        assert_eq!(args[c + 1], "sid=abc;lang=en");
        assert_eq!(c + 3, args.len());
    }

    #[test]
    fn test_extract_counts_affected_pages() {
        let scan = Scan::new("GET", "http://example.com/?in=1", "").unwrap();
        let output = "\
[+] Cross-Site Scripting (XSS)
    [~] Affected page:    http://example.com/?in=%3Cscript%3E
[+] Cross-Site Scripting (XSS) in HTML tag
    [~] Affected page:    http://example.com/?in=%22%3E
[*] Audit finished
";
        assert_eq!(ArachniFuzzer::extract(&scan, output), 2);
        assert_eq!(ArachniFuzzer::extract(&scan, "[*] Audit finished"), 0);
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let scan = Scan::new("GET", "http://example.com/", "").unwrap();
        let fuzzer = ArachniFuzzer::new("dscan-no-such-arachni");
        assert!(matches!(fuzzer.fuzz(&scan).await, Err(FuzzError::Spawn { .. })));
    }
}
