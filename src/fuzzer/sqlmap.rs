use async_trait::async_trait;

use super::{run_program, FuzzError, Fuzzer};
use crate::scan::Scan;

const BASE_ARGS: &[&str] = &[
    "--batch",
    "--timeout=2",
    "--retries=3",
    "--crawl=0",
    "--disable-coloring",
    "-o",
    "--text-only",
    "-v",
    "0",
    "--level=1",
    "--risk=1",
    "--smart",
    "--fresh-queries",
    "--purge-output",
    "--os=Linux",
    "--dbms=MySQL",
    "--delay=0.1",
    "--time-sec=1",
];

/// SQL injection engine driving the `sqlmap` binary.
///
/// Only integer-valued query parameters are offered as injection points.
#[derive(Debug, Clone)]
pub struct SqlmapFuzzer {
    program: String,
}

impl Default for SqlmapFuzzer {
    fn default() -> Self {
        Self::new("sqlmap")
    }
}

impl SqlmapFuzzer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Command line for a scan
    pub fn build_args(scan: &Scan) -> Vec<String> {
        let mut args: Vec<String> = BASE_ARGS.iter().map(|a| a.to_string()).collect();

        let mut testable: Vec<String> = Vec::new();
        for (name, value) in scan.request.url.query_pairs() {
            if value.parse::<i64>().is_ok() && !testable.iter().any(|t| *t == name) {
                testable.push(name.into_owned());
            }
        }
        if !testable.is_empty() {
            args.push("-p".to_string());
            args.push(testable.join(","));
        }

        if !scan.cookies.is_empty() {
            args.push("--cookie".to_string());
            args.push(scan.cookie_header());
        }

        if !scan.request.body.is_empty() {
            args.push(format!("--data={}", scan.request.body));
        }

        args.push("-u".to_string());
        args.push(scan.request.url.to_string());
        args
    }

    /// Count reported payloads, logging each finding
    pub fn extract(scan: &Scan, output: &str) -> usize {
        let mut count = 0;
        for line in output.lines().map(str::trim) {
            if line.starts_with("Payload: ") {
                scan.log("SQLMap.Findings", line);
                count += 1;
            }
        }
        count
    }
}

#[async_trait]
impl Fuzzer for SqlmapFuzzer {
    fn name(&self) -> &'static str {
        "sqlmap"
    }

    async fn fuzz(&self, scan: &Scan) -> Result<usize, FuzzError> {
        let args = Self::build_args(scan);
        scan.log("SQLMap.Scan", &format!("Running {} {}", self.program, args.join(" ")));

        let output = run_program(&self.program, &args).await?;
        let count = Self::extract(scan, &output);
        scan.log("SQLMap.Scan", &format!("Finished with {} findings", count));
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::Cookie;

    #[test]
    fn test_only_integer_params_are_testable() {
        let url = "http://example.com/item.php?id=3&name=x&page=2&id=4";
        let mut scan = Scan::new("GET", url, "").unwrap();
        scan.cookies.push(Cookie::new("sid", "abc"));
        scan.cookies.push(Cookie::new("lang", "en"));

        let args = SqlmapFuzzer::build_args(&scan);
        let p = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p + 1], "id,page");

        let c = args.iter().position(|a| a == "--cookie").unwrap();
        assert_eq!(args[c + 1], "sid=abc; lang=en");

        assert_eq!(&args[args.len() - 2..], ["-u", scan.request.url.as_str()]);
        assert!(!args.iter().any(|a| a.starts_with("--data")));
    }

    #[test]
    fn test_no_params_no_cookies() {
        let scan = Scan::new("POST", "http://example.com/login", "user=a").unwrap();
        let args = SqlmapFuzzer::build_args(&scan);
        assert!(!args.contains(&"-p".to_string()));
        assert!(!args.contains(&"--cookie".to_string()));
        assert!(args.contains(&"--data=user=a".to_string()));
    }

    #[test]
    fn test_extract_counts_payload_lines() {
        let scan = Scan::new("GET", "http://example.com/?id=1", "").unwrap();
        let output = "\
Parameter: id (GET)
    Type: boolean-based blind
    Payload: id=1 AND 1=1
    Type: time-based blind
    Payload: id=1 AND SLEEP(1)
Payloads tried: 40
";
        assert_eq!(SqlmapFuzzer::extract(&scan, output), 2);
        assert_eq!(SqlmapFuzzer::extract(&scan, ""), 0);
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let scan = Scan::new("GET", "http://example.com/?id=1", "").unwrap();
        let fuzzer = SqlmapFuzzer::new("dscan-no-such-sqlmap");
        assert!(matches!(fuzzer.fuzz(&scan).await, Err(FuzzError::Spawn { .. })));
    }
}
