//! Fuzzing engines
//!
//! Fuzzers receive pages already confirmed unique and report how many issues
//! they found. Engines wrap external binaries; the count is only logged.

mod arachni;
mod dummy;
mod sqlmap;

pub use arachni::ArachniFuzzer;
pub use dummy::DummyFuzzer;
pub use sqlmap::SqlmapFuzzer;

use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::scan::Scan;
use crate::util::truncate_str;

/// Longest stderr excerpt kept in an error
const MAX_STDERR_LEN: usize = 512;

/// Errors raised while running a fuzzing engine
#[derive(Debug, Error)]
pub enum FuzzError {
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program}' exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("Unknown fuzzer: {0}")]
    Unknown(String),
}

/// A vulnerability fuzzer
#[async_trait]
pub trait Fuzzer: Send + Sync {
    /// Engine name used in configuration and logs
    fn name(&self) -> &'static str;

    /// Fuzz a unique page, returning the number of issues found
    async fn fuzz(&self, scan: &Scan) -> Result<usize, FuzzError>;
}

/// Build an engine from its configured name
pub fn build_fuzzer(name: &str) -> Result<Arc<dyn Fuzzer>, FuzzError> {
    match name.to_ascii_lowercase().as_str() {
        "dummy" => Ok(Arc::new(DummyFuzzer)),
        "sqlmap" => Ok(Arc::new(SqlmapFuzzer::default())),
        "arachni" => Ok(Arc::new(ArachniFuzzer::default())),
        _ => Err(FuzzError::Unknown(name.to_string())),
    }
}

/// Run an external program to completion and return its stdout
pub(crate) async fn run_program(program: &str, args: &[String]) -> Result<String, FuzzError> {
    debug!(program, ?args, "Running fuzzer");
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| FuzzError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(FuzzError::Failed {
            program: program.to_string(),
            status: output.status,
            stderr: truncate_str(String::from_utf8_lossy(&output.stderr).trim(), MAX_STDERR_LEN),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_fuzzer() {
        assert_eq!(build_fuzzer("dummy").unwrap().name(), "dummy");
        assert_eq!(build_fuzzer("SQLMap").unwrap().name(), "sqlmap");
        assert_eq!(build_fuzzer("arachni").unwrap().name(), "arachni");
        assert!(matches!(build_fuzzer("w3af"), Err(FuzzError::Unknown(_))));
    }

    #[tokio::test]
    async fn test_run_program_missing_binary() {
        let err = run_program("dscan-no-such-binary", &[]).await.unwrap_err();
        assert!(matches!(err, FuzzError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_program_failure_status() {
        let err = run_program("false", &[]).await.unwrap_err();
        assert!(matches!(err, FuzzError::Failed { .. }));
    }
}
