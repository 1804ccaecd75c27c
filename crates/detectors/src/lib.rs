//! External vulnerability detectors.
//!
//! Osiris, Oyente and Mythril run in their published docker images. Their logs are parsed
//! into [`Bug`] records that the patcher consumes.

pub mod bugs;
pub mod docker;
pub mod mythril;
pub mod osiris;
pub mod oyente;

pub use bugs::{read_bugs, write_bugs};
pub use docker::{DockerDetector, Tool};

use async_trait::async_trait;
use regex::Regex;
use salve_core::bug::{dedup_and_sort, Bug};
use salve_utils::errors::DetectorError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// A producer of bug reports for runtime bytecode.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Name reported in [`Bug::tool`].
    fn name(&self) -> &str;

    /// Analyzes `runtime_hex` and returns the bugs found.
    async fn analyze(&self, runtime_hex: &str) -> Result<Vec<Bug>, DetectorError>;
}

/// Settings shared by the docker detectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Wall-clock limit of one detector run
    pub timeout: Duration,
    /// Extra attempts after a timeout or a failed start
    pub retries: u32,
    /// Docker executable
    pub docker: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1800),
            retries: 1,
            docker: "docker".into(),
        }
    }
}

/// Builds docker detectors from a comma-separated list of tool names.
pub fn detectors_from_names(names: &str, config: &DetectorConfig) -> Result<Vec<Arc<dyn Detector>>, DetectorError> {
    names
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            let tool: Tool = name.parse()?;
            Ok(Arc::new(DockerDetector::new(tool, config.clone())) as Arc<dyn Detector>)
        })
        .collect()
}

/// Runs every detector concurrently and merges their findings.
///
/// A detector that fails is logged and contributes nothing. The merged list is deduplicated
/// by `(pc, type)` and sorted by pc.
pub async fn run_all(detectors: Vec<Arc<dyn Detector>>, runtime_hex: &str) -> Vec<Bug> {
    let mut join_set = JoinSet::new();
    for detector in detectors {
        let hex = runtime_hex.to_string();
        join_set.spawn(async move {
            let result = detector.analyze(&hex).await;
            (detector.name().to_string(), result)
        });
    }

    let mut bugs = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((name, Ok(found))) => {
                info!("{name} reported {} bug(s)", found.len());
                bugs.extend(found);
            }
            Ok((name, Err(e))) => warn!("{name} failed: {e}"),
            Err(e) => warn!("detector task failed: {e}"),
        }
    }
    dedup_and_sort(bugs)
}

/// Extracts the first percentage following `prefix` on a line of `log`.
pub(crate) fn coverage(log: &str, prefix: &str) -> Option<f64> {
    let pattern = format!(r"{}\s*([0-9]+(?:\.[0-9]+)?)\s*%", regex::escape(prefix));
    let re = Regex::new(&pattern).ok()?;
    log.lines()
        .filter_map(|line| re.captures(line.trim()))
        .filter_map(|caps| caps[1].parse().ok())
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use salve_core::bug::BugType;

    struct Fixed(&'static str, Vec<Bug>);

    #[async_trait]
    impl Detector for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn analyze(&self, _runtime_hex: &str) -> Result<Vec<Bug>, DetectorError> {
            Ok(self.1.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl Detector for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn analyze(&self, _runtime_hex: &str) -> Result<Vec<Bug>, DetectorError> {
            Err(DetectorError::Timeout {
                tool: "broken".into(),
                secs: 1,
            })
        }
    }

    #[tokio::test]
    async fn findings_are_merged_and_failures_skipped() {
        let detectors: Vec<Arc<dyn Detector>> = vec![
            Arc::new(Fixed(
                "a",
                vec![Bug::new(9, BugType::Overflow), Bug::new(3, BugType::Reentrancy)],
            )),
            Arc::new(Broken),
            Arc::new(Fixed("b", vec![Bug::new(9, BugType::Overflow)])),
        ];
        let bugs = run_all(detectors, "00").await;
        let found: Vec<_> = bugs.iter().map(|bug| (bug.pc, bug.kind.clone())).collect();
        assert_eq!(found, vec![(3, BugType::Reentrancy), (9, BugType::Overflow)]);
    }

    #[test]
    fn detector_names_are_parsed() {
        let config = DetectorConfig::default();
        let detectors = detectors_from_names("Osiris, mythril", &config).unwrap();
        let names: Vec<_> = detectors.iter().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["Osiris", "Mythril"]);
        assert!(matches!(
            detectors_from_names("slither", &config),
            Err(DetectorError::UnknownTool(name)) if name == "slither"
        ));
    }

    #[test]
    fn coverage_takes_the_last_report() {
        let log = "INFO:symExec:\t  EVM code coverage: \t 12.5%\nnoise\nINFO:symExec:\t  EVM code coverage: \t 87%";
        assert_eq!(coverage(log, "INFO:symExec:\t  EVM code coverage:"), Some(87.0));
        assert_eq!(coverage("nothing here", "EVM code coverage:"), None);
    }
}
