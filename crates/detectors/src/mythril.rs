//! Mythril report parsing.
//!
//! Mythril writes its verdict as one JSON line. Issues are mapped to bug types by SWC id.

use salve_core::bug::{Bug, BugType};
use salve_utils::errors::DetectorError;
use serde::Deserialize;
use tracing::debug;

/// Name reported for Mythril findings.
pub const TOOL: &str = "Mythril";

const COVERAGE: &str = "mythril.laser.plugin.plugins.coverage.coverage_plugin [INFO]: Achieved";

#[derive(Debug, Deserialize)]
struct Report {
    success: bool,
    error: Option<String>,
    #[serde(default)]
    issues: Vec<Issue>,
}

#[derive(Debug, Deserialize)]
struct Issue {
    #[serde(rename = "swc-id")]
    swc_id: String,
    address: usize,
}

/// Bug type for a SWC registry id, when salve can patch it.
pub fn bug_type(swc_id: &str) -> Option<BugType> {
    match swc_id {
        "104" => Some(BugType::UnhandledException),
        "105" => Some(BugType::LeakingEther),
        "106" => Some(BugType::Suicidal),
        "112" => Some(BugType::UnsafeDelegatecall),
        "115" => Some(BugType::TransactionOrigin),
        _ => None,
    }
}

/// Bugs in a Mythril log, at most one per `(pc, type)`.
///
/// Fails if the report line is malformed or Mythril reports an unsuccessful analysis.
pub fn parse(log: &str) -> Result<Vec<Bug>, DetectorError> {
    let coverage = crate::coverage(log, COVERAGE).unwrap_or_default();
    let mut bugs: Vec<Bug> = Vec::new();

    for line in log.lines().map(str::trim).filter(|line| line.starts_with("{\"")) {
        let report: Report = serde_json::from_str(line).map_err(|e| DetectorError::Parse {
            tool: TOOL.into(),
            msg: e.to_string(),
        })?;
        if !report.success || report.error.is_some() {
            return Err(DetectorError::Parse {
                tool: TOOL.into(),
                msg: report.error.unwrap_or_else(|| "analysis was not successful".into()),
            });
        }

        for issue in report.issues {
            let Some(kind) = bug_type(&issue.swc_id) else {
                debug!("ignoring SWC-{} at pc {}", issue.swc_id, issue.address);
                continue;
            };
            if bugs.iter().any(|bug| bug.pc == issue.address && bug.kind == kind) {
                continue;
            }
            let mut bug = Bug::new(issue.address, kind);
            bug.tool = TOOL.into();
            bug.code_coverage = coverage;
            bugs.push(bug);
        }
    }
    Ok(bugs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_are_mapped_by_swc_id() {
        let log = r#"mythril.laser.plugin.plugins.coverage.coverage_plugin [INFO]: Achieved 64.86% coverage for code: 6080
{"error": null, "issues": [{"address": 661, "swc-id": "104", "title": "Unchecked return value"}, {"address": 661, "swc-id": "104"}, {"address": 700, "swc-id": "106"}, {"address": 710, "swc-id": "101"}, {"address": 661, "swc-id": "115"}], "success": true}"#;
        let bugs = parse(log).unwrap();
        let found: Vec<_> = bugs.iter().map(|bug| (bug.pc, bug.kind.clone())).collect();
        assert_eq!(
            found,
            vec![
                (661, BugType::UnhandledException),
                (700, BugType::Suicidal),
                (661, BugType::TransactionOrigin),
            ]
        );
        assert!(bugs.iter().all(|bug| bug.code_coverage == 64.86 && bug.tool == "Mythril"));
    }

    #[test]
    fn failed_analysis_is_an_error() {
        let log = r#"{"error": "Solver timeout", "issues": [], "success": false}"#;
        assert!(matches!(
            parse(log),
            Err(DetectorError::Parse { msg, .. }) if msg == "Solver timeout"
        ));
    }

    #[test]
    fn log_without_report_is_empty() {
        assert!(parse("mythril.mythril.mythril_analyzer [INFO]: Analysis started").unwrap().is_empty());
    }
}
