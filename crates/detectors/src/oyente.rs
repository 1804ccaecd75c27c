//! Oyente log parsing.

use regex::Regex;
use salve_core::bug::{Bug, BugType};
use std::sync::OnceLock;

/// Name reported for Oyente findings.
pub const TOOL: &str = "Oyente";

const COVERAGE: &str = "INFO:symExec:\t  EVM Code Coverage:";

fn reentrancy_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Re-Entrancy Vulnerability:\s*True\s*\[([0-9,\s]+)\]").ok())
        .as_ref()
}

/// Reentrant calls reported in an Oyente log, at most one per pc.
pub fn parse(log: &str) -> Vec<Bug> {
    let coverage = crate::coverage(log, COVERAGE).unwrap_or_default();
    let mut bugs: Vec<Bug> = Vec::new();
    let Some(re) = reentrancy_line() else {
        return bugs;
    };
    for caps in log.lines().filter_map(|line| re.captures(line)) {
        for pc in caps[1].split(',').filter_map(|pc| pc.trim().parse::<usize>().ok()) {
            if bugs.iter().any(|bug| bug.pc == pc) {
                continue;
            }
            let mut bug = Bug::new(pc, BugType::Reentrancy);
            bug.tool = TOOL.into();
            bug.code_coverage = coverage;
            bugs.push(bug);
        }
    }
    bugs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrancy_pcs_are_collected() {
        let log = "INFO:symExec:\t  EVM Code Coverage: \t\t\t 71.2%
INFO:symExec:\t  Integer Overflow: \t\t\t False
INFO:symExec:\t  Re-Entrancy Vulnerability: \t\t True [2114]
INFO:symExec:\t  Re-Entrancy Vulnerability: \t\t True [2114, 3001]
INFO:symExec:\t  Re-Entrancy Vulnerability: \t\t False";
        let bugs = parse(log);
        assert_eq!(bugs.iter().map(|bug| bug.pc).collect::<Vec<_>>(), vec![2114, 3001]);
        assert!(bugs.iter().all(|bug| bug.kind == BugType::Reentrancy));
        assert_eq!(bugs[0].code_coverage, 71.2);
        assert_eq!(bugs[0].tool, "Oyente");
    }
}
