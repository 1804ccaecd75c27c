//! Osiris log parsing.
//!
//! After its summary line, Osiris prints each arithmetic error as a Python dict followed by
//! a JSON object describing the instruction.

use salve_core::bug::{Bug, BugType};
use serde_json::Value;
use tracing::warn;

/// Name reported for Osiris findings.
pub const TOOL: &str = "Osiris";

const COVERAGE: &str = "INFO:symExec:\t  EVM code coverage:";
const SUMMARY: &str = "Number of arithmetic errors";

/// Overflows and underflows reported in an Osiris log, at most one per pc.
pub fn parse(log: &str) -> Vec<Bug> {
    let coverage = crate::coverage(log, COVERAGE).unwrap_or_default();
    let mut bugs: Vec<Bug> = Vec::new();
    let mut previous = "";

    let lines = log.lines().map(str::trim).skip_while(|line| !line.starts_with(SUMMARY));
    for line in lines {
        if previous.starts_with("{'") && line.starts_with("{\"") {
            match (python_dict(previous), python_dict(line)) {
                (Some(error), Some(instruction)) => {
                    if let Some(bug) = arithmetic_bug(&error, &instruction) {
                        if !bugs.iter().any(|seen| seen.pc == bug.pc) {
                            bugs.push(Bug { code_coverage: coverage, ..bug });
                        }
                    }
                }
                _ => warn!("skipping unreadable Osiris report: {previous}"),
            }
        }
        previous = line;
    }
    bugs
}

/// Reads a Python dict repr as JSON. `<...>` reprs become strings and text is lowercased.
fn python_dict(line: &str) -> Option<Value> {
    let json = line
        .replace('\'', "\"")
        .replace('<', "\"<")
        .replace('>', ">\"")
        .to_lowercase();
    serde_json::from_str(&json).ok()
}

fn arithmetic_bug(error: &Value, instruction: &Value) -> Option<Bug> {
    let kind = match error.get("type")?.as_str()? {
        "overflow" => BugType::Overflow,
        "underflow" => BugType::Underflow,
        _ => return None,
    };
    let pc = usize::try_from(error.get("pc")?.as_u64()?).ok()?;
    let mut bug = Bug::new(pc, kind);
    bug.tool = TOOL.into();
    if let Some(opcode) = instruction.get("opcode").and_then(Value::as_str) {
        bug = bug.with_opcode(opcode.to_uppercase());
    }
    Some(bug)
}
