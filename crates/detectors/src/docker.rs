//! Detectors run as docker containers.

use crate::{mythril, osiris, oyente, Detector, DetectorConfig};
use async_trait::async_trait;
use salve_core::bug::Bug;
use salve_core::decoder::normalize_hex_string;
use salve_utils::errors::DetectorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// The supported detector images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    /// Integer bugs.
    Osiris,
    /// Reentrancy.
    Oyente,
    /// Unchecked calls, ether leaks, self-destructs, delegatecalls and `tx.origin`.
    Mythril,
}

impl Tool {
    /// Every supported tool.
    pub const ALL: [Self; 3] = [Self::Osiris, Self::Oyente, Self::Mythril];

    /// Name reported in bug records.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Osiris => osiris::TOOL,
            Self::Oyente => oyente::TOOL,
            Self::Mythril => mythril::TOOL,
        }
    }

    /// Docker image of the tool.
    pub const fn image(self) -> &'static str {
        match self {
            Self::Osiris => "christoftorres/osiris",
            Self::Oyente => "christoftorres/oyente",
            Self::Mythril => "christoftorres/mythril",
        }
    }

    /// Container arguments analyzing `bytecode`, which must be plain hex.
    fn container_args(self, bytecode: &str) -> Vec<String> {
        // stderr is merged inside the container to keep the log lines in order
        let script = |analyze: &str| {
            vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                format!("echo '{bytecode}' > bytecode.evm; {analyze} 2>&1"),
            ]
        };
        match self {
            Self::Osiris => script("python osiris/osiris.py -s bytecode.evm -glt 1800 -b --debug"),
            Self::Oyente => script("python3 oyente/oyente.py -s bytecode.evm -b"),
            Self::Mythril => [
                "-v",
                "5",
                "analyze",
                "-m",
                "UncheckedRetval,EtherThief,AccidentallyKillable,ArbitraryDelegateCall,TxOrigin",
                "--bin-runtime",
                "-c",
                bytecode,
                "--parallel-solving",
                "-o",
                "json",
                "--execution-timeout",
                "120",
            ]
            .map(String::from)
            .to_vec(),
        }
    }

    /// Extracts the bugs from a container log.
    pub fn parse(self, log: &str) -> Result<Vec<Bug>, DetectorError> {
        match self {
            Self::Osiris => Ok(osiris::parse(log)),
            Self::Oyente => Ok(oyente::parse(log)),
            Self::Mythril => mythril::parse(log),
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Tool {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tool| tool.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| DetectorError::UnknownTool(s.to_string()))
    }
}

/// Runs one [`Tool`] through the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerDetector {
    tool: Tool,
    config: DetectorConfig,
}

impl DockerDetector {
    /// Detector for `tool` with the given settings.
    pub const fn new(tool: Tool, config: DetectorConfig) -> Self {
        Self { tool, config }
    }

    /// The `docker` invocation analyzing `bytecode`.
    fn command(&self, bytecode: &str) -> Command {
        let mut command = Command::new(&self.config.docker);
        command
            .args(["run", "--rm", self.tool.image()])
            .args(self.tool.container_args(bytecode))
            .kill_on_drop(true);
        command
    }

    /// Runs the container once and returns its combined output.
    async fn run_once(&self, bytecode: &str) -> Result<String, DetectorError> {
        let output = timeout(self.config.timeout, self.command(bytecode).output())
            .await
            .map_err(|_| DetectorError::Timeout {
                tool: self.tool.name().into(),
                secs: self.config.timeout.as_secs(),
            })?
            .map_err(|source| DetectorError::Spawn {
                tool: self.tool.name().into(),
                source,
            })?;

        if !output.status.success() {
            debug!("{} exited with {}", self.tool, output.status);
        }
        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push('\n');
        log.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(log)
    }
}

#[async_trait]
impl Detector for DockerDetector {
    fn name(&self) -> &str {
        self.tool.name()
    }

    async fn analyze(&self, runtime_hex: &str) -> Result<Vec<Bug>, DetectorError> {
        let bytecode = normalize_hex_string(runtime_hex)?;
        info!("Running {}...", self.tool);
        let start = Instant::now();

        let mut attempt = 0;
        let log = loop {
            attempt += 1;
            match self.run_once(&bytecode).await {
                Ok(log) => break log,
                Err(e @ (DetectorError::Timeout { .. } | DetectorError::Spawn { .. }))
                    if attempt <= self.config.retries =>
                {
                    warn!("{e}, retrying ({attempt}/{})", self.config.retries);
                }
                Err(e) => return Err(e),
            }
        };

        let mut bugs = self.tool.parse(&log)?;
        let elapsed = start.elapsed().as_secs_f64();
        for bug in &mut bugs {
            bug.execution_time = elapsed;
        }
        info!(
            "Finished running {} in {elapsed:.2}s, coverage {:.2}%",
            self.tool,
            bugs.first().map_or(0.0, |bug| bug.code_coverage)
        );
        Ok(bugs)
    }
}
