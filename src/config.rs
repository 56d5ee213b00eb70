//! Execution settings, loaded from the `[execution]` table of a TOML file

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Configuration for executing work graphs
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Worker capacity shared by every build of the tree
    pub max_workers: usize,
    /// Let tasks of different projects run at the same time (default: true)
    pub parallel_projects: bool,
    /// Stop starting new tasks after the first failure (default: false)
    pub fail_fast: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            parallel_projects: true,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    execution: Option<ExecutionConfig>,
}

impl ExecutionConfig {
    /// Load settings from a config file. A missing file or a file without an
    /// `[execution]` table yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content).context("Invalid TOML")?;
        let config = file.execution.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            bail!("execution.max_workers must be at least 1");
        }
        Ok(())
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_parallel_projects(mut self, parallel_projects: bool) -> Self {
        self.parallel_projects = parallel_projects;
        self
    }
}
