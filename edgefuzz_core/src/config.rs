use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CorpusType {
    #[default]
    InMemory,
    OnDisk,
}

impl CorpusType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorpusType::InMemory => "in-memory",
            CorpusType::OnDisk => "on-disk",
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    #[serde(default = "default_corpus_type")]
    pub corpus_type: CorpusType,
    pub initial_seed_paths: Option<Vec<PathBuf>>,
    #[serde(default = "default_on_disk_path")]
    pub on_disk_path: PathBuf,
    #[serde(default = "default_max_corpus_size")]
    pub max_corpus_size: usize,
}

pub fn default_on_disk_path() -> PathBuf {
    PathBuf::from("./.edgefuzz_corpus")
}

fn default_corpus_type() -> CorpusType {
    CorpusType::InMemory
}

pub fn default_max_corpus_size() -> usize {
    4096
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            corpus_type: default_corpus_type(),
            initial_seed_paths: None,
            on_disk_path: default_on_disk_path(),
            max_corpus_size: default_max_corpus_size(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_iterations")]
    pub max_iterations: u64,
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Base seed; worker `n` uses `rng_seed + n`.
    #[serde(default)]
    pub rng_seed: u64,
}

pub fn default_iterations() -> u64 {
    100_000
}
pub fn default_threads() -> usize {
    1
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_iterations(),
            threads: default_threads(),
            rng_seed: 0,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    2000
}

impl ExecutorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EdgefuzzConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub corpus: CorpusConfig,
}

impl EdgefuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
