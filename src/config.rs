use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::fs;

/// Flat runtime configuration. Read once at startup; the orchestration core
/// treats every value as immutable for the lifetime of the process.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub scraping: ScrapingConfig,
    #[serde(default)]
    pub collaborators: CollaboratorConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Stage keys to run, in the fixed pipeline order. Stages absent here are
    /// skipped entirely and never show up in stage details.
    pub enabled_stages: Vec<String>,
    /// When true the scheduler re-runs the pipeline every `interval_minutes`.
    pub auto_mode: bool,
    pub run_immediately_on_start: bool,
    pub interval_minutes: u64,
    /// Poll tick while waiting on scraping jobs.
    pub scrape_poll_secs: u64,
    /// Poll tick for the batch-processing stages.
    pub batch_poll_secs: u64,
    /// Hard wall-clock cap per stage, measured from stage start.
    pub max_stage_wait_secs: u64,
    /// TTL of the per-subscriber event de-duplication window.
    pub debounce_ttl_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled_stages: vec![
                "scraping".to_string(),
                "photo_processing".to_string(),
                "duplicate_processing".to_string(),
                "realtor_detection".to_string(),
                "elasticsearch_reindex".to_string(),
            ],
            auto_mode: false,
            run_immediately_on_start: false,
            interval_minutes: 360,
            scrape_poll_secs: 5,
            batch_poll_secs: 30,
            max_stage_wait_secs: 3600,
            debounce_ttl_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrapingConfig {
    pub sources: Vec<String>,
    /// Worker invocation; `{source}` in an argument is replaced with the
    /// source name at submit time.
    pub worker_command: String,
    pub worker_args: Vec<String>,
    /// Ring-buffer cap for each job's retained log lines.
    pub log_tail_lines: usize,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            sources: vec![
                "stroka".to_string(),
                "house".to_string(),
                "lalafo".to_string(),
                "agency".to_string(),
                "an".to_string(),
            ],
            worker_command: "scrapy".to_string(),
            worker_args: vec!["crawl".to_string(), "{source}".to_string()],
            log_tail_lines: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollaboratorConfig {
    /// Base URL of the processing backend that implements the batch stages.
    pub base_url: String,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let config_content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read config file '{}': {}", path, e))
        })?;

        let config: Config = toml::from_str(&config_content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_stage() {
        let config = Config::default();
        assert_eq!(config.pipeline.enabled_stages.len(), 5);
        assert_eq!(config.pipeline.interval_minutes, 360);
        assert!(!config.pipeline.auto_mode);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            [pipeline]
            enabled_stages = ["scraping"]
            max_stage_wait_secs = 60

            [scraping]
            sources = ["lalafo"]
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.enabled_stages, vec!["scraping"]);
        assert_eq!(config.pipeline.max_stage_wait_secs, 60);
        assert_eq!(config.pipeline.scrape_poll_secs, 5);
        assert_eq!(config.scraping.sources, vec!["lalafo"]);
        assert_eq!(config.scraping.worker_command, "scrapy");
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn load_reads_a_file_and_reports_missing_ones() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pipeline]\nauto_mode = true").unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert!(config.pipeline.auto_mode);

        assert!(Config::load("/nonexistent/config.toml").is_err());
    }
}
