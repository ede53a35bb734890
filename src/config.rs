use dotenvy::dotenv;
use once_cell::sync::Lazy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::batch::RetryPolicy;
use crate::errors::ConfigError;

pub static CONFIG: Lazy<Config> = Lazy::new(|| {
    dotenv().ok(); // Load .env file if present
    Config {
        anthropic_api_key: get_env_opt("ANTHROPIC_API_KEY"),
        judge_model: get_env_or_default("JUDGE_MODEL", "claude-3-5-haiku-latest"),
        judge_base_url: get_env_or_default("JUDGE_BASE_URL", "https://api.anthropic.com"),
        tavily_api_key: get_env_opt("TAVILY_API_KEY"),
        extract_base_url: get_env_or_default("EXTRACT_BASE_URL", "https://api.tavily.com"),
        proxy_base_url: get_env_or_default("PROXY_BASE_URL", "https://r.jina.ai"),
        research_mode: get_env_or_default("RESEARCH_MODE", "standard"),
    }
});

pub struct Config {
    pub anthropic_api_key: Option<String>,
    pub judge_model: String,
    pub judge_base_url: String,
    pub tavily_api_key: Option<String>,
    pub extract_base_url: String,
    pub proxy_base_url: String,
    pub research_mode: String,
}

fn get_env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn get_env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Thresholds of the decision gate.
///
/// Only constructible through [`RelevanceConfig::new`], which enforces
/// `1 <= min_short <= min_full <= max_sources` and a cutoff in `1..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelevanceConfig {
    relevance_cutoff: u8,
    min_sources_short_report: usize,
    min_sources_full_report: usize,
    max_sources: usize,
}

impl RelevanceConfig {
    pub fn new(
        relevance_cutoff: u8,
        min_sources_short_report: usize,
        min_sources_full_report: usize,
        max_sources: usize,
    ) -> Result<Self, ConfigError> {
        if !(1..=5).contains(&relevance_cutoff) {
            return Err(ConfigError::CutoffOutOfRange(relevance_cutoff));
        }
        if min_sources_short_report == 0 {
            return Err(ConfigError::ZeroShortThreshold);
        }
        if min_sources_short_report > min_sources_full_report {
            return Err(ConfigError::ShortAboveFull {
                short: min_sources_short_report,
                full: min_sources_full_report,
            });
        }
        if min_sources_full_report > max_sources {
            return Err(ConfigError::FullAboveMax {
                full: min_sources_full_report,
                max: max_sources,
            });
        }
        Ok(Self {
            relevance_cutoff,
            min_sources_short_report,
            min_sources_full_report,
            max_sources,
        })
    }

    pub fn relevance_cutoff(&self) -> u8 {
        self.relevance_cutoff
    }

    pub fn min_sources_short_report(&self) -> usize {
        self.min_sources_short_report
    }

    pub fn min_sources_full_report(&self) -> usize {
        self.min_sources_full_report
    }

    pub fn max_sources(&self) -> usize {
        self.max_sources
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResearchMode {
    Quick,
    #[default]
    Standard,
    Deep,
}

impl ResearchMode {
    pub fn relevance(self) -> Result<RelevanceConfig, ConfigError> {
        match self {
            ResearchMode::Quick => RelevanceConfig::new(3, 1, 3, 5),
            ResearchMode::Standard => RelevanceConfig::new(3, 2, 4, 10),
            ResearchMode::Deep => RelevanceConfig::new(3, 3, 6, 20),
        }
    }
}

impl FromStr for ResearchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(ResearchMode::Quick),
            "standard" => Ok(ResearchMode::Standard),
            "deep" => Ok(ResearchMode::Deep),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_concurrent: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_concurrent: 5,
        }
    }
}

/// Sites that usually need JS rendering or fight scrapers. Only these are
/// sent to the paid extraction layer.
pub const DEFAULT_HIGH_VALUE_DOMAINS: &[&str] = &[
    "linkedin.com",
    "medium.com",
    "substack.com",
    "reddit.com",
    "x.com",
    "twitter.com",
    "quora.com",
    "bloomberg.com",
    "wsj.com",
    "ft.com",
    "nytimes.com",
    "forbes.com",
    "crunchbase.com",
    "glassdoor.com",
    "g2.com",
];

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub proxy_base_url: String,
    pub proxy_timeout: Duration,
    pub proxy_concurrency: usize,
    pub extract_base_url: String,
    pub extract_api_key: Option<String>,
    pub extract_timeout: Duration,
    pub min_content_chars: usize,
    pub min_snippet_chars: usize,
    pub high_value_domains: Vec<String>,
    pub retry: RetryPolicy,
    pub overload_backoff: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            proxy_base_url: "https://r.jina.ai".to_string(),
            proxy_timeout: Duration::from_secs(10),
            proxy_concurrency: 5,
            extract_base_url: "https://api.tavily.com".to_string(),
            extract_api_key: None,
            extract_timeout: Duration::from_secs(30),
            min_content_chars: 200,
            min_snippet_chars: 50,
            high_value_domains: DEFAULT_HIGH_VALUE_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
            retry: RetryPolicy {
                max_retries: 1,
                retry_delay: Duration::from_secs(1),
                ..RetryPolicy::default()
            },
            overload_backoff: Duration::from_secs(2),
        }
    }
}

impl RecoveryConfig {
    pub fn from_env() -> Self {
        Self {
            proxy_base_url: CONFIG.proxy_base_url.clone(),
            extract_base_url: CONFIG.extract_base_url.clone(),
            extract_api_key: CONFIG.tavily_api_key.clone(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub batch_size: usize,
    pub chunk_concurrency: usize,
    pub inter_batch_delay: Duration,
    pub overload_backoff: Duration,
    pub retry: RetryPolicy,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub max_content_chars: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            chunk_concurrency: 3,
            inter_batch_delay: Duration::ZERO,
            overload_backoff: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            model: "claude-3-5-haiku-latest".to_string(),
            max_tokens: 150,
            timeout: Duration::from_secs(30),
            max_content_chars: 6000,
        }
    }
}

impl ScoringConfig {
    pub fn from_env() -> Self {
        Self {
            model: CONFIG.judge_model.clone(),
            ..Self::default()
        }
    }
}
