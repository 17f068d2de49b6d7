use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Empty means everyone may talk to the bot.
    #[serde(default)]
    pub allowed_user_ids: Vec<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Per-attempt timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Largest body read or inflated for one response.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_accept_language")]
    pub accept_language: String,
    #[serde(default = "default_cookie_directory")]
    pub cookie_directory: PathBuf,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_redirects: default_max_redirects(),
            max_body_bytes: default_max_body_bytes(),
            user_agent: default_user_agent(),
            accept_language: default_accept_language(),
            cookie_directory: default_cookie_directory(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// 0 or 1 keeps the delay fixed.
    #[serde(default)]
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff_factor: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Messages processed at the same time.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PluginsConfig {
    #[serde(default)]
    pub unshortener: UnshortenerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub tags: TagsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UnshortenerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_shorteners")]
    pub hosts: Vec<String>,
}

impl Default for UnshortenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hosts: default_shorteners(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_store_base_url")]
    pub base_url: String,
    /// Country code passed as `cc`, decides the currency of listed prices.
    #[serde(default = "default_store_country")]
    pub country: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_store_base_url(),
            country: default_store_country(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TagsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tags_limit")]
    pub limit: usize,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: default_tags_limit(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_max_redirects() -> usize {
    10
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_user_agent() -> String {
    "Googlebot/2.1 (+http://www.googlebot.com/bot.html)".to_string()
}

fn default_accept_language() -> String {
    "en-US,en;q=0.5".to_string()
}

fn default_cookie_directory() -> PathBuf {
    PathBuf::from("cookies")
}

fn default_max_attempts() -> u32 {
    2
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_max_concurrent() -> usize {
    8
}

fn default_enabled() -> bool {
    true
}

fn default_shorteners() -> Vec<String> {
    [
        "bit.ly",
        "bitly.com",
        "cli.gs",
        "fb.me",
        "go.ign.com",
        "goo.gl",
        "is.gd",
        "kck.st",
        "ls.gd",
        "nblo.gs",
        "ow.ly",
        "short.to",
        "t.co",
        "tiny.cc",
        "tinyurl.com",
        "tr.im",
        "trib.al",
        "vk.cc",
        "whrt.it",
        "plgn.co",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_store_base_url() -> String {
    "http://store.steampowered.com".to_string()
}

fn default_store_country() -> String {
    "ru".to_string()
}

fn default_tags_limit() -> usize {
    20
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if !config.http.cookie_directory.exists() {
            std::fs::create_dir_all(&config.http.cookie_directory).with_context(|| {
                format!(
                    "Failed to create cookie directory: {}",
                    config.http.cookie_directory.display()
                )
            })?;
        }

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid configuration")
    }

    /// Cookie jar file for one remote service.
    pub fn cookie_jar_path(&self, service: &str) -> PathBuf {
        self.http
            .cookie_directory
            .join(format!("{}.cookies", service))
    }
}
