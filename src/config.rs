use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the mirror
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub cloak: CloakConfig,

    #[serde(default)]
    pub crawlers: CrawlerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Mirror is reached over https; only affects scheme rewriting and
    /// response header hygiene, TLS itself is terminated in front of us
    #[serde(default)]
    pub tls: bool,

    /// Path prefix served from `image_root` instead of being mirrored
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,

    /// Directory holding the files behind `image_prefix`
    #[serde(default = "default_image_root")]
    pub image_root: String,

    /// Path that refreshes the site registry and reports `{"code":200}`
    #[serde(default = "default_status_path")]
    pub status_path: String,

    /// HTML file shown to cloaked visitors (built-in page if unset or unreadable)
    pub not_found_page: Option<String>,

    /// SQLite database holding site records
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            tls: false,
            image_prefix: default_image_prefix(),
            image_root: default_image_root(),
            status_path: default_status_path(),
            not_found_page: None,
            database: default_database(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Root directory of the response cache
    #[serde(default = "default_cache_root")]
    pub root: String,

    /// Store origin images verbatim next to cached pages
    #[serde(default)]
    pub save_images: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            save_images: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Outbound proxy for origin fetches (empty = direct)
    #[serde(default)]
    pub web_proxy: String,

    /// Origin request timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per origin host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Route links to third-party hosts through the mirror's tunnel
    #[serde(default = "default_true")]
    pub allow_external: bool,

    /// Third-party hosts that are never tunneled
    #[serde(default)]
    pub external_ignores: Vec<String>,
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn proxy_url(&self) -> Option<&str> {
        let proxy = self.web_proxy.trim();
        (!proxy.is_empty()).then_some(proxy)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            web_proxy: String::new(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            allow_external: true,
            external_ignores: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CloakConfig {
    /// 0 = never cloak, 1 = cloak non-crawlers, 2 = cloak mobile non-crawlers
    #[serde(default)]
    pub jump_mode: u8,

    /// Also cloak non-crawler home page hits on apex/www/m hosts
    #[serde(default)]
    pub jump_index: bool,

    /// Only clients on the spider IP allow-list see mirrored content
    #[serde(default)]
    pub simulate_spiders: bool,

    /// Files with one allowed spider IP per line
    #[serde(default)]
    pub spider_ip_files: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlerConfig {
    /// User-agent substrings identifying any crawler (case-insensitive)
    #[serde(default = "default_recognized_crawlers")]
    pub recognized: Vec<String>,

    /// Crawlers that are served mirrored content
    #[serde(default = "default_approved_crawlers")]
    pub approved: Vec<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            recognized: default_recognized_crawlers(),
            approved: default_approved_crawlers(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_image_prefix() -> String {
    "/images/".to_string()
}

fn default_image_root() -> String {
    ".".to_string()
}

fn default_status_path() -> String {
    "/notice/api".to_string()
}

fn default_database() -> String {
    "data/mirror.db".to_string()
}

fn default_cache_root() -> String {
    "./runtime/mirror/cache".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_true() -> bool {
    true
}

fn default_recognized_crawlers() -> Vec<String> {
    [
        "TencentTraveler",
        "Baiduspider+",
        "Yisouspider",
        "BaiduGame",
        "Googlebot",
        "msnbot",
        "Sosospider+",
        "Sogou web spider",
        "ia_archiver",
        "Yahoo! Slurp",
        "YoudaoBot",
        "Yahoo Slurp",
        "MSNBot",
        "Java (Often spam bot)",
        "BaiDuSpider",
        "Voila",
        "Yandex bot",
        "BSpider",
        "twiceler",
        "Sogou Spider",
        "Speedy Spider",
        "Google AdSense",
        "Heritrix",
        "Python-urllib",
        "Alexa (IA Archiver)",
        "Ask",
        "Exabot",
        "Custo",
        "OutfoxBot/YodaoBot",
        "yacy",
        "SurveyBot",
        "legs",
        "lwp-trivial",
        "Nutch",
        "StackRambler",
        "The web archive (IA Archiver)",
        "Perl tool",
        "MJ12bot",
        "Netcraft",
        "MSIECrawler",
        "WGet tools",
        "larbin",
        "Fish search",
        "MauiBot",
        "MegaIndex",
        "DotBot",
        "AlphaBot",
        "AhrefsBot",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_approved_crawlers() -> Vec<String> {
    [
        "baiduspider",
        "Yisouspider",
        "360spider",
        "haosouspider",
        "sogou",
        "sosospider",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        }
        if !self.server.image_prefix.starts_with('/') {
            errors.push("server: 'image_prefix' must start with '/'".to_string());
        }
        if !self.server.status_path.starts_with('/') {
            errors.push("server: 'status_path' must start with '/'".to_string());
        }
        if self.cache.root.trim().is_empty() {
            errors.push("cache: 'root' must not be empty".to_string());
        }
        if self.cloak.jump_mode > 2 {
            errors.push(format!(
                "cloak: 'jump_mode' must be 0, 1 or 2 (got {})",
                self.cloak.jump_mode
            ));
        }
        if self.upstream.request_timeout_secs == 0 {
            errors.push("upstream: 'request_timeout_secs' must be greater than 0".to_string());
        }
        if let Some(proxy) = self.upstream.proxy_url() {
            if !proxy.contains("://") {
                errors.push(format!("upstream: 'web_proxy' is not a URL: {}", proxy));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
