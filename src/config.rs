//! Per-source tuning and global pipeline settings.

/// Rate limiting and concurrency settings for a single upstream source.
#[derive(Clone, Copy, Debug)]
pub struct SourceConfig {
    pub name: &'static str,
    /// Token-bucket issuance rate.
    pub requests_per_second: f64,
    /// In-flight request cap for this source.
    pub max_concurrent: usize,
    /// Retries on connect/timeout failures only.
    pub max_retries: u32,
    pub timeout_seconds: u64,
}

pub const REDFIN: SourceConfig = SourceConfig {
    name: "redfin",
    requests_per_second: 2.0,
    max_concurrent: 5,
    max_retries: 3,
    timeout_seconds: 30,
};

pub const HARVEST: SourceConfig = SourceConfig {
    name: "homeharvest",
    requests_per_second: 1.0,
    max_concurrent: 3,
    max_retries: 2,
    timeout_seconds: 45,
};

pub const REALTOR: SourceConfig = SourceConfig {
    name: "realtor",
    requests_per_second: 0.5,
    max_concurrent: 3,
    max_retries: 2,
    timeout_seconds: 30,
};

pub const ZILLOW: SourceConfig = SourceConfig {
    name: "zillow",
    requests_per_second: 0.5,
    max_concurrent: 2,
    max_retries: 2,
    timeout_seconds: 30,
};

pub const GOOGLE_SEARCH: SourceConfig = SourceConfig {
    name: "google_search",
    requests_per_second: 0.2,
    max_concurrent: 2,
    max_retries: 1,
    timeout_seconds: 15,
};

pub const FSBO_COM: SourceConfig = SourceConfig {
    name: "fsbo.com",
    requests_per_second: 1.0,
    max_concurrent: 3,
    max_retries: 2,
    timeout_seconds: 30,
};

pub const FORSALEBYOWNER_COM: SourceConfig = SourceConfig {
    name: "forsalebyowner.com",
    requests_per_second: 1.0,
    max_concurrent: 3,
    max_retries: 2,
    timeout_seconds: 30,
};

pub const ZILLOW_FSBO: SourceConfig = SourceConfig {
    name: "zillow_fsbo",
    requests_per_second: 0.5,
    max_concurrent: 2,
    max_retries: 2,
    timeout_seconds: 30,
};

pub const REALTOR_FSBO: SourceConfig = SourceConfig {
    name: "realtor_fsbo",
    requests_per_second: 1.0,
    max_concurrent: 2,
    max_retries: 2,
    timeout_seconds: 45,
};

pub const CRAIGSLIST_FSBO: SourceConfig = SourceConfig {
    name: "craigslist",
    requests_per_second: 0.5,
    max_concurrent: 2,
    max_retries: 2,
    timeout_seconds: 30,
};

/// Rows resolved simultaneously across all sources.
pub const MAX_GLOBAL_CONCURRENCY: usize = 50;

/// Successful cache entries live this long; readers check lazily.
pub const CACHE_TTL_DAYS: i64 = 7;

/// Consecutive failures before a source's circuit opens.
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 10;

/// FSBO area searches stop paginating after this many pages per source.
pub const FSBO_MAX_PAGES: u32 = 3;

/// Shared HTTP connection pool sizing.
pub const POOL_MAX_CONNECTIONS: usize = 100;
pub const POOL_KEEPALIVE_CONNECTIONS: usize = 20;

pub const REDFIN_BASE_URL: &str = "https://www.redfin.com";
pub const REDFIN_STINGRAY_BASE: &str = "https://www.redfin.com/stingray";
pub const REALTOR_BASE_URL: &str = "https://www.realtor.com";
pub const ZILLOW_BASE_URL: &str = "https://www.zillow.com";
pub const GOOGLE_CSE_URL: &str = "https://www.googleapis.com/customsearch/v1";
pub const FSBO_COM_BASE_URL: &str = "https://www.fsbo.com";
pub const FORSALEBYOWNER_BASE_URL: &str = "https://www.forsalebyowner.com";
