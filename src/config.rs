//! Configuration file handling.
//!
//! Settings are read from a TOML file with three optional sections. Every
//! key has a default, so an empty or missing file is a valid configuration:
//!
//! ```toml
//! [proxy]
//! host = "localhost"
//! port = 8080
//! max_concurrent_streams = 10
//!
//! [resolver]
//! cache_hours = 5.0
//! cache_file = "~/.cache/streamrelay/urls.json"
//!
//! [store]
//! path = "~/.config/streamrelay/tracks.db"
//! ```
//!
//! Paths may start with `~`, which expands to the home directory.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, ErrorKind, Result},
    extractor::YtDlp,
    icy,
    resolver::Options,
};

/// Complete application configuration.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub resolver: ResolverConfig,
    pub store: StoreConfig,
}

/// The streaming proxy and its upstream fetches.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub max_concurrent_streams: usize,
    pub upstream_retries: u32,
    pub upstream_backoff_ms: u64,
    pub upstream_connect_timeout_secs: u64,
    pub upstream_read_timeout_secs: u64,
    pub icy_metaint: usize,
}

impl ProxyConfig {
    /// Delay before the first retry of an upstream fetch; doubled for each
    /// further retry.
    #[must_use]
    pub fn upstream_backoff(&self) -> Duration {
        Duration::from_millis(self.upstream_backoff_ms)
    }

    #[must_use]
    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout_secs)
    }

    #[must_use]
    pub fn upstream_read_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_read_timeout_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 8080,
            max_concurrent_streams: 10,
            upstream_retries: 3,
            upstream_backoff_ms: 1_000,
            upstream_connect_timeout_secs: 10,
            upstream_read_timeout_secs: 15,
            icy_metaint: icy::DEFAULT_INTERVAL,
        }
    }
}

/// URL resolution and caching.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    /// Freshness window of cached URLs, in hours.
    pub cache_hours: f64,
    pub batch_concurrency: usize,
    pub network_retry_delay_ms: u64,
    pub extract_timeout_secs: u64,
    pub ytdlp_path: PathBuf,
    pub cache_file: Option<PathBuf>,
}

impl ResolverConfig {
    /// Lifetime of upstream stream URLs. The window should stay below it.
    pub const UPSTREAM_URL_LIFETIME_HOURS: f64 = 6.0;

    /// Freshness window as a `Duration`.
    ///
    /// Falls back to the default window if `cache_hours` is not representable.
    #[must_use]
    pub fn cache_window(&self) -> Duration {
        Duration::try_from_secs_f64(self.cache_hours * 3600.0).unwrap_or(Options::DEFAULT_WINDOW)
    }

    #[must_use]
    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    /// Resolver options derived from these settings.
    #[must_use]
    pub fn options(&self) -> Options {
        Options {
            window: self.cache_window(),
            batch_concurrency: self.batch_concurrency,
            network_retry_delay: Duration::from_millis(self.network_retry_delay_ms),
            cache_file: self.cache_file.clone(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_hours: 5.0,
            batch_concurrency: Options::DEFAULT_BATCH_CONCURRENCY,
            network_retry_delay_ms: 1_000,
            extract_timeout_secs: YtDlp::DEFAULT_TIMEOUT.as_secs(),
            ytdlp_path: PathBuf::from("yt-dlp"),
            cache_file: None,
        }
    }
}

/// The track metadata store.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let path = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(env!("CARGO_PKG_NAME"))
            .join("tracks.db");
        Self { path }
    }
}

impl Config {
    /// Where the configuration lives when no path is given.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(env!("CARGO_PKG_NAME")).join("config.toml"))
    }

    /// Loads the configuration.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// tried and defaults are used if there is no file there.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or holds
    /// invalid values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) => match Self::from_file(&path) {
                    Err(e) if e.kind == ErrorKind::NotFound => {
                        debug!("no configuration at {}; using defaults", path.display());
                        Self::default().finish()
                    }
                    result => result,
                },
                None => Self::default().finish(),
            },
        }
    }

    /// Loads and validates the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or holds
    /// invalid values.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config = Self::parse(&contents)?;
        debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parses and validates TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML does not parse or holds invalid values.
    pub fn parse(toml: &str) -> Result<Self> {
        toml::from_str::<Self>(toml)?.finish()
    }

    fn finish(mut self) -> Result<Self> {
        self.expand_paths();
        self.validate()?;
        Ok(self)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let proxy = &self.proxy;
        let resolver = &self.resolver;

        if !(resolver.cache_hours.is_finite() && resolver.cache_hours > 0.0) {
            return Err(Error::invalid_argument(format!(
                "resolver.cache_hours must be positive but is {}",
                resolver.cache_hours
            )));
        }
        if resolver.cache_hours >= ResolverConfig::UPSTREAM_URL_LIFETIME_HOURS {
            warn!(
                "resolver.cache_hours is {} but upstream urls expire after about {} hours; \
                 playback may fail on cached urls",
                resolver.cache_hours,
                ResolverConfig::UPSTREAM_URL_LIFETIME_HOURS
            );
        }
        if resolver.batch_concurrency == 0 {
            return Err(Error::invalid_argument(
                "resolver.batch_concurrency must be at least 1",
            ));
        }
        if proxy.port == 0 {
            return Err(Error::invalid_argument("proxy.port must not be 0"));
        }
        if proxy.host.is_empty() {
            return Err(Error::invalid_argument("proxy.host must not be empty"));
        }
        if proxy.max_concurrent_streams == 0 {
            return Err(Error::invalid_argument(
                "proxy.max_concurrent_streams must be at least 1",
            ));
        }
        if proxy.icy_metaint == 0 {
            return Err(Error::invalid_argument("proxy.icy_metaint must be at least 1"));
        }

        Ok(())
    }

    fn expand_paths(&mut self) {
        self.store.path = expand_home(&self.store.path);
        self.resolver.ytdlp_path = expand_home(&self.resolver.ytdlp_path);
        if let Some(cache_file) = &self.resolver.cache_file {
            self.resolver.cache_file = Some(expand_home(cache_file));
        }
    }
}

/// Replaces a leading `~` with the home directory.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
