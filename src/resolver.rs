//! Track id to stream URL resolution.
//!
//! The [`Resolver`] sits in front of a slow [`Extractor`] and caches what it
//! returns for the configured freshness window. It is shared by handle
//! between the proxy and whatever synchronizes playlists; every test gets
//! its own instance and therefore its own cache.
//!
//! # Failure handling
//!
//! A failed resolution is never cached. Network failures are retried once
//! after a short delay; every other [`ResolveError`] is returned as is,
//! since asking again for a private or region-locked track only wastes
//! time.
//!
//! # Batches
//!
//! [`Resolver::resolve_batch`] resolves with at most `batch_concurrency`
//! extractions in flight and reports failures only by leaving the id out of
//! the result. Calls to the extractor additionally pass through a rate
//! limiter of 50 calls per 5 seconds.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamrelay::{extractor::YtDlp, resolver::{Options, Resolver}};
//!
//! async fn example() {
//!     let resolver = Resolver::new(Arc::new(YtDlp::default()), Options::default());
//!     let urls = resolver.resolve_batch(["dQw4w9WgXcQ", "9bZkp7q19f0"]).await;
//!     for (id, url) in &urls {
//!         println!("{id} {url}");
//!     }
//! }
//! ```

use std::{
    collections::{HashMap, HashSet},
    num::NonZeroU32,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use futures_util::{stream, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota};
use url::Url;

use crate::{
    cache::{CacheStats, StreamCache},
    extractor::{Extractor, ResolveError},
};

/// Resolver tuning.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    /// How long a resolution may be served from cache.
    pub window: Duration,

    /// Maximum extractions in flight during a batch.
    pub batch_concurrency: usize,

    /// Delay before the single retry of a network failure.
    pub network_retry_delay: Duration,

    /// Where to persist the cache, if anywhere.
    pub cache_file: Option<PathBuf>,
}

impl Options {
    /// Upstream URLs live for about six hours.
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5 * 60 * 60);
    /// Extractions in flight at once during a batch.
    pub const DEFAULT_BATCH_CONCURRENCY: usize = 10;
    pub const DEFAULT_NETWORK_RETRY_DELAY: Duration = Duration::from_secs(1);
}

impl Default for Options {
    fn default() -> Self {
        Self {
            window: Self::DEFAULT_WINDOW,
            batch_concurrency: Self::DEFAULT_BATCH_CONCURRENCY,
            network_retry_delay: Self::DEFAULT_NETWORK_RETRY_DELAY,
            cache_file: None,
        }
    }
}

/// Caching front for an [`Extractor`].
pub struct Resolver {
    extractor: Arc<dyn Extractor>,
    cache: StreamCache,
    rate_limiter: DefaultDirectRateLimiter,
    batch_concurrency: usize,
    network_retry_delay: Duration,
    cache_file: Option<PathBuf>,

    /// Serializes writers of `cache_file`.
    save_lock: tokio::sync::Mutex<()>,
}

impl Resolver {
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);
    const RATE_LIMIT_CALLS_PER_INTERVAL: u32 = 50;

    /// Progress is logged every this many batch items.
    const PROGRESS_INTERVAL: usize = 10;

    /// Creates a resolver, loading the cache file if one is configured.
    ///
    /// A cache file that cannot be read is logged and otherwise ignored.
    #[must_use]
    pub fn new(extractor: Arc<dyn Extractor>, options: Options) -> Self {
        let cache = StreamCache::new(options.window);
        if let Some(path) = &options.cache_file {
            match cache.load(path) {
                Ok(count) if count > 0 => {
                    info!("restored {count} cached stream urls from {}", path.display());
                }
                Ok(_) => {}
                Err(e) => warn!("ignoring cache file {}: {e}", path.display()),
            }
        }

        let replenish_interval = Self::RATE_LIMIT_INTERVAL / Self::RATE_LIMIT_CALLS_PER_INTERVAL;
        let quota = Quota::with_period(replenish_interval)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL).unwrap_or(NonZeroU32::MIN),
            );

        Self {
            extractor,
            cache,
            rate_limiter: governor::RateLimiter::direct(quota),
            batch_concurrency: options.batch_concurrency.max(1),
            network_retry_delay: options.network_retry_delay,
            cache_file: options.cache_file,
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns a current stream URL for `track_id`.
    ///
    /// Serves a fresh cache entry when there is one and otherwise asks the
    /// extractor, caching the result on success.
    ///
    /// # Errors
    ///
    /// Returns the classified failure when the track cannot be resolved.
    pub async fn resolve(&self, track_id: &str) -> Result<Url, ResolveError> {
        let (url, extracted) = self.lookup(track_id).await?;
        if extracted {
            self.persist().await;
        }
        Ok(url)
    }

    /// Resolves many tracks with bounded concurrency.
    ///
    /// Every id is attempted, in no particular order. The result holds only
    /// the successes; a missing id means that track should be skipped.
    pub async fn resolve_batch<I, S>(&self, track_ids: I) -> HashMap<String, Url>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let track_ids: Vec<String> = track_ids
            .into_iter()
            .map(Into::into)
            .filter(|id| seen.insert(id.clone()))
            .collect();

        let total = track_ids.len();
        let mut urls = HashMap::with_capacity(total);
        let mut failed = 0;
        let mut extracted_any = false;

        let mut results = stream::iter(track_ids)
            .map(|track_id| async move {
                let result = self.lookup(&track_id).await;
                (track_id, result)
            })
            .buffer_unordered(self.batch_concurrency);

        let mut done = 0;
        while let Some((track_id, result)) = results.next().await {
            done += 1;
            match result {
                Ok((url, extracted)) => {
                    extracted_any |= extracted;
                    urls.insert(track_id, url);
                }
                Err(e) => {
                    failed += 1;
                    warn!("skipping {track_id}: {e}");
                }
            }

            if done % Self::PROGRESS_INTERVAL == 0 && done < total {
                debug!("resolved {done}/{total} tracks");
            }
        }

        info!(
            "resolved {} of {total} tracks ({failed} failed)",
            urls.len()
        );

        if extracted_any {
            self.persist().await;
        }

        urls
    }

    /// Forgets the cached URL for `track_id`, for instance after the
    /// upstream refused it while it was still considered fresh.
    pub fn invalidate(&self, track_id: &str) {
        if self.cache.remove(track_id) {
            debug!("invalidated cached url for {track_id}");
        }
    }

    /// Forgets every cached URL.
    pub fn clear(&self) {
        let count = self.cache.clear();
        info!("cleared {count} cached stream urls");
    }

    /// Counts of cached URLs, split by freshness.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// How long a resolution is served from cache.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.cache.window()
    }

    /// Cache lookup with fallback to extraction. The flag tells whether the
    /// extractor was called.
    async fn lookup(&self, track_id: &str) -> Result<(Url, bool), ResolveError> {
        if let Some(url) = self.cache.get(track_id) {
            trace!("cache hit for {track_id}");
            return Ok((url, false));
        }

        let url = match self.extract(track_id).await {
            Err(e) if e.is_retryable() => {
                debug!(
                    "resolving {track_id} failed: {e}; retrying in {}ms",
                    self.network_retry_delay.as_millis()
                );
                tokio::time::sleep(self.network_retry_delay).await;
                self.extract(track_id).await
            }
            result => result,
        }?;

        debug!(
            "resolved {track_id} to {}",
            url.host_str().unwrap_or("unknown host")
        );
        self.cache.insert(track_id, url.clone());
        Ok((url, true))
    }

    async fn extract(&self, track_id: &str) -> Result<Url, ResolveError> {
        self.rate_limiter.until_ready().await;

        let url = self.extractor.extract(track_id).await?;
        Url::parse(url.trim())
            .map_err(|e| ResolveError::Extraction(format!("invalid stream url: {e}")))
    }

    async fn persist(&self) {
        let Some(path) = &self.cache_file else {
            return;
        };

        let _guard = self.save_lock.lock().await;
        if let Err(e) = self.cache.save(path).await {
            warn!("could not save cache file {}: {e}", path.display());
        }
    }
}
