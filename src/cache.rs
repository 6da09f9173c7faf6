//! Freshness-windowed cache of resolved stream URLs.
//!
//! Upstream stream URLs are signed and expire after a few hours. The cache
//! keeps the last successful resolution per track and serves it only while
//! it is younger than the freshness window, which must be configured to
//! sit inside the upstream lifetime so playback started on a fresh URL can
//! finish before the URL expires.
//!
//! Entries are replaced wholesale on re-resolution, never mutated. Stale
//! entries are never served: a lookup that finds one removes it, and saving
//! prunes all of them.
//!
//! The cache can be saved to and loaded from a JSON file, so a restart does
//! not cost a full round of re-resolution.

use std::{
    collections::HashMap,
    fs, io,
    path::Path,
    sync::{PoisonError, RwLock},
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, TimestampSecondsWithFrac};
use url::Url;
use veil::Redact;

use crate::error::Result;

/// One successful resolution.
///
/// The URL is signed by the upstream and grants access to the stream, so
/// it is redacted from `Debug` output.
#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Redact)]
pub struct ResolvedStream {
    #[redact]
    pub url: Url,

    #[serde_as(as = "TimestampSecondsWithFrac<f64>")]
    pub resolved_at: SystemTime,
}

impl ResolvedStream {
    /// A resolution made just now.
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            resolved_at: SystemTime::now(),
        }
    }

    /// Time elapsed since resolution. `None` if the clock went backwards.
    #[must_use]
    pub fn age(&self) -> Option<Duration> {
        SystemTime::now().duration_since(self.resolved_at).ok()
    }
}

/// A resolution together with the window it is valid for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub stream: ResolvedStream,
    pub window: Duration,
}

impl CacheEntry {
    /// Whether the entry may still be served.
    ///
    /// An entry whose age cannot be determined is stale.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.stream.age().is_some_and(|age| age < self.window)
    }
}

/// Snapshot of the cache contents.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub fresh: usize,
    pub stale: usize,
}

/// Map from track id to the most recent resolution.
#[derive(Debug)]
pub struct StreamCache {
    window: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl StreamCache {
    /// Creates an empty cache serving entries younger than `window`.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// How long entries stay fresh.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// The cached URL for `track_id`, if there is one and it is fresh.
    ///
    /// A stale entry found on the way is removed.
    pub fn get(&self, track_id: &str) -> Option<Url> {
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(track_id) {
                Some(entry) if entry.is_fresh() => return Some(entry.stream.url.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        // Another task may have refreshed the entry between the two locks.
        match entries.get(track_id) {
            Some(entry) if entry.is_fresh() => Some(entry.stream.url.clone()),
            Some(_) => {
                entries.remove(track_id);
                trace!("dropped stale url for {track_id}");
                None
            }
            None => None,
        }
    }

    /// Records a resolution that happened just now.
    pub fn insert(&self, track_id: impl Into<String>, url: Url) {
        self.insert_stream(track_id, ResolvedStream::new(url));
    }

    /// Records a resolution, replacing any previous entry for the track.
    pub fn insert_stream(&self, track_id: impl Into<String>, stream: ResolvedStream) {
        let entry = CacheEntry {
            stream,
            window: self.window,
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(track_id.into(), entry);
    }

    /// Drops the entry for `track_id`. Returns whether there was one.
    pub fn remove(&self, track_id: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(track_id)
            .is_some()
    }

    /// Drops every entry. Returns how many there were.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let count = entries.len();
        entries.clear();
        count
    }

    /// Number of entries, fresh or stale.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counts entries by freshness at this instant.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let fresh = entries.values().filter(|entry| entry.is_fresh()).count();
        CacheStats {
            size: entries.len(),
            fresh,
            stale: entries.len() - fresh,
        }
    }

    /// Drops every stale entry. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh());
        before - entries.len()
    }

    /// Prunes stale entries and returns the rest, ready to be written out.
    fn snapshot(&self) -> HashMap<String, ResolvedStream> {
        let pruned = self.prune();
        if pruned > 0 {
            debug!("pruned {pruned} stale cached urls");
        }

        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, entry)| (id.clone(), entry.stream.clone()))
            .collect()
    }

    /// Loads entries from `path`, discarding those already stale.
    ///
    /// A missing file is not an error and loads nothing. Returns the number
    /// of entries loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid cache
    /// file.
    pub fn load(&self, path: &Path) -> Result<usize> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let streams: HashMap<String, ResolvedStream> = serde_json::from_str(&contents)?;
        let total = streams.len();

        let mut loaded = 0;
        for (track_id, stream) in streams {
            let entry = CacheEntry {
                stream,
                window: self.window,
            };
            if entry.is_fresh() {
                self.insert_stream(track_id, entry.stream);
                loaded += 1;
            }
        }

        debug!(
            "loaded {loaded} cached urls from {} ({} stale)",
            path.display(),
            total - loaded
        );
        Ok(loaded)
    }

    /// Prunes stale entries and writes the rest to `path`.
    ///
    /// The file is replaced atomically so a crash mid-write cannot leave a
    /// truncated cache behind.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem operation fails.
    pub async fn save(&self, path: &Path) -> Result<usize> {
        let snapshot = self.snapshot();
        let json = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;

        trace!("saved {} cached urls to {}", snapshot.len(), path.display());
        Ok(snapshot.len())
    }
}
