//! Persistent track metadata.
//!
//! Maps catalog track ids to what a player should display for them, plus a
//! little bookkeeping about the last stream URL handed out for the track.
//! The synchronizer writes here; the proxy reads display metadata and
//! records resolutions.
//!
//! Backed by SQLite. A single connection sits behind a mutex, which makes
//! concurrent access from any number of tasks safe; callers on the async
//! runtime should go through [`tokio::task::spawn_blocking`] as the proxy
//! does.
//!
//! # Example
//!
//! ```rust
//! use streamrelay::store::{TrackMetadata, TrackStore};
//!
//! # fn main() -> streamrelay::error::Result<()> {
//! let store = TrackStore::open_in_memory()?;
//! store.put("dQw4w9WgXcQ", &TrackMetadata::new("Never Gonna Give You Up", Some("Rick Astley")))?;
//!
//! let track = store.get("dQw4w9WgXcQ")?.unwrap_or_default();
//! assert_eq!(track.display_name(), "Rick Astley - Never Gonna Give You Up");
//! # Ok(())
//! # }
//! ```

use std::{
    fs,
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

/// Label shown when a track has no artist.
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

/// Label shown when nothing is known about a track at all.
pub const FALLBACK_DISPLAY_NAME: &str = "Unknown Artist - Unknown Title";

/// What a player should show for a track.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: Option<String>,
    pub duration_seconds: Option<u32>,
}

impl TrackMetadata {
    /// Metadata without a known duration.
    #[must_use]
    pub fn new(title: impl Into<String>, artist: Option<impl Into<String>>) -> Self {
        Self {
            title: title.into(),
            artist: artist.map(Into::into),
            duration_seconds: None,
        }
    }

    /// Sets the track length in seconds.
    #[must_use]
    pub fn with_duration(mut self, seconds: u32) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    /// The "now playing" text: `Artist - Title`.
    #[must_use]
    pub fn display_name(&self) -> String {
        let artist = self
            .artist
            .as_deref()
            .filter(|artist| !artist.is_empty())
            .unwrap_or(UNKNOWN_ARTIST);
        format!("{artist} - {}", self.title)
    }
}

/// The last stream URL recorded for a track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRecord {
    pub url: String,
    pub updated_at: SystemTime,
}

/// SQLite-backed track metadata store.
#[derive(Debug)]
pub struct TrackStore {
    conn: Mutex<Connection>,
}

impl TrackStore {
    const SCHEMA: &'static str = "
        CREATE TABLE IF NOT EXISTS tracks (
            track_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            artist TEXT,
            duration_seconds INTEGER,
            stream_url TEXT,
            updated_at REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tracks_updated_at ON tracks (updated_at);
    ";

    /// Opens or creates the store at `path`, creating parent directories as
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the database
    /// cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        debug!("opened track store at {}", path.display());
        Self::with_connection(conn)
    }

    /// Opens a store that lives only as long as the returned value.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(Self::SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // A panic while holding the lock cannot leave a half-applied statement
    // behind, so a poisoned connection is still usable.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces the metadata for `track_id`.
    ///
    /// Replacing clears any recorded stream URL: new metadata means the
    /// synchronizer saw the track anew.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put(&self, track_id: &str, metadata: &TrackMetadata) -> Result<()> {
        self.conn().execute(
            "INSERT INTO tracks (track_id, title, artist, duration_seconds, stream_url, updated_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)
             ON CONFLICT(track_id) DO UPDATE SET
                 title = excluded.title,
                 artist = excluded.artist,
                 duration_seconds = excluded.duration_seconds,
                 stream_url = NULL,
                 updated_at = excluded.updated_at",
            params![
                track_id,
                metadata.title,
                metadata.artist,
                metadata.duration_seconds,
                epoch_secs(SystemTime::now()),
            ],
        )?;
        Ok(())
    }

    /// Looks up the metadata for `track_id`. Absence is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn get(&self, track_id: &str) -> Result<Option<TrackMetadata>> {
        let metadata = self
            .conn()
            .query_row(
                "SELECT title, artist, duration_seconds FROM tracks WHERE track_id = ?1",
                [track_id],
                |row| {
                    Ok(TrackMetadata {
                        title: row.get(0)?,
                        artist: row.get(1)?,
                        duration_seconds: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(metadata)
    }

    /// Records the stream URL most recently resolved for `track_id`.
    ///
    /// Does nothing for tracks the store does not know about.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn update_stream_url(&self, track_id: &str, url: &str) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE tracks SET stream_url = ?1, updated_at = ?2 WHERE track_id = ?3",
            params![url, epoch_secs(SystemTime::now()), track_id],
        )?;
        if updated == 0 {
            trace!("no metadata for track {track_id}; stream url not recorded");
        }
        Ok(())
    }

    /// The stream URL recorded for `track_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn stream_record(&self, track_id: &str) -> Result<Option<StreamRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT stream_url, updated_at FROM tracks
                 WHERE track_id = ?1 AND stream_url IS NOT NULL",
                [track_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
            )
            .optional()?;

        Ok(record.map(|(url, updated_at)| StreamRecord {
            url,
            updated_at: UNIX_EPOCH + Duration::from_secs_f64(updated_at.max(0.0)),
        }))
    }

    /// Number of tracks in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM tracks", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Whether the store holds no tracks.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|len| len == 0)
    }
}

fn epoch_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}
