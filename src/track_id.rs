//! Catalog track identifiers as they appear in proxy URLs.
//!
//! Identifiers are opaque to everything except the HTTP edge: the resolver
//! and the store key on plain strings, while the proxy only accepts paths
//! that look like a real catalog id before spending an admission slot or an
//! extractor call on them.

use std::{fmt, ops::Deref, str::FromStr, sync::LazyLock};

use regex_lite::Regex;

use crate::error::Error;

/// Eleven characters from the URL-safe base64 alphabet.
static PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("invalid track id pattern"));

/// A validated catalog track identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackId(String);

impl TrackId {
    /// Length of every valid identifier, in characters.
    pub const LEN: usize = 11;

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `s` has the shape of a catalog identifier.
    #[must_use]
    pub fn is_valid(s: &str) -> bool {
        PATTERN.is_match(s)
    }
}

impl FromStr for TrackId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(s) {
            Ok(Self(s.to_owned()))
        } else {
            Err(Error::invalid_argument(format!(
                "track id should be {} characters of [A-Za-z0-9_-] but is {s:?}",
                Self::LEN
            )))
        }
    }
}

impl Deref for TrackId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for TrackId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
