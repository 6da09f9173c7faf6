//! Fast random identifiers.
//!
//! Session ids only need to tell concurrent sessions apart in the logs, so
//! they are drawn from `fastrand` instead of a cryptographic generator.

use std::{fmt, ops::Deref, str::FromStr};

use crate::error::Error;

/// A wrapper around `uuid::Uuid` that is cheap to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uuid(pub uuid::Uuid);

impl Deref for Uuid {
    type Target = uuid::Uuid;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Uuid {
    /// Generates a random version 4 UUID.
    ///
    /// Not suitable where ids must be unpredictable.
    #[must_use]
    pub fn fast_v4() -> Self {
        let random_bytes = fastrand::u128(..).to_ne_bytes();
        let uuid = uuid::Builder::from_random_bytes(random_bytes).into_uuid();
        Self(uuid)
    }

    /// The first eight hex digits, for log prefixes.
    #[must_use]
    pub fn short(&self) -> String {
        let mut buf = uuid::Uuid::encode_buffer();
        self.0.simple().encode_lower(&mut buf)[..8].to_owned()
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Uuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::from_str(s)
            .map(Self)
            .map_err(Error::invalid_argument)
    }
}

impl From<Uuid> for uuid::Uuid {
    fn from(value: Uuid) -> Self {
        *value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_version_4() {
        let uuid = Uuid::fast_v4();
        assert_eq!(uuid.get_version_num(), 4);
        assert_ne!(uuid, Uuid::fast_v4());
    }

    #[test]
    fn short_form_prefixes_full_form() {
        let uuid = Uuid::fast_v4();
        let short = uuid.short();
        assert_eq!(short.len(), 8);
        assert!(uuid.to_string().starts_with(&short));
    }

    #[test]
    fn parses_own_output() {
        let uuid = Uuid::fast_v4();
        assert_eq!(uuid.to_string().parse::<Uuid>().unwrap(), uuid);
    }
}
