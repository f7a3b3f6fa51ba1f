//! Protocol versioning.
//!
//! Clients announce their major version in `connect`; the server accepts any
//! client that shares its major version and answers with its own.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The version this crate speaks.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0);

/// `major.minor`. Only a major bump breaks compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Negotiate with a client announcing `client_major`.
    ///
    /// Returns the version the server will speak, or `None` when the client
    /// is incompatible.
    #[must_use]
    pub fn negotiate(&self, client_major: u8) -> Option<Version> {
        (self.major == client_major).then_some(*self)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = String;

    /// Parse `"1.2"` or a bare major such as `"1"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s.split_once('.').unwrap_or((s, "0"));
        let parse = |part: &str| {
            part.trim()
                .parse::<u8>()
                .map_err(|_| format!("invalid protocol version: {}", s))
        };
        Ok(Version::new(parse(major)?, parse(minor)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate() {
        assert_eq!(PROTOCOL_VERSION.negotiate(1), Some(PROTOCOL_VERSION));
        assert_eq!(PROTOCOL_VERSION.negotiate(2), None);
        assert_eq!(Version::new(2, 3).negotiate(2), Some(Version::new(2, 3)));
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("1.2".parse::<Version>().unwrap(), Version::new(1, 2));
        assert_eq!("3".parse::<Version>().unwrap(), Version::new(3, 0));
        assert!("one.two".parse::<Version>().is_err());
        assert_eq!(Version::new(1, 2).to_string(), "1.2");
        assert!(Version::new(1, 9) < Version::new(2, 0));
    }
}
