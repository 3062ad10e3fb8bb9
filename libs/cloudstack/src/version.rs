use crate::error::Error;

use std::fmt;
use std::str::FromStr;

/// Parsed management server version. Ordering is lexicographic over
/// (major, minor, patch), which the derive gives us from field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CloudStackVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// First release able to mutate the CIDR list on an existing load balancer
/// rule. Older servers force a delete-and-recreate cycle instead.
pub const LB_CIDR_UPDATE_MIN: CloudStackVersion = CloudStackVersion {
    major: 4,
    minor: 22,
    patch: 0,
};

impl CloudStackVersion {
    pub fn supports_lb_cidr_update(self) -> bool {
        self >= LB_CIDR_UPDATE_MIN
    }
}

impl FromStr for CloudStackVersion {
    type Err = Error;

    /// Accepts "4.22.0", the four-segment "4.22.0.0" packaging form, and
    /// suffixed builds like "4.22.0.0-SNAPSHOT". Everything after the third
    /// numeric segment is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() < 3 {
            return Err(Error::Version(s.to_string()));
        }
        let segment = |p: &str| -> Result<u32, Error> {
            p.split(|c: char| !c.is_ascii_digit())
                .next()
                .filter(|t| !t.is_empty())
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| Error::Version(s.to_string()))
        };
        Ok(Self {
            major: segment(parts[0])?,
            minor: segment(parts[1])?,
            patch: segment(parts[2])?,
        })
    }
}

impl fmt::Display for CloudStackVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
