//! Firmware version identifiers and their ordering.
//!
//! Every "is an update required" decision goes through [`compare`]. Versions are
//! dot-separated non-negative integers, compared numerically segment by segment, so
//! `1.10` orders after `1.9`. Missing trailing segments count as `0`, a leading `v`
//! is accepted, and qualifiers after `-` or `+` (`1.2.0-rc1`, `1.2.0+build7`) are
//! ignored for ordering.
use std::{
    cmp::Ordering,
    fmt::Display,
    hash::{Hash, Hasher},
    str::FromStr,
};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid version format `{version}`: {reason}")]
pub struct InvalidVersionFormat {
    pub version: String,
    pub reason: String,
}

impl InvalidVersionFormat {
    fn new(version: &str, reason: impl Into<String>) -> Self {
        Self {
            version: version.to_string(),
            reason: reason.into(),
        }
    }
}

/// A parsed firmware version.
///
/// Equality, ordering and hashing only look at the numeric segments, with trailing
/// zeros being insignificant: `1.2` and `1.2.0-beta` are equal.
#[derive(Debug, Clone)]
pub struct FirmwareVersion {
    segments: Vec<u64>,
    raw: String,
}

impl FirmwareVersion {
    pub fn parse(s: &str) -> Result<Self, InvalidVersionFormat> {
        let trimmed = s.trim();
        let unprefixed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let numeric = unprefixed
            .split(['-', '+'])
            .next()
            .unwrap_or_default();
        if numeric.is_empty() {
            return Err(InvalidVersionFormat::new(s, "no numeric segments"));
        }

        let segments = numeric
            .split('.')
            .map(|segment| {
                if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(InvalidVersionFormat::new(
                        s,
                        format!("segment `{segment}` is not a non-negative integer"),
                    ));
                }
                segment.parse::<u64>().map_err(|e| {
                    InvalidVersionFormat::new(s, format!("segment `{segment}`: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            segments,
            raw: trimmed.to_string(),
        })
    }

    pub fn from_segments(segments: Vec<u64>) -> Self {
        let raw = segments
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".");
        Self { segments, raw }
    }

    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn significant_segments(&self) -> &[u64] {
        let len = self
            .segments
            .iter()
            .rposition(|&s| s != 0)
            .map_or(0, |i| i + 1);
        &self.segments[..len]
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        (0..len)
            .map(|i| {
                let lhs = self.segments.get(i).copied().unwrap_or(0);
                let rhs = other.segments.get(i).copied().unwrap_or(0);
                lhs.cmp(&rhs)
            })
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FirmwareVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for FirmwareVersion {}

impl Hash for FirmwareVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant_segments().hash(state);
    }
}

impl Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for FirmwareVersion {
    type Err = InvalidVersionFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Compares two version strings numerically.
///
/// # Examples
///
/// ```
/// use std::cmp::Ordering;
/// use wallet_update_agent_core::version::compare;
///
/// assert_eq!(Ordering::Less, compare("1.9.0", "1.10.0").unwrap());
/// assert_eq!(Ordering::Equal, compare("2.1", "2.1.0").unwrap());
/// assert!(compare("1.x", "1.0").is_err());
/// ```
pub fn compare(a: &str, b: &str) -> Result<Ordering, InvalidVersionFormat> {
    let a = FirmwareVersion::parse(a)?;
    let b = FirmwareVersion::parse(b)?;
    Ok(a.cmp(&b))
}
