//! Decoded-record model: timestamps, channel naming, rename maps.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Microseconds in one second.
const MICROS_PER_SEC: i64 = 1_000_000;

/// A UTC instant with microsecond resolution.
///
/// Sample arithmetic (`offset = round((t - start) * rate)`) is done in
/// microseconds so repeated shifts do not accumulate floating drift.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from microseconds since the Unix epoch.
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Creates a timestamp from fractional seconds since the Unix epoch.
    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * MICROS_PER_SEC as f64).round() as i64)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let micros = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Self(micros)
    }

    /// Microseconds since the Unix epoch.
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Fractional seconds since the Unix epoch.
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / MICROS_PER_SEC as f64
    }

    /// Returns this timestamp advanced by `secs` (may be negative).
    pub fn add_secs_f64(self, secs: f64) -> Self {
        Self(self.0 + (secs * MICROS_PER_SEC as f64).round() as i64)
    }

    /// Signed difference `self - other` in seconds.
    pub fn diff_secs(self, other: Timestamp) -> f64 {
        (self.0 - other.0) as f64 / MICROS_PER_SEC as f64
    }

    /// Rounds down to a multiple of `step_secs` seconds.
    pub fn align_down(self, step_secs: i64) -> Self {
        let step = step_secs * MICROS_PER_SEC;
        Self(self.0.div_euclid(step) * step)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.as_secs_f64())
    }
}

/// A SEED channel identifier: `NET.STA.LOC.CHA`.
///
/// The location code may be empty (`IU.ANMO..BHZ`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeedName {
    /// Network code (1-2 chars).
    pub network: String,
    /// Station code (1-5 chars).
    pub station: String,
    /// Location code (0-2 chars).
    pub location: String,
    /// Channel code (3 chars).
    pub channel: String,
}

impl SeedName {
    /// Parses a `NET.STA.LOC.CHA` string.
    pub fn parse(name: &str) -> CoreResult<Self> {
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() != 4 || parts[0].is_empty() || parts[1].is_empty() || parts[3].is_empty() {
            return Err(CoreError::InvalidSeedName {
                name: name.to_string(),
            });
        }
        Ok(Self {
            network: parts[0].to_string(),
            station: parts[1].to_string(),
            location: parts[2].to_string(),
            channel: parts[3].to_string(),
        })
    }
}

impl fmt::Display for SeedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }
}

/// A decoded compressed record: the codec's output contract.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    /// Channel the samples belong to.
    pub seed_name: SeedName,
    /// Time of the first sample.
    pub start: Timestamp,
    /// Sample rate in Hz.
    pub rate: f64,
    /// The decoded samples.
    pub samples: Vec<i32>,
}

impl DecodedRecord {
    /// Time just past the last sample.
    pub fn end(&self) -> Timestamp {
        self.start.add_secs_f64(self.samples.len() as f64 / self.rate)
    }
}

/// Channel or location rename map from `-cmap`/`-lmap` switches.
///
/// Parsed from `FROM=TO[/FROM=TO...]`; lookups of unmapped codes return the
/// code unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameMap {
    entries: HashMap<String, String>,
}

impl RenameMap {
    /// Parses a `FROM=TO[/FROM=TO...]` switch argument.
    pub fn parse(arg: &str) -> CoreResult<Self> {
        let mut entries = HashMap::new();
        for pair in arg.split('/') {
            if pair.is_empty() {
                continue;
            }
            let (from, to) = pair.split_once('=').ok_or_else(|| CoreError::InvalidSwitch {
                switch: arg.to_string(),
                reason: format!("rename pair {pair:?} missing '='"),
            })?;
            entries.insert(from.to_string(), to.to_string());
        }
        Ok(Self { entries })
    }

    /// Applies the map to one code.
    pub fn apply<'a>(&'a self, code: &'a str) -> &'a str {
        self.entries.get(code).map(String::as_str).unwrap_or(code)
    }

    /// True if the map holds no renames.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_roundtrip() {
        let t = Timestamp::from_secs_f64(1700000000.25);
        assert_eq!(t.as_micros(), 1_700_000_000_250_000);
        assert!((t.as_secs_f64() - 1700000000.25).abs() < 1e-9);
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::from_micros(1_000_000);
        let later = t.add_secs_f64(2.5);
        assert_eq!(later.as_micros(), 3_500_000);
        assert!((later.diff_secs(t) - 2.5).abs() < 1e-9);
        assert!((t.diff_secs(later) + 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_timestamp_align_down() {
        let t = Timestamp::from_secs_f64(1700000007.9);
        assert_eq!(t.align_down(10).as_micros(), 1_700_000_000_000_000);
        let exact = Timestamp::from_secs_f64(1700000010.0);
        assert_eq!(exact.align_down(10), exact);
    }

    #[test]
    fn test_seed_name_parse() {
        let name = SeedName::parse("IU.ANMO.00.BHZ").unwrap();
        assert_eq!(name.network, "IU");
        assert_eq!(name.station, "ANMO");
        assert_eq!(name.location, "00");
        assert_eq!(name.channel, "BHZ");
        assert_eq!(name.to_string(), "IU.ANMO.00.BHZ");
    }

    #[test]
    fn test_seed_name_empty_location() {
        let name = SeedName::parse("IU.ANMO..BHZ").unwrap();
        assert_eq!(name.location, "");
        assert_eq!(name.to_string(), "IU.ANMO..BHZ");
    }

    #[test]
    fn test_seed_name_invalid() {
        assert!(SeedName::parse("IU.ANMO.BHZ").is_err());
        assert!(SeedName::parse(".ANMO.00.BHZ").is_err());
        assert!(SeedName::parse("IU.ANMO.00.").is_err());
    }

    #[test]
    fn test_rename_map() {
        let map = RenameMap::parse("BHZ=HHZ/BHN=HHN").unwrap();
        assert_eq!(map.apply("BHZ"), "HHZ");
        assert_eq!(map.apply("BHN"), "HHN");
        assert_eq!(map.apply("BHE"), "BHE");
    }

    #[test]
    fn test_rename_map_invalid() {
        assert!(RenameMap::parse("BHZ-HHZ").is_err());
    }

    #[test]
    fn test_record_end() {
        let rec = DecodedRecord {
            seed_name: SeedName::parse("IU.ANMO.00.BHZ").unwrap(),
            start: Timestamp::from_secs_f64(100.0),
            rate: 100.0,
            samples: vec![0; 200],
        };
        assert!((rec.end().diff_secs(rec.start) - 2.0).abs() < 1e-9);
    }
}
