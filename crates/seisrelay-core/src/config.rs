//! Per-station configuration and the legacy switch-line parser.
//!
//! Stations are configured by one text line of switches, e.g.
//! `-secdepth 300 -recsize 16 -maxrec 7200 -creator TEST -destination 0
//! -cmap BHZ=HHZ -nogap -ip 192.0.2.10 -p 16000`.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::record::RenameMap;

/// Configuration for one station's processor and session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Station identifier.
    pub station: String,
    /// Span buffer depth in seconds (`-secdepth`).
    pub sec_depth: u32,
    /// Ring slot size in 512-byte blocks (`-recsize`).
    pub record_size_blocks: i32,
    /// Ring capacity in records (`-maxrec`).
    pub max_records: i32,
    /// CD1.1 creator tag (`-creator`).
    pub creator: String,
    /// CD1.1 destination tag (`-destination`).
    pub destination: String,
    /// Location-code renames (`-lmap FROM=TO[/...]`).
    pub location_map: RenameMap,
    /// Channel-code renames (`-cmap FROM=TO[/...]`).
    pub channel_map: RenameMap,
    /// Disable the gap-fill worker (`-nogap`).
    pub no_gap_fill: bool,
    /// Remote collection-center host (`-ip`).
    pub host: String,
    /// Remote collection-center port (`-p`).
    pub port: u16,
    /// Local bind address (`-b`).
    pub bind: String,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            station: String::new(),
            sec_depth: 300,
            record_size_blocks: 16,
            max_records: 8640,
            creator: String::new(),
            destination: "0".to_string(),
            location_map: RenameMap::default(),
            channel_map: RenameMap::default(),
            no_gap_fill: false,
            host: String::new(),
            port: 0,
            bind: String::new(),
        }
    }
}

impl StationConfig {
    /// Parses a legacy switch line for `station`. Unknown switches are
    /// logged and ignored; malformed arguments are errors.
    pub fn parse(station: &str, line: &str) -> CoreResult<Self> {
        let mut config = Self {
            station: station.to_string(),
            ..Self::default()
        };

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let mut i = 0;
        while i < tokens.len() {
            let switch = tokens[i];
            match switch {
                "-nogap" => {
                    config.no_gap_fill = true;
                    i += 1;
                    continue;
                }
                _ => {}
            }

            let arg = tokens.get(i + 1).copied().ok_or_else(|| CoreError::InvalidSwitch {
                switch: switch.to_string(),
                reason: "missing argument".to_string(),
            })?;
            match switch {
                "-secdepth" => config.sec_depth = parse_num(switch, arg)?,
                "-recsize" => config.record_size_blocks = parse_num(switch, arg)?,
                "-maxrec" => config.max_records = parse_num(switch, arg)?,
                "-creator" => config.creator = arg.to_string(),
                "-destination" => config.destination = arg.to_string(),
                "-lmap" => config.location_map = RenameMap::parse(arg)?,
                "-cmap" => config.channel_map = RenameMap::parse(arg)?,
                "-ip" => config.host = arg.to_string(),
                "-p" => config.port = parse_num(switch, arg)?,
                "-b" => config.bind = arg.to_string(),
                other => {
                    warn!(station, switch = other, "unknown config switch ignored");
                }
            }
            i += 2;
        }

        Ok(config)
    }
}

fn parse_num<T: std::str::FromStr>(switch: &str, arg: &str) -> CoreResult<T> {
    arg.parse().map_err(|_| CoreError::InvalidSwitch {
        switch: switch.to_string(),
        reason: format!("not a number: {arg:?}"),
    })
}
