//! Scene product names
//!
//! Sentinel-2 SAFE products and MODIS-Aqua L2 files carry their mission and
//! sensing time in the file name. A scene whose name does not follow the
//! expected convention is rejected before any processing.

use crate::types::{FuseError, FuseResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Sensor a scene belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensor {
    Sentinel2,
    ModisAqua,
}

impl std::fmt::Display for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sensor::Sentinel2 => write!(f, "Sentinel-2"),
            Sensor::ModisAqua => write!(f, "MODIS-Aqua"),
        }
    }
}

/// Parsed scene name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneInfo {
    pub sensor: Sensor,
    /// e.g. `S2A`, `A` for Aqua
    pub mission: String,
    pub sensing_time: DateTime<Utc>,
    pub product_name: String,
}

impl SceneInfo {
    /// Parse a product name (or path) of either sensor
    pub fn parse<P: AsRef<Path>>(path: P) -> FuseResult<Self> {
        let name = product_name(path.as_ref())?;
        if name.starts_with("S2") {
            parse_sentinel2(&name)
        } else {
            parse_modis(&name)
        }
    }

    /// Parse and require a specific sensor
    pub fn expect<P: AsRef<Path>>(path: P, sensor: Sensor) -> FuseResult<Self> {
        let info = Self::parse(path)?;
        if info.sensor != sensor {
            return Err(FuseError::Config(format!(
                "{} is a {} product, expected {}",
                info.product_name, info.sensor, sensor
            )));
        }
        Ok(info)
    }
}

fn product_name(path: &Path) -> FuseResult<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| FuseError::Config(format!("No product name in {}", path.display())))
}

fn regex(pattern: &str) -> FuseResult<Regex> {
    Regex::new(pattern).map_err(|e| FuseError::Config(format!("Invalid pattern {}: {}", pattern, e)))
}

fn parse_time(value: &str, format: &str, name: &str) -> FuseResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, format)
        .map(|t| t.and_utc())
        .map_err(|e| FuseError::Config(format!("Bad sensing time '{}' in {}: {}", value, name, e)))
}

/// `S2A_OPER_PRD_MSIL1C_PDMC_<proc>_R<orbit>_V<start>_<stop>.SAFE` (pre-2016-12)
/// or `S2A_MSIL1C_<start>_N<baseline>_R<orbit>_T<tile>_<disc>.SAFE`
fn parse_sentinel2(name: &str) -> FuseResult<SceneInfo> {
    let mission = regex(r"^(S2[A-D])_")?
        .captures(name)
        .map(|c| c[1].to_string())
        .ok_or_else(|| FuseError::Config(format!("{} is not a Sentinel-2 product name", name)))?;

    let start = regex(r"_V(\d{8}T\d{6})_")?
        .captures(name)
        .or_else(|| regex(r"MSIL[12][AC]_(\d{8}T\d{6})_").ok()?.captures(name))
        .map(|c| c[1].to_string())
        .ok_or_else(|| FuseError::Config(format!("No sensing time in Sentinel-2 name {}", name)))?;

    Ok(SceneInfo {
        sensor: Sensor::Sentinel2,
        mission,
        sensing_time: parse_time(&start, "%Y%m%dT%H%M%S", name)?,
        product_name: name.to_string(),
    })
}

/// `A<YYYYDDDHHMMSS>.L2_LAC_OC.nc`
fn parse_modis(name: &str) -> FuseResult<SceneInfo> {
    let stamp = regex(r"^A(\d{13})\.L2")?
        .captures(name)
        .map(|c| c[1].to_string())
        .ok_or_else(|| FuseError::Config(format!("{} is not a MODIS-Aqua L2 name", name)))?;

    Ok(SceneInfo {
        sensor: Sensor::ModisAqua,
        mission: "A".to_string(),
        sensing_time: parse_time(&stamp, "%Y%j%H%M%S", name)?,
        product_name: name.to_string(),
    })
}
