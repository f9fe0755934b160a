//! Canonical band tables for the Sentinel-2 MSI and MODIS-Aqua sensors
//!
//! Band codes, wavelengths (nm) and native resolutions are fixed data. Every
//! lookup between a Sentinel-2 band code and its wavelength goes through
//! [`BandTable`], which is validated once at startup.

use crate::types::{FuseError, FuseResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One spectral band of a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandSpec {
    pub code: &'static str,
    pub wavelength: u32,
    pub resolution_m: u32,
}

/// Sentinel-2 MSI bands (B8A is not used by the pipeline)
pub const SENTINEL2_BANDS: [BandSpec; 12] = [
    BandSpec { code: "01", wavelength: 443, resolution_m: 60 },
    BandSpec { code: "02", wavelength: 490, resolution_m: 10 },
    BandSpec { code: "03", wavelength: 560, resolution_m: 10 },
    BandSpec { code: "04", wavelength: 665, resolution_m: 10 },
    BandSpec { code: "05", wavelength: 705, resolution_m: 20 },
    BandSpec { code: "06", wavelength: 740, resolution_m: 20 },
    BandSpec { code: "07", wavelength: 783, resolution_m: 20 },
    BandSpec { code: "08", wavelength: 842, resolution_m: 10 },
    BandSpec { code: "09", wavelength: 945, resolution_m: 60 },
    BandSpec { code: "10", wavelength: 1375, resolution_m: 60 },
    BandSpec { code: "11", wavelength: 1610, resolution_m: 20 },
    BandSpec { code: "12", wavelength: 2190, resolution_m: 20 },
];

/// All MODIS-Aqua ocean-color channels
pub const MODIS_FULL: [u32; 9] = [412, 443, 488, 531, 547, 555, 645, 667, 678];

/// Named subsets of MODIS-Aqua wavelengths used as fusion targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModisBandSet {
    Full,
    /// Only the 1x1 km channels
    #[serde(alias = "1x1km_bands")]
    OneKm,
    /// Without 412 nm
    BlueOff,
    /// Without 678 nm
    RedOff,
    BlueAndRedOff,
    RedOffFull,
    /// 1x1 km channels without 412 nm
    #[serde(alias = "1x1km_bands_2")]
    OneKmNoBlue,
}

impl ModisBandSet {
    pub fn wavelengths(&self) -> &'static [u32] {
        match self {
            ModisBandSet::Full => &MODIS_FULL,
            ModisBandSet::OneKm => &[412, 443, 488, 531, 645, 678],
            ModisBandSet::BlueOff => &[443, 469, 488, 531, 547, 555, 645, 667, 678],
            ModisBandSet::RedOff => &[412, 443, 469, 488, 531, 547, 555, 645, 667],
            ModisBandSet::BlueAndRedOff => &[443, 469, 488, 531, 547, 555, 645, 667],
            ModisBandSet::RedOffFull => &[412, 443, 469, 488, 531, 547, 555],
            ModisBandSet::OneKmNoBlue => &[443, 488, 531, 645, 678],
        }
    }

    /// `Rrs_<wavelength>` band names of the set
    pub fn band_names(&self) -> Vec<String> {
        self.wavelengths().iter().map(|&w| rrs_name(w)).collect()
    }
}

/// Name of a remote-sensing reflectance band
pub fn rrs_name(wavelength: u32) -> String {
    format!("Rrs_{}", wavelength)
}

/// Bidirectional band-code ↔ wavelength lookup
#[derive(Debug, Clone)]
pub struct BandTable {
    by_code: BTreeMap<&'static str, BandSpec>,
    by_wavelength: BTreeMap<u32, BandSpec>,
}

impl BandTable {
    /// Build and validate a table; codes and wavelengths must be unique
    pub fn new(specs: &[BandSpec]) -> FuseResult<Self> {
        let mut by_code = BTreeMap::new();
        let mut by_wavelength = BTreeMap::new();

        for spec in specs {
            if spec.wavelength == 0 || spec.resolution_m == 0 {
                return Err(FuseError::Config(format!(
                    "Band {} has an invalid wavelength or resolution",
                    spec.code
                )));
            }
            if by_code.insert(spec.code, *spec).is_some() {
                return Err(FuseError::Config(format!("Duplicate band code {}", spec.code)));
            }
            if by_wavelength.insert(spec.wavelength, *spec).is_some() {
                return Err(FuseError::Config(format!(
                    "Duplicate wavelength {} nm",
                    spec.wavelength
                )));
            }
        }

        Ok(Self { by_code, by_wavelength })
    }

    pub fn sentinel2() -> FuseResult<Self> {
        Self::new(&SENTINEL2_BANDS)
    }

    pub fn get(&self, code: &str) -> FuseResult<&BandSpec> {
        self.by_code
            .get(code)
            .ok_or_else(|| FuseError::Config(format!("Unknown band code {}", code)))
    }

    pub fn wavelength(&self, code: &str) -> FuseResult<u32> {
        self.get(code).map(|spec| spec.wavelength)
    }

    pub fn code(&self, wavelength: u32) -> FuseResult<&'static str> {
        self.by_wavelength
            .get(&wavelength)
            .map(|spec| spec.code)
            .ok_or_else(|| FuseError::Config(format!("No band at {} nm", wavelength)))
    }

    /// Band codes sorted by wavelength, the cube ordering
    pub fn sort_by_wavelength(&self, codes: &[String]) -> FuseResult<Vec<String>> {
        let mut keyed = codes
            .iter()
            .map(|code| self.wavelength(code).map(|w| (w, code.clone())))
            .collect::<FuseResult<Vec<_>>>()?;
        keyed.sort();
        Ok(keyed.into_iter().map(|(_, code)| code).collect())
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel2_table_is_bidirectional() {
        let table = BandTable::sentinel2().unwrap();
        assert_eq!(table.len(), 12);
        for spec in SENTINEL2_BANDS.iter() {
            assert_eq!(table.wavelength(spec.code).unwrap(), spec.wavelength);
            assert_eq!(table.code(spec.wavelength).unwrap(), spec.code);
        }
        assert_eq!(table.code(842).unwrap(), "08");
        assert!(table.get("8A").is_err());
    }

    #[test]
    fn test_duplicate_wavelength_rejected() {
        let specs = [
            BandSpec { code: "01", wavelength: 443, resolution_m: 60 },
            BandSpec { code: "02", wavelength: 443, resolution_m: 10 },
        ];
        assert!(matches!(BandTable::new(&specs), Err(FuseError::Config(_))));
    }

    #[test]
    fn test_sort_by_wavelength() {
        let table = BandTable::sentinel2().unwrap();
        let codes = vec!["08".to_string(), "01".to_string(), "04".to_string()];
        assert_eq!(table.sort_by_wavelength(&codes).unwrap(), vec!["01", "04", "08"]);
    }

    #[test]
    fn test_modis_band_names() {
        assert_eq!(ModisBandSet::OneKmNoBlue.band_names()[0], "Rrs_443");
        assert_eq!(ModisBandSet::Full.wavelengths().len(), 9);
    }
}
