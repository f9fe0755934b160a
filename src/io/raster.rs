//! Raster I/O and reprojection contract
//!
//! The pipeline never talks to a raster library directly. A [`RasterBackend`]
//! opens files into [`RasterHandle`]s, which can be reprojected onto a
//! [`Domain`], queried for band arrays, extended with new bands and exported.

use crate::core::domain::Domain;
use crate::types::{Footprint, FuseResult, GeoTransform, Raster, ResampleAlg};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Land/water mask category: land
pub const WATERMASK_LAND: u8 = 0;

/// Land/water mask category: water
pub const WATERMASK_WATER: u8 = 1;

/// Land/water mask category: ambiguous (coastal, mixed or unclassified).
/// Pixels near this category are excluded from the hi-res cube.
pub const WATERMASK_AMBIGUOUS: u8 = 2;

/// Reference to one band of a raster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BandId {
    /// 1-based band number
    Number(usize),
    /// Band name, e.g. `Rrs_443` or `index`
    Name(String),
}

impl From<usize> for BandId {
    fn from(number: usize) -> Self {
        BandId::Number(number)
    }
}

impl From<&str> for BandId {
    fn from(name: &str) -> Self {
        BandId::Name(name.to_string())
    }
}

impl std::fmt::Display for BandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BandId::Number(n) => write!(f, "band #{}", n),
            BandId::Name(name) => write!(f, "band '{}'", name),
        }
    }
}

/// Descriptive parameters attached to a band
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BandParams {
    pub name: String,
    pub long_name: Option<String>,
    pub units: Option<String>,
    pub wavelength: Option<u32>,
}

impl BandParams {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    pub fn with_long_name(mut self, long_name: &str) -> Self {
        self.long_name = Some(long_name.to_string());
        self
    }

    pub fn with_wavelength(mut self, wavelength: u32) -> Self {
        self.wavelength = Some(wavelength);
        self
    }
}

/// A band array together with its parameters
#[derive(Debug, Clone)]
pub struct NamedBand {
    pub params: BandParams,
    pub data: Raster,
}

impl NamedBand {
    pub fn new(params: BandParams, data: Raster) -> Self {
        Self { params, data }
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }
}

/// An opened raster
pub trait RasterHandle {
    /// (rows, cols) of the current grid
    fn shape(&self) -> (usize, usize);

    /// Spatial reference definition of the current grid
    fn projection(&self) -> String;

    fn geo_transform(&self) -> FuseResult<GeoTransform>;

    fn band_count(&self) -> usize;

    /// Resample every band onto `domain`, replacing the current grid
    fn reproject(&mut self, domain: &Domain, alg: ResampleAlg) -> FuseResult<()>;

    fn band_array(&self, band: &BandId) -> FuseResult<Raster>;

    /// Append a band shaped like the current grid
    fn add_band(&mut self, data: Raster, params: BandParams) -> FuseResult<()>;

    fn export(&self, path: &Path) -> FuseResult<()>;

    /// (lon, lat) corners of the current grid, clockwise from upper-left
    fn corners(&self) -> FuseResult<Footprint>;

    /// Land/water categories on the current grid
    fn watermask(&self) -> FuseResult<Array2<u8>>;
}

/// Factory for raster handles
pub trait RasterBackend: Send + Sync {
    type Handle: RasterHandle;

    fn open(&self, path: &Path) -> FuseResult<Self::Handle>;

    /// Empty raster (no bands) on `domain`
    fn create(&self, domain: &Domain) -> FuseResult<Self::Handle>;

    /// Write an 8-bit grayscale quicklook image
    fn write_quicklook(&self, image: &Array2<u8>, path: &Path) -> FuseResult<()>;

    /// Create a raster on `domain` holding `bands`
    fn create_with_bands(&self, domain: &Domain, bands: &[NamedBand]) -> FuseResult<Self::Handle> {
        let mut handle = self.create(domain)?;
        for band in bands {
            handle.add_band(band.data.clone(), band.params.clone())?;
        }
        Ok(handle)
    }

    /// Export `bands` on `domain` to a single file
    fn export_bands(&self, domain: &Domain, bands: &[NamedBand], path: &Path) -> FuseResult<()> {
        log::info!("Exporting {} bands to {}", bands.len(), path.display());
        self.create_with_bands(domain, bands)?.export(path)
    }
}
