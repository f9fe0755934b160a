//! Low-resolution reference scene
//!
//! The reference (MODIS-Aqua L2 reflectance) is prepared once: every native
//! pixel gets a linear index, the index is stored as a band and carried
//! through a nearest-neighbour reprojection onto the domain together with the
//! reflectance bands. After reprojection the index band tells which fine-grid
//! pixels fell into which native pixel.

use crate::core::domain::Domain;
use crate::io::raster::{BandId, BandParams, NamedBand, RasterBackend, RasterHandle};
use crate::types::{ensure_shape, FuseError, FuseResult, IndexRaster, Raster, ResampleAlg};
use ndarray::{Array2, ArrayView2};
use std::path::{Path, PathBuf};

/// Band name of the pixel index
pub const INDEX_BAND: &str = "index";

/// Indexes are stored in float32 bands and stay exact up to 2^24
pub const MAX_INDEXED_PIXELS: usize = 1 << 24;

/// Linear index of each native low-resolution pixel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMap {
    index: IndexRaster,
}

impl IndexMap {
    /// Row-major indexes `0..rows*cols`
    pub fn for_shape(rows: usize, cols: usize) -> FuseResult<Self> {
        let pixels = rows * cols;
        if pixels == 0 || pixels > MAX_INDEXED_PIXELS {
            return Err(FuseError::Processing(format!(
                "Cannot index a {}x{} reference (1..={} pixels supported)",
                rows, cols, MAX_INDEXED_PIXELS
            )));
        }
        Ok(Self {
            index: Array2::from_shape_fn((rows, cols), |(r, c)| (r * cols + c) as i32),
        })
    }

    /// Decode a reprojected index band; non-finite or negative cells become -1
    pub fn from_band(band: &Raster) -> Self {
        Self {
            index: band.mapv(|v| if v.is_finite() && v >= 0.0 { v.round() as i32 } else { -1 }),
        }
    }

    pub fn to_band(&self) -> Raster {
        self.index.mapv(|i| i as f32)
    }

    pub fn view(&self) -> ArrayView2<'_, i32> {
        self.index.view()
    }

    pub fn dim(&self) -> (usize, usize) {
        self.index.dim()
    }

    pub fn crop(&self, rows: usize, cols: usize) -> Self {
        Self {
            index: crate::core::masking::crop_grid(&self.index, rows, cols),
        }
    }
}

/// Output path `<dir>/<scene name>_reprojected.nc`
pub fn reprojected_path(dir: &Path, scene: &Path) -> PathBuf {
    let name = scene
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "reference".to_string());
    dir.join(format!("{}_reprojected.nc", name))
}

/// Index the native reference grid, move it onto `domain` and export the
/// `index` band followed by `band_names`
pub fn prepare_reference<B: RasterBackend>(
    backend: &B,
    source: &Path,
    domain: &Domain,
    band_names: &[String],
    output: &Path,
) -> FuseResult<B::Handle> {
    log::info!("Preparing low-resolution reference {}", source.display());
    let mut handle = backend.open(source)?;
    let (rows, cols) = handle.shape();
    let index = IndexMap::for_shape(rows, cols)?;
    handle.add_band(index.to_band(), BandParams::named(INDEX_BAND))?;

    // Nearest neighbour keeps indexes intact
    handle.reproject(domain, ResampleAlg::NearestNeighbour)?;

    let mut bands = Vec::with_capacity(band_names.len() + 1);
    bands.push(NamedBand::new(
        BandParams::named(INDEX_BAND),
        handle.band_array(&BandId::from(INDEX_BAND))?,
    ));
    for name in band_names {
        let data = handle.band_array(&BandId::Name(name.clone()))?;
        let mut params = BandParams::named(name);
        params.wavelength = name.strip_prefix("Rrs_").and_then(|w| w.parse().ok());
        bands.push(NamedBand::new(params.with_units("sr-1"), data));
    }

    backend.export_bands(domain, &bands, output)?;
    backend.create_with_bands(domain, &bands)
}

/// Reference bands and derived masks on the domain grid
pub struct LowResReference<H: RasterHandle> {
    handle: H,
    index: IndexMap,
    negative_pixels: Option<Array2<bool>>,
    watermask: Option<Array2<u8>>,
}

impl<H: RasterHandle> LowResReference<H> {
    /// Bring a prepared reference onto `domain` and derive its masks.
    ///
    /// `negative_pixel_band` marks pixels where that band is below zero.
    /// With `with_watermask` the backend must provide a land/water mask.
    pub fn load(
        mut handle: H,
        domain: &Domain,
        negative_pixel_band: Option<&str>,
        with_watermask: bool,
    ) -> FuseResult<Self> {
        handle.reproject(domain, ResampleAlg::NearestNeighbour)?;
        ensure_shape("reference reprojection", domain.shape(), handle.shape())?;

        let index = IndexMap::from_band(&handle.band_array(&BandId::from(INDEX_BAND))?);
        let negative_pixels = match negative_pixel_band {
            Some(name) => {
                let band = handle.band_array(&BandId::from(name))?;
                let mask = band.mapv(|v| v < 0.0);
                log::info!(
                    "{} negative pixels in {}",
                    mask.iter().filter(|&&m| m).count(),
                    name
                );
                Some(mask)
            }
            None => None,
        };
        let watermask = if with_watermask {
            Some(handle.watermask()?)
        } else {
            None
        };

        Ok(Self {
            handle,
            index,
            negative_pixels,
            watermask,
        })
    }

    pub fn index(&self) -> &IndexMap {
        &self.index
    }

    pub fn negative_pixels(&self) -> Option<&Array2<bool>> {
        self.negative_pixels.as_ref()
    }

    pub fn watermask(&self) -> Option<&Array2<u8>> {
        self.watermask.as_ref()
    }

    pub fn band(&self, name: &str) -> FuseResult<Raster> {
        self.handle.band_array(&BandId::from(name))
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Restrict index and masks to a top-left window
    pub fn crop(&mut self, rows: usize, cols: usize) {
        self.index = self.index.crop(rows, cols);
        self.negative_pixels = self
            .negative_pixels
            .take()
            .map(|m| crate::core::masking::crop_grid(&m, rows, cols));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_map_is_row_major() {
        let index = IndexMap::for_shape(2, 3).unwrap();
        assert_eq!(index.view()[[0, 0]], 0);
        assert_eq!(index.view()[[1, 0]], 3);
        assert_eq!(index.view()[[1, 2]], 5);
    }

    #[test]
    fn test_index_survives_float_band() {
        let index = IndexMap::for_shape(4, 5).unwrap();
        assert_eq!(IndexMap::from_band(&index.to_band()), index);

        let mut band = index.to_band();
        band[[0, 1]] = f32::NAN;
        assert_eq!(IndexMap::from_band(&band).view()[[0, 1]], -1);
    }

    #[test]
    fn test_oversized_reference_rejected() {
        assert!(IndexMap::for_shape(5000, 5000).is_err());
        assert!(IndexMap::for_shape(0, 10).is_err());
    }

    #[test]
    fn test_reprojected_path() {
        let path = reprojected_path(Path::new("out"), Path::new("/data/A2016154184500.L2_LAC_OC.nc"));
        assert_eq!(path, PathBuf::from("out/A2016154184500.L2_LAC_OC.nc_reprojected.nc"));
    }
}
