//! Ground control points for swath products
//!
//! Level-2 MODIS files carry per-pixel longitude and latitude arrays instead
//! of a geotransform (the GDAL `GEOLOCATION` metadata domain). A regular
//! lattice of those arrays is turned into GCPs, and the geolocation arrays are
//! dropped; the GDAL backend then warps the swath with a thin plate spline.

use crate::types::{ensure_shape, FuseError, FuseResult, Raster};

/// Control points along each image axis when none is configured
pub const DEFAULT_GCP_COUNT: usize = 40;

/// TPS needs at least three non-collinear points
const MIN_GCPS: usize = 3;

/// Image position (`pixel`, `line`) and its map position (`x`, `y`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundControlPoint {
    pub pixel: f64,
    pub line: f64,
    pub x: f64,
    pub y: f64,
}

/// Where the geolocation arrays live and how their cells map to image pixels
#[derive(Debug, Clone, PartialEq)]
pub struct GeolocationArrays {
    pub x_dataset: String,
    pub x_band: usize,
    pub y_dataset: String,
    pub y_band: usize,
    pub pixel_offset: f64,
    pub pixel_step: f64,
    pub line_offset: f64,
    pub line_step: f64,
    /// Reference system of the arrays; WGS84 when absent
    pub srs: Option<String>,
}

impl GeolocationArrays {
    /// Parse the `KEY=VALUE` entries of a `GEOLOCATION` metadata domain
    pub fn from_metadata(entries: &[String]) -> FuseResult<Self> {
        let get = |key: &str| {
            entries
                .iter()
                .filter_map(|e| e.split_once('='))
                .find(|(k, _)| k.trim().eq_ignore_ascii_case(key))
                .map(|(_, v)| v.trim().to_string())
        };
        let required = |key: &str| {
            get(key).ok_or_else(|| FuseError::InvalidFormat(format!("Geolocation metadata lacks {}", key)))
        };
        let number = |key: &str, default: f64| -> FuseResult<f64> {
            match get(key) {
                Some(v) => v
                    .parse()
                    .map_err(|e| FuseError::InvalidFormat(format!("Bad {} '{}': {}", key, v, e))),
                None => Ok(default),
            }
        };

        let arrays = Self {
            x_dataset: required("X_DATASET")?,
            x_band: number("X_BAND", 1.0)? as usize,
            y_dataset: required("Y_DATASET")?,
            y_band: number("Y_BAND", 1.0)? as usize,
            pixel_offset: number("PIXEL_OFFSET", 0.0)?,
            pixel_step: number("PIXEL_STEP", 1.0)?,
            line_offset: number("LINE_OFFSET", 0.0)?,
            line_step: number("LINE_STEP", 1.0)?,
            srs: get("SRS").filter(|s| !s.is_empty()),
        };
        if arrays.x_band == 0 || arrays.y_band == 0 || arrays.pixel_step <= 0.0 || arrays.line_step <= 0.0 {
            return Err(FuseError::InvalidFormat(format!(
                "Invalid geolocation layout {:?}",
                arrays
            )));
        }
        Ok(arrays)
    }

    /// Sample `lon`/`lat` on a `count` x `count` lattice of array cells.
    ///
    /// GCPs sit on image pixel centres. Cells outside the lon/lat range (fill
    /// values) or non-finite are skipped.
    pub fn sample_gcps(&self, lon: &Raster, lat: &Raster, count: usize) -> FuseResult<Vec<GroundControlPoint>> {
        ensure_shape("geolocation arrays", lon.dim(), lat.dim())?;
        let (rows, cols) = lon.dim();

        let mut gcps = Vec::new();
        for row in lattice(rows, count) {
            for col in lattice(cols, count) {
                let (x, y) = (lon[[row, col]] as f64, lat[[row, col]] as f64);
                if !(x.abs() <= 180.0 && y.abs() <= 90.0) {
                    continue;
                }
                gcps.push(GroundControlPoint {
                    pixel: self.pixel_offset + (col as f64 + 0.5) * self.pixel_step,
                    line: self.line_offset + (row as f64 + 0.5) * self.line_step,
                    x,
                    y,
                });
            }
        }

        if gcps.len() < MIN_GCPS {
            return Err(FuseError::InvalidFormat(format!(
                "Only {} valid geolocation points in a {}x{} swath",
                gcps.len(),
                rows,
                cols
            )));
        }
        log::debug!("Sampled {} GCPs from {}x{} geolocation arrays", gcps.len(), rows, cols);
        Ok(gcps)
    }
}

/// Up to `count` evenly spread indexes over `0..len`, first and last included
fn lattice(len: usize, count: usize) -> Vec<usize> {
    match (len, count) {
        (0, _) | (_, 0) => Vec::new(),
        (1, _) | (_, 1) => vec![0],
        _ => {
            let count = count.min(len);
            let mut positions: Vec<usize> = (0..count)
                .map(|i| ((i * (len - 1)) as f64 / (count - 1) as f64).round() as usize)
                .collect();
            positions.dedup();
            positions
        }
    }
}
