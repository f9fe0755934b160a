//! In-memory raster backend
//!
//! Rasters live in a path-keyed table instead of on disk. Resampling works on
//! north-up grids that share one spatial reference, which is all the pipeline
//! needs for arrays that are already in memory and for tests.

use crate::core::domain::{self, Domain};
use crate::io::raster::{
    BandId, BandParams, NamedBand, RasterBackend, RasterHandle, WATERMASK_LAND,
};
use crate::types::{ensure_shape, Footprint, FuseError, FuseResult, GeoTransform, Raster, ResampleAlg};
use ndarray::Array2;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A georeferenced stack of bands held in memory
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    srs: String,
    transform: GeoTransform,
    shape: (usize, usize),
    bands: Vec<NamedBand>,
    watermask: Option<Arc<MemoryRaster>>,
}

impl MemoryRaster {
    pub fn new(srs: &str, transform: GeoTransform, shape: (usize, usize)) -> Self {
        Self {
            srs: srs.to_string(),
            transform,
            shape,
            bands: Vec::new(),
            watermask: None,
        }
    }

    pub fn on_domain(domain: &Domain) -> Self {
        Self::new(domain.srs(), *domain.transform(), domain.shape())
    }

    /// Builder-style [`RasterHandle::add_band`]
    pub fn with_band(mut self, data: Raster, params: BandParams) -> FuseResult<Self> {
        self.add_band(data, params)?;
        Ok(self)
    }

    pub fn bands(&self) -> &[NamedBand] {
        &self.bands
    }

    fn grid_domain(&self) -> FuseResult<Domain> {
        Domain::from_grid(&self.srs, self.transform, self.shape.0, self.shape.1)
    }

    fn find_band(&self, band: &BandId) -> FuseResult<&NamedBand> {
        let found = match band {
            BandId::Number(n) if *n >= 1 => self.bands.get(n - 1),
            BandId::Number(_) => None,
            BandId::Name(name) => self.bands.iter().find(|b| &b.params.name == name),
        };
        found.ok_or_else(|| {
            FuseError::Config(format!("{} not present in in-memory raster", band))
        })
    }
}

impl RasterHandle for MemoryRaster {
    fn shape(&self) -> (usize, usize) {
        self.shape
    }

    fn projection(&self) -> String {
        self.srs.clone()
    }

    fn geo_transform(&self) -> FuseResult<GeoTransform> {
        Ok(self.transform)
    }

    fn band_count(&self) -> usize {
        self.bands.len()
    }

    fn reproject(&mut self, target: &Domain, alg: ResampleAlg) -> FuseResult<()> {
        if !same_srs(&self.srs, target.srs()) {
            return Err(FuseError::Processing(format!(
                "In-memory rasters cannot be reprojected from '{}' to '{}'",
                self.srs,
                target.srs()
            )));
        }

        log::debug!(
            "Resampling {} in-memory bands {:?} -> {:?} ({})",
            self.bands.len(),
            self.shape,
            target.shape(),
            alg
        );

        for band in self.bands.iter_mut() {
            band.data = resample(&band.data, &self.transform, target, alg);
        }
        self.srs = target.srs().to_string();
        self.transform = *target.transform();
        self.shape = target.shape();
        Ok(())
    }

    fn band_array(&self, band: &BandId) -> FuseResult<Raster> {
        Ok(self.find_band(band)?.data.clone())
    }

    fn add_band(&mut self, data: Raster, params: BandParams) -> FuseResult<()> {
        ensure_shape(&format!("add_band({})", params.name), self.shape, data.dim())?;
        self.bands.push(NamedBand::new(params, data));
        Ok(())
    }

    fn export(&self, path: &Path) -> FuseResult<()> {
        Err(FuseError::Processing(format!(
            "In-memory raster cannot export to {} without a backend",
            path.display()
        )))
    }

    fn corners(&self) -> FuseResult<Footprint> {
        let corners = self.transform.corners(self.shape.0, self.shape.1);
        Ok(Footprint::new(domain::srs_to_lonlat(&self.srs, &corners)?))
    }

    fn watermask(&self) -> FuseResult<Array2<u8>> {
        let source = self
            .watermask
            .as_ref()
            .ok_or_else(|| FuseError::Config("No land/water mask configured".to_string()))?;
        let categories = source.find_band(&BandId::Number(1))?;
        let resampled = resample(
            &categories.data,
            &source.transform,
            &self.grid_domain()?,
            ResampleAlg::NearestNeighbour,
        );
        Ok(resampled.mapv(|v| if v.is_finite() && v >= 0.0 { v as u8 } else { WATERMASK_LAND }))
    }
}

/// Handle returned by [`MemoryBackend`]; exports go back into the backend
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    raster: MemoryRaster,
    exports: Arc<Mutex<HashMap<PathBuf, MemoryRaster>>>,
}

impl MemoryHandle {
    pub fn raster(&self) -> &MemoryRaster {
        &self.raster
    }
}

impl RasterHandle for MemoryHandle {
    fn shape(&self) -> (usize, usize) {
        self.raster.shape()
    }

    fn projection(&self) -> String {
        self.raster.projection()
    }

    fn geo_transform(&self) -> FuseResult<GeoTransform> {
        self.raster.geo_transform()
    }

    fn band_count(&self) -> usize {
        self.raster.band_count()
    }

    fn reproject(&mut self, domain: &Domain, alg: ResampleAlg) -> FuseResult<()> {
        self.raster.reproject(domain, alg)
    }

    fn band_array(&self, band: &BandId) -> FuseResult<Raster> {
        self.raster.band_array(band)
    }

    fn add_band(&mut self, data: Raster, params: BandParams) -> FuseResult<()> {
        self.raster.add_band(data, params)
    }

    fn export(&self, path: &Path) -> FuseResult<()> {
        let mut exports = self
            .exports
            .lock()
            .map_err(|_| FuseError::Processing("In-memory export table poisoned".to_string()))?;
        exports.insert(path.to_path_buf(), self.raster.clone());
        Ok(())
    }

    fn corners(&self) -> FuseResult<Footprint> {
        self.raster.corners()
    }

    fn watermask(&self) -> FuseResult<Array2<u8>> {
        self.raster.watermask()
    }
}

/// Path-keyed in-memory raster store
#[derive(Debug, Default)]
pub struct MemoryBackend {
    datasets: HashMap<PathBuf, MemoryRaster>,
    watermask: Option<Arc<MemoryRaster>>,
    exports: Arc<Mutex<HashMap<PathBuf, MemoryRaster>>>,
    quicklooks: Mutex<HashMap<PathBuf, Array2<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<P: Into<PathBuf>>(&mut self, path: P, raster: MemoryRaster) {
        self.datasets.insert(path.into(), raster);
    }

    /// Land/water categories (band 1) served by every handle's `watermask()`
    pub fn with_watermask(mut self, raster: MemoryRaster) -> Self {
        self.watermask = Some(Arc::new(raster));
        self
    }

    /// Raster exported to `path`, if any
    pub fn exported<P: AsRef<Path>>(&self, path: P) -> Option<MemoryRaster> {
        self.exports.lock().ok()?.get(path.as_ref()).cloned()
    }

    pub fn quicklook<P: AsRef<Path>>(&self, path: P) -> Option<Array2<u8>> {
        self.quicklooks.lock().ok()?.get(path.as_ref()).cloned()
    }

    fn handle(&self, mut raster: MemoryRaster) -> MemoryHandle {
        raster.watermask = self.watermask.clone();
        MemoryHandle {
            raster,
            exports: Arc::clone(&self.exports),
        }
    }
}

impl RasterBackend for MemoryBackend {
    type Handle = MemoryHandle;

    fn open(&self, path: &Path) -> FuseResult<MemoryHandle> {
        if let Some(raster) = self.datasets.get(path) {
            return Ok(self.handle(raster.clone()));
        }
        if let Some(raster) = self.exported(path) {
            return Ok(self.handle(raster));
        }
        Err(FuseError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("No in-memory raster registered at {}", path.display()),
        )))
    }

    fn create(&self, domain: &Domain) -> FuseResult<MemoryHandle> {
        Ok(self.handle(MemoryRaster::on_domain(domain)))
    }

    fn write_quicklook(&self, image: &Array2<u8>, path: &Path) -> FuseResult<()> {
        let mut quicklooks = self
            .quicklooks
            .lock()
            .map_err(|_| FuseError::Processing("In-memory quicklook table poisoned".to_string()))?;
        quicklooks.insert(path.to_path_buf(), image.clone());
        Ok(())
    }
}

fn same_srs(a: &str, b: &str) -> bool {
    a.trim() == b.trim() || (domain::is_geographic(a) && domain::is_geographic(b))
}

/// Resample a north-up raster onto `target`.
///
/// Destination pixels outside the source grid are 0, matching the default
/// destination initialisation of a GDAL warp.
pub fn resample(source: &Raster, source_transform: &GeoTransform, target: &Domain, alg: ResampleAlg) -> Raster {
    let (rows, cols) = target.shape();
    let (src_rows, src_cols) = source.dim();
    let target_transform = target.transform();
    let mut resampled = Array2::zeros((rows, cols));

    for i in 0..rows {
        for j in 0..cols {
            let (x, y) = target_transform.pixel_to_map(j as f64 + 0.5, i as f64 + 0.5);
            let (col, row) = source_transform.map_to_pixel(x, y);

            if col < 0.0 || row < 0.0 || col >= src_cols as f64 || row >= src_rows as f64 {
                continue;
            }

            resampled[[i, j]] = match alg {
                ResampleAlg::NearestNeighbour => source[[row.floor() as usize, col.floor() as usize]],
                ResampleAlg::Bilinear => bilinear_sample(source, col - 0.5, row - 0.5),
            };
        }
    }

    resampled
}

/// Bilinear interpolation at pixel-center coordinates, skipping non-finite neighbours
fn bilinear_sample(source: &Raster, x: f64, y: f64) -> f32 {
    let (height, width) = source.dim();
    let x = x.clamp(0.0, (width - 1) as f64);
    let y = y.clamp(0.0, (height - 1) as f64);

    let x1 = x.floor() as usize;
    let y1 = y.floor() as usize;
    let x2 = (x1 + 1).min(width - 1);
    let y2 = (y1 + 1).min(height - 1);
    let dx = x - x1 as f64;
    let dy = y - y1 as f64;

    let neighbours = [
        (y1, x1, (1.0 - dx) * (1.0 - dy)),
        (y1, x2, dx * (1.0 - dy)),
        (y2, x1, (1.0 - dx) * dy),
        (y2, x2, dx * dy),
    ];

    let mut sum = 0.0;
    let mut weight = 0.0;
    for (r, c, w) in neighbours {
        if w <= 0.0 {
            continue;
        }
        let v = source[[r, c]];
        if v.is_finite() {
            sum += v as f64 * w;
            weight += w;
        }
    }

    if weight > 0.0 {
        (sum / weight) as f32
    } else {
        f32::NAN
    }
}
