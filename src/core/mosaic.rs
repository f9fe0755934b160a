//! Mosaicker / Reprojector
//!
//! Each band mosaic starts as a NaN grid shaped like the domain. Tiles are
//! reprojected onto the domain one at a time, in granule order, and copied in
//! wherever their value is strictly positive, so later tiles win on overlaps.

use crate::bands::{rrs_name, BandTable};
use crate::config::MosaicConfig;
use crate::core::cube::SpectralCube;
use crate::core::domain::Domain;
use crate::core::pipeline::RunContext;
use crate::io::granule::{Granule, GranuleLocator, Tile};
use crate::io::raster::{BandId, BandParams, NamedBand, RasterBackend, RasterHandle};
use crate::types::{ensure_shape, FuseError, FuseResult, Raster};
use ndarray::{Array2, Zip};
use std::path::Path;

/// Copy valid (> 0) tile pixels over the mosaic; returns the number written
pub fn composite(mosaic: &mut Raster, tile: &Raster) -> FuseResult<usize> {
    ensure_shape("composite", mosaic.dim(), tile.dim())?;
    let mut written = 0;
    Zip::from(mosaic).and(tile).for_each(|m, &t| {
        if t > 0.0 {
            *m = t;
            written += 1;
        }
    });
    Ok(written)
}

/// Fraction of finite pixels
pub fn coverage(raster: &Raster) -> f64 {
    if raster.is_empty() {
        return 0.0;
    }
    raster.iter().filter(|v| v.is_finite()).count() as f64 / raster.len() as f64
}

/// Builds band mosaics on one domain
pub struct Mosaicker<'a, B: RasterBackend> {
    backend: &'a B,
    domain: &'a Domain,
    config: &'a MosaicConfig,
}

impl<'a, B: RasterBackend> Mosaicker<'a, B> {
    pub fn new(backend: &'a B, domain: &'a Domain, config: &'a MosaicConfig) -> Self {
        Self { backend, domain, config }
    }

    /// Band 1 of `path` on the domain grid
    pub fn reproject_tile(&self, path: &Path) -> FuseResult<Raster> {
        let mut handle = self.backend.open(path)?;
        handle.reproject(self.domain, self.config.resampling)?;
        let data = handle.band_array(&BandId::Number(1))?;
        ensure_shape(&format!("reprojection of {}", path.display()), self.domain.shape(), data.dim())?;
        Ok(data)
    }

    /// Composite tiles in the given order; lookup failures are skipped
    pub fn mosaic_tiles(&self, band_code: &str, tiles: Vec<FuseResult<Tile>>, ctx: &RunContext) -> FuseResult<Raster> {
        let mut mosaic = Array2::from_elem(self.domain.shape(), f32::NAN);
        let mut used = 0;

        for tile in tiles {
            ctx.checkpoint("mosaic")?;
            let tile = match tile {
                Ok(tile) => tile,
                Err(FuseError::Ambiguous(msg)) => {
                    log::warn!("B{}: skipping tile with band file conflict: {}", band_code, msg);
                    continue;
                }
                Err(e) if e.is_recoverable() => {
                    log::warn!("B{}: skipping missing tile: {}", band_code, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let data = self.reproject_tile(&tile.path)?;
            let written = composite(&mut mosaic, &data)?;
            used += 1;
            log::debug!("B{}: granule {} wrote {} pixels", band_code, tile.granule_id, written);
        }

        log::info!(
            "B{}: mosaicked {} tiles, {:.1}% coverage",
            band_code,
            used,
            100.0 * coverage(&mosaic)
        );
        Ok(mosaic)
    }

    pub fn mosaic_band(
        &self,
        locator: &GranuleLocator,
        granules: &[Granule],
        band_code: &str,
        ctx: &RunContext,
    ) -> FuseResult<Raster> {
        self.mosaic_tiles(band_code, locator.tiles(granules, band_code), ctx)
    }

    /// Mosaic every band and stack them in the order of `band_codes`
    pub fn mosaic_bands(
        &self,
        locator: &GranuleLocator,
        granules: &[Granule],
        band_codes: &[String],
        table: &BandTable,
        ctx: &RunContext,
    ) -> FuseResult<SpectralCube> {
        let params = band_codes
            .iter()
            .map(|code| {
                table
                    .wavelength(code)
                    .map(|w| BandParams::named(&rrs_name(w)).with_wavelength(w))
            })
            .collect::<FuseResult<Vec<_>>>()?;

        log::info!(
            "Mosaicking {} bands from {} granules onto a {:?} grid",
            band_codes.len(),
            granules.len(),
            self.domain.shape()
        );

        let mosaics = self.run_bands(locator, granules, band_codes, ctx)?;

        let bands = params
            .into_iter()
            .zip(mosaics)
            .map(|(params, data)| NamedBand::new(params, data))
            .collect();
        SpectralCube::from_bands(bands)
    }

    #[cfg(feature = "parallel")]
    fn run_bands(
        &self,
        locator: &GranuleLocator,
        granules: &[Granule],
        band_codes: &[String],
        ctx: &RunContext,
    ) -> FuseResult<Vec<Raster>> {
        use rayon::prelude::*;

        if !self.config.parallel || band_codes.len() < 2 {
            return self.run_bands_sequential(locator, granules, band_codes, ctx);
        }

        let workers = band_codes.len().min(self.config.max_workers).max(1);
        log::debug!("Mosaicking on {} workers", workers);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| FuseError::Processing(format!("Failed to start mosaic workers: {}", e)))?;

        // A failing worker stops its siblings without cancelling the caller's run
        let workers_ctx = ctx.child();
        let results: Vec<FuseResult<Raster>> = pool.install(|| {
            band_codes
                .par_iter()
                .map(|code| {
                    let result = self.mosaic_band(locator, granules, code, &workers_ctx);
                    if result.is_err() {
                        workers_ctx.cancel();
                    }
                    result
                })
                .collect()
        });

        collect_in_order(results)
    }

    #[cfg(not(feature = "parallel"))]
    fn run_bands(
        &self,
        locator: &GranuleLocator,
        granules: &[Granule],
        band_codes: &[String],
        ctx: &RunContext,
    ) -> FuseResult<Vec<Raster>> {
        self.run_bands_sequential(locator, granules, band_codes, ctx)
    }

    fn run_bands_sequential(
        &self,
        locator: &GranuleLocator,
        granules: &[Granule],
        band_codes: &[String],
        ctx: &RunContext,
    ) -> FuseResult<Vec<Raster>> {
        band_codes
            .iter()
            .map(|code| self.mosaic_band(locator, granules, code, ctx))
            .collect()
    }
}

/// Band-ordered results; the root failure wins over sibling cancellations
fn collect_in_order(results: Vec<FuseResult<Raster>>) -> FuseResult<Vec<Raster>> {
    let mut mosaics = Vec::with_capacity(results.len());
    let mut cancelled = None;
    let mut failure = None;

    for result in results {
        match result {
            Ok(mosaic) => mosaics.push(mosaic),
            Err(e @ FuseError::Cancelled(_)) => {
                cancelled.get_or_insert(e);
            }
            Err(e) => {
                failure.get_or_insert(e);
            }
        }
    }

    match (failure, cancelled) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(mosaics),
    }
}
