//! Run context and the end-to-end mosaic, masking and fusion pipeline

use crate::bands::BandTable;
use crate::config::PipelineConfig;
use crate::core::cube::SpectralCube;
use crate::core::domain::{Domain, DomainBuilder};
use crate::core::fusion::{FusionResult, FusionStage, Fuser};
use crate::core::inversion::{BioOpticalModel, InversionStage};
use crate::core::masking::{CubeMasker, MaskInputs, MaskingOutcome};
use crate::core::mosaic::Mosaicker;
use crate::core::reference::{prepare_reference, reprojected_path, LowResReference};
use crate::io::archive::save_cube;
use crate::io::bathymetry::load_depth;
use crate::io::granule::GranuleLocator;
use crate::io::quicklook::{quicklook_path, write_quicklook};
use crate::io::raster::{BandId, NamedBand, RasterBackend, RasterHandle};
use crate::io::scene::{SceneInfo, Sensor};
use crate::types::{FuseError, FuseResult, Raster, ResampleAlg};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cancellation flag and deadline shared by every stage of a run
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    cancelled: Arc<AtomicBool>,
    /// Flags of every enclosing context, outermost first
    ancestors: Vec<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Flag another thread can set to stop the run
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.ancestors.iter().any(|a| a.load(Ordering::SeqCst))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Context that observes this one and all of its ancestors but can be
    /// cancelled on its own
    pub fn child(&self) -> RunContext {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(Arc::clone(&self.cancelled));
        RunContext {
            cancelled: Arc::new(AtomicBool::new(false)),
            ancestors,
            deadline: self.deadline,
        }
    }

    /// Child whose deadline is at most `timeout` from now
    pub fn child_with_timeout(&self, timeout: Duration) -> RunContext {
        let limit = Instant::now() + timeout;
        let mut child = self.child();
        child.deadline = Some(self.deadline.map_or(limit, |d| d.min(limit)));
        child
    }

    /// Fail if the run was cancelled or its deadline passed
    pub fn checkpoint(&self, stage: &str) -> FuseResult<()> {
        if self.is_cancelled() {
            return Err(FuseError::Cancelled(stage.to_string()));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(FuseError::DeadlineExceeded(stage.to_string()));
            }
        }
        Ok(())
    }
}

/// Everything a fusion run produced
#[derive(Debug)]
pub struct PipelineOutput {
    pub domain: Domain,
    pub cube: SpectralCube,
    pub masking: MaskingOutcome,
    pub fusion: FusionResult,
}

/// Granule lookup, mosaicking, masking and fusion wired together
pub struct FusionPipeline<'a, B: RasterBackend, F: Fuser + ?Sized> {
    backend: &'a B,
    fuser: &'a F,
    config: PipelineConfig,
    table: BandTable,
}

impl<'a, B: RasterBackend, F: Fuser + ?Sized> FusionPipeline<'a, B, F> {
    pub fn new(backend: &'a B, fuser: &'a F, config: PipelineConfig) -> FuseResult<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            fuser,
            config,
            table: BandTable::sentinel2()?,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn output_path(&self, source: &Path, suffix: &str) -> PathBuf {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "scene".to_string());
        self.config.output_dir.join(format!("{}{}", name, suffix))
    }

    /// Mosaic a Sentinel-2 scene and move the cube onto the target domain
    pub fn build_hires(&self, scene: &Path, ctx: &RunContext) -> FuseResult<(Domain, SpectralCube)> {
        let scene_cfg = &self.config.scene;
        if scene_cfg.check_product_name {
            let info = SceneInfo::expect(scene, Sensor::Sentinel2)?;
            log::info!("{} scene sensed {}", info.mission, info.sensing_time);
        }

        ctx.checkpoint("granule lookup")?;
        let locator = GranuleLocator::new(scene, scene_cfg.layout);
        let granules = locator.find_granules(&scene_cfg.granules)?;
        let (footprints, tile_srs) = locator.footprints(self.backend, &granules, &scene_cfg.footprint_band)?;

        let tile_domain = DomainBuilder::derived(&footprints, &tile_srs, self.config.domain.tile_spacing)?;
        let target = DomainBuilder::build(&self.config.domain.target, &footprints, &tile_srs)?;

        let cube = Mosaicker::new(self.backend, &tile_domain, &self.config.mosaic).mosaic_bands(
            &locator,
            &granules,
            &scene_cfg.bands,
            &self.table,
            ctx,
        )?;

        if self.config.mosaic.archive {
            save_cube(&self.output_path(scene, ".npz"), cube.data())?;
        }
        if self.config.mosaic.quicklook {
            self.write_granule_quicklook(scene, &tile_domain, &cube)?;
        }

        ctx.checkpoint("cube reprojection")?;
        let cube = if tile_domain == target {
            cube
        } else {
            self.reproject_cube(cube, &tile_domain, &target)?
        };

        let bands = cube.clone().into_named_bands();
        self.backend
            .export_bands(&target, &bands, &self.output_path(scene, "_full.nc"))?;
        Ok((target, cube))
    }

    fn reproject_cube(&self, cube: SpectralCube, from: &Domain, to: &Domain) -> FuseResult<SpectralCube> {
        let bands = cube.into_named_bands();
        let mut handle = self.backend.create_with_bands(from, &bands)?;
        handle.reproject(to, self.config.domain.target_resampling)?;

        let moved = bands
            .into_iter()
            .map(|band| {
                let data = handle.band_array(&BandId::from(band.params.name.as_str()))?;
                Ok(NamedBand::new(band.params, data))
            })
            .collect::<FuseResult<Vec<_>>>()?;
        SpectralCube::from_bands(moved)
    }

    fn write_granule_quicklook(&self, scene: &Path, domain: &Domain, cube: &SpectralCube) -> FuseResult<()> {
        let code = &self.config.scene.footprint_band;
        let index = match self.config.scene.bands.iter().position(|b| b == code) {
            Some(index) => index,
            None => {
                log::warn!("Quicklook band B{} was not mosaicked", code);
                return Ok(());
            }
        };
        let watermask = match self.backend.create(domain)?.watermask() {
            Ok(mask) => Some(mask),
            Err(FuseError::Config(msg)) => {
                log::warn!("Quicklook without water mask: {}", msg);
                None
            }
            Err(e) => return Err(e),
        };
        write_quicklook(
            self.backend,
            &cube.band_raster(index)?,
            watermask.as_ref(),
            &self.config.quicklook,
            &quicklook_path(&self.config.output_dir, scene),
        )
    }

    /// Low-resolution band names to carry, including the negative-pixel band
    fn reference_bands(&self) -> Vec<String> {
        let mut names = self.config.fusion.band_set.band_names();
        let negative = &self.config.masking.negative_pixel_band;
        if self.config.masking.negative_pixels && !names.contains(negative) {
            names.insert(0, negative.clone());
        }
        names
    }

    /// Index, reproject and export the low-resolution scene
    pub fn prepare_reference(&self, lores: &Path, domain: &Domain) -> FuseResult<B::Handle> {
        if self.config.scene.check_product_name {
            SceneInfo::expect(lores, Sensor::ModisAqua)?;
        }
        prepare_reference(
            self.backend,
            lores,
            domain,
            &self.reference_bands(),
            &reprojected_path(&self.config.output_dir, lores),
        )
    }

    /// Mask a cube already on `domain` and fuse it with a prepared reference
    pub fn fuse_cube(
        &self,
        mut cube: SpectralCube,
        domain: &Domain,
        reference: B::Handle,
        ctx: &RunContext,
    ) -> FuseResult<PipelineOutput> {
        let masking_cfg = &self.config.masking;
        let negative_band = masking_cfg
            .negative_pixels
            .then(|| masking_cfg.negative_pixel_band.as_str());
        let mut reference = LowResReference::load(reference, domain, negative_band, masking_cfg.mask)?;

        let depth = match (&masking_cfg.depth, &self.config.bathymetry_path) {
            (Some(_), Some(path)) => Some(load_depth(self.backend, path, domain)?),
            (Some(_), None) => {
                return Err(FuseError::Config(
                    "Depth masking needs bathymetry_path".to_string(),
                ))
            }
            (None, _) => None,
        };

        let inputs = MaskInputs {
            watermask: reference.watermask(),
            negative_pixels: reference.negative_pixels(),
            depth: depth.as_ref(),
        };
        let masking = CubeMasker::new(masking_cfg).run(&mut cube, inputs, ctx)?;
        if let Some((rows, cols)) = masking.crop {
            reference.crop(rows, cols);
        }

        let band_names = self.config.fusion.band_set.band_names();
        let fusion = FusionStage::new(self.fuser, &self.config.fusion).run(&cube, &reference, &band_names, ctx)?;

        Ok(PipelineOutput {
            domain: domain.clone(),
            cube,
            masking,
            fusion,
        })
    }

    /// Full run: mosaic `scene`, prepare `lores`, mask, fuse and export
    pub fn run(&self, scene: &Path, lores: &Path, ctx: &RunContext) -> FuseResult<PipelineOutput> {
        let started = Instant::now();
        let (domain, cube) = self.build_hires(scene, ctx)?;

        ctx.checkpoint("reference preparation")?;
        let reference = self.prepare_reference(lores, &domain)?;
        let output = self.fuse_cube(cube, &domain, reference, ctx)?;

        output.fusion.export(
            self.backend,
            &domain,
            &self.output_path(lores, "_lores.nc"),
            &self.output_path(scene, "_fused.nc"),
        )?;

        log::info!("Fusion run finished in {:.1?}", started.elapsed());
        Ok(output)
    }

    /// Invert a low-resolution scene on `domain` and export the products
    pub fn invert<M: BioOpticalModel + ?Sized>(
        &self,
        model: &M,
        scene: &Path,
        domain: &Domain,
        ctx: &RunContext,
    ) -> FuseResult<Vec<NamedBand>> {
        ctx.checkpoint("inversion")?;
        let mut handle = self.backend.open(scene)?;
        handle.reproject(domain, ResampleAlg::NearestNeighbour)?;

        let depth: Option<Raster> = match &self.config.bathymetry_path {
            Some(path) => Some(load_depth(self.backend, path, domain)?),
            None => None,
        };

        let name = scene
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bands = InversionStage::new(model, &self.config.inversion).run(&handle, &name, depth.as_ref())?;
        self.backend
            .export_bands(domain, &bands, &self.output_path(scene, "_inversion.nc"))?;
        Ok(bands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_context_fails_checkpoint() {
        let ctx = RunContext::new();
        ctx.checkpoint("mosaic").unwrap();
        ctx.cancel_flag().store(true, Ordering::SeqCst);
        assert!(matches!(ctx.checkpoint("mosaic"), Err(FuseError::Cancelled(_))));
    }

    #[test]
    fn test_child_cancellation_is_local() {
        let parent = RunContext::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_root_cancellation_reaches_grandchildren() {
        let root = RunContext::new();
        let stage = root.child_with_timeout(Duration::from_secs(3600));
        let worker = stage.child();
        assert!(!worker.is_cancelled());

        root.cancel();
        assert!(stage.is_cancelled());
        assert!(worker.is_cancelled());
        assert!(matches!(worker.checkpoint("mosaic"), Err(FuseError::Cancelled(_))));
    }

    #[test]
    fn test_deadline() {
        let ctx = RunContext::new().with_deadline(Instant::now());
        assert!(matches!(ctx.checkpoint("fusion"), Err(FuseError::DeadlineExceeded(_))));

        let relaxed = RunContext::new().with_timeout(Duration::from_secs(3600));
        let child = relaxed.child_with_timeout(Duration::from_secs(1));
        assert!(child.deadline() < relaxed.deadline());
        child.checkpoint("fusion").unwrap();
    }
}
