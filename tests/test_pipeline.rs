mod common;

use colorfuse::core::fusion::{FuseRequest, Fuser};
use colorfuse::core::inversion::{BioOpticalModel, InversionOutput, InversionRequest};
use colorfuse::core::masking::MaskStage;
use colorfuse::io::raster::RasterHandle;
use colorfuse::io::MemoryBackend;
use colorfuse::types::{FuseError, FuseResult, Raster};
use colorfuse::{FusionPipeline, RunContext};
use common::*;
use ndarray::{array, Array2};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Fills the grid with the mean of the valid low-resolution pixels
struct MeanFuser;

impl Fuser for MeanFuser {
    fn fuse(&self, request: &FuseRequest<'_>) -> FuseResult<Raster> {
        let valid: Vec<f32> = request.lores.iter().copied().filter(|v| v.is_finite()).collect();
        let mean = valid.iter().sum::<f32>() / valid.len().max(1) as f32;
        Ok(Array2::from_elem(request.shape(), mean))
    }
}

struct UnitModel;

impl BioOpticalModel for UnitModel {
    fn process(&self, request: &InversionRequest<'_>) -> FuseResult<InversionOutput> {
        let shape = request.mask.dim();
        Ok(InversionOutput {
            chl: Array2::ones(shape),
            tsm: Array2::ones(shape),
            doc: Array2::ones(shape),
            mse: Array2::zeros(shape),
            mask: request.mask.to_owned(),
        })
    }
}

fn setup() -> (TempDir, MemoryBackend, std::path::PathBuf, std::path::PathBuf) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let mut backend = MemoryBackend::new().with_watermask(water_everywhere());
    let scene = build_scene(dir.path(), &mut backend, &["01", "02", "03", "04", "05"]);
    let names = colorfuse::ModisBandSet::OneKm.band_names();
    let lores = build_reference(dir.path(), &mut backend, &names, 0.5);
    (dir, backend, scene, lores)
}

#[test]
fn test_end_to_end_run() {
    let (dir, backend, scene, lores) = setup();
    let output_dir = dir.path().join("out");
    let pipeline = FusionPipeline::new(&backend, &MeanFuser, test_config(&output_dir)).unwrap();

    let output = pipeline.run(&scene, &lores, &RunContext::new()).unwrap();

    assert_eq!(output.domain.shape(), (4, 4));
    assert_eq!(output.masking.crop, Some((3, 3)));
    assert_eq!(
        output.masking.stages,
        vec![MaskStage::OutOfSwath, MaskStage::WaterAndCloud, MaskStage::Truncate, MaskStage::Crop]
    );

    // Granule order TEQ, TER, TFQ, TFR; tiles do not overlap
    let b01 = output.cube.band(0).unwrap();
    assert_eq!(b01[[0, 0]], 2.0);
    assert_eq!(b01[[0, 2]], 4.0);
    assert_eq!(b01[[2, 0]], 1.0);
    assert_eq!(b01[[2, 2]], 3.0);

    let fusion = &output.fusion;
    assert_eq!(fusion.band_names()[0], "Rrs_412");
    assert_eq!(fusion.fused.len(), 6);
    assert!(fusion.lores[0].data[[0, 0]].is_nan());
    assert_eq!(fusion.lores[0].data[[2, 2]], 0.5);
    assert!(fusion.fused[0].data.iter().all(|&v| v == 0.5));

    let fused = backend.exported(output_dir.join(format!("{}_fused.nc", SCENE))).unwrap();
    assert_eq!(fused.shape(), (3, 3));
    assert!(backend.exported(output_dir.join(format!("{}_full.nc", SCENE))).is_some());
    assert!(backend
        .exported(output_dir.join(format!("{}_reprojected.nc", LORES)))
        .is_some());
    assert!(backend.exported(output_dir.join(format!("{}_lores.nc", LORES))).is_some());
}

#[test]
fn test_identity_fusion_returns_reference() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let mut backend = MemoryBackend::new().with_watermask(water_everywhere());
    let scene = build_flat_scene(dir.path(), &mut backend, &["01", "02", "03", "04", "05"], 2.0);
    let names = colorfuse::ModisBandSet::OneKm.band_names();
    let lores = build_flat_reference(dir.path(), &mut backend, &names, 1.0);

    let calls = AtomicUsize::new(0);
    let identity = |request: &FuseRequest<'_>| -> FuseResult<Raster> {
        calls.fetch_add(1, Ordering::SeqCst);
        // Each 2-degree reference pixel covers a 2x2 block of the 1-degree grid
        assert_eq!(request.index, array![[0, 0, 1], [0, 0, 1], [2, 2, 3]]);
        assert!(request.hires.iter().all(|&v| v == 2.0));
        Ok(request.lores.to_owned())
    };
    let output_dir = dir.path().join("out");
    let pipeline = FusionPipeline::new(&backend, &identity, test_config(&output_dir)).unwrap();

    let output = pipeline.run(&scene, &lores, &RunContext::new()).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), names.len());
    let fusion = &output.fusion;
    assert_eq!(fusion.fused.len(), names.len());
    for (lo, fused) in fusion.lores.iter().zip(&fusion.fused) {
        assert_eq!(lo.name(), fused.name());
        assert_eq!(lo.data, Array2::<f32>::ones((3, 3)));
        assert_eq!(fused.data, Array2::<f32>::ones((3, 3)));
    }

    let exported = backend.exported(output_dir.join(format!("{}_fused.nc", SCENE))).unwrap();
    assert_eq!(exported.band_count(), names.len());
}

#[test]
fn test_missing_watermask_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let mut backend = MemoryBackend::new();
    let scene = build_scene(dir.path(), &mut backend, &["01", "02", "03", "04", "05"]);
    let names = colorfuse::ModisBandSet::OneKm.band_names();
    let lores = build_reference(dir.path(), &mut backend, &names, 0.5);
    let output_dir = dir.path().join("out");
    let pipeline = FusionPipeline::new(&backend, &MeanFuser, test_config(&output_dir)).unwrap();

    let err = pipeline.run(&scene, &lores, &RunContext::new()).unwrap_err();
    assert!(matches!(err, FuseError::Config(_)));
    assert!(backend.exported(output_dir.join(format!("{}_fused.nc", SCENE))).is_none());

    let mut config = test_config(&output_dir);
    config.masking.mask = false;
    let pipeline = FusionPipeline::new(&backend, &MeanFuser, config).unwrap();
    let output = pipeline.run(&scene, &lores, &RunContext::new()).unwrap();
    assert!(!output.masking.stages.contains(&MaskStage::WaterAndCloud));
}

#[test]
fn test_cancelled_run_stops_before_lookup() {
    let (dir, backend, scene, lores) = setup();
    let pipeline = FusionPipeline::new(&backend, &MeanFuser, test_config(dir.path())).unwrap();
    let ctx = RunContext::new();
    ctx.cancel();

    let err = pipeline.run(&scene, &lores, &ctx).unwrap_err();
    assert!(matches!(err, FuseError::Cancelled(_)));
}

#[test]
fn test_fuser_failure_names_band() {
    let (dir, backend, scene, lores) = setup();
    let failing = |_: &FuseRequest<'_>| -> FuseResult<Raster> { Err(FuseError::Processing("diverged".to_string())) };
    let pipeline = FusionPipeline::new(&backend, &failing, test_config(dir.path())).unwrap();

    match pipeline.run(&scene, &lores, &RunContext::new()).unwrap_err() {
        FuseError::Collaborator { stage, band, .. } => {
            assert_eq!(stage, "fusion");
            assert_eq!(band, "Rrs_412");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_quicklook_and_archive() {
    let (dir, backend, scene, _) = setup();
    let mut config = test_config(dir.path());
    config.mosaic.quicklook = true;
    config.mosaic.archive = true;
    let pipeline = FusionPipeline::new(&backend, &MeanFuser, config).unwrap();

    pipeline.build_hires(&scene, &RunContext::new()).unwrap();

    let image = backend.quicklook(dir.path().join(format!("{}_ql.png", SCENE))).unwrap();
    assert_eq!(image.dim(), (4, 4));
    // Below the quicklook floor everywhere
    assert!(image.iter().all(|&v| v == 0));

    let cube = colorfuse::io::archive::load_cube(&dir.path().join(format!("{}.npz", SCENE))).unwrap();
    assert_eq!(cube.dim(), (5, 4, 4));
}

#[test]
fn test_product_name_is_checked() {
    let (dir, backend, _, lores) = setup();
    let pipeline = FusionPipeline::new(&backend, &MeanFuser, test_config(dir.path())).unwrap();
    let err = pipeline.run(&lores, &lores, &RunContext::new()).unwrap_err();
    assert!(matches!(err, FuseError::Config(_)));
}

#[test]
fn test_inversion_on_domain() {
    let (dir, backend, scene, lores) = setup();
    let pipeline = FusionPipeline::new(&backend, &MeanFuser, test_config(dir.path())).unwrap();
    let (domain, _) = pipeline.build_hires(&scene, &RunContext::new()).unwrap();

    let bands = pipeline.invert(&UnitModel, &lores, &domain, &RunContext::new()).unwrap();
    let chl = bands.iter().find(|b| b.name() == "chl").unwrap();
    assert_eq!(chl.data.dim(), (4, 4));
    assert!(backend
        .exported(dir.path().join(format!("{}_inversion.nc", LORES)))
        .is_some());
}
