#![allow(dead_code)]

use colorfuse::config::PipelineConfig;
use colorfuse::core::domain::{DomainMode, WGS84_PROJ4};
use colorfuse::io::raster::BandParams;
use colorfuse::io::{MemoryBackend, MemoryRaster};
use colorfuse::types::{GeoTransform, ResampleAlg};
use ndarray::Array2;
use std::fs;
use std::path::{Path, PathBuf};

pub const SCENE: &str = "S2A_MSIL1C_20160602T164002_N0202_R126_T16TER_20160602T164002.SAFE";
pub const LORES: &str = "A2016154184500.L2_LAC_OC.nc";

/// (granule id, top-left lon, top-left lat, tile value); each tile is 2x2 at 1 degree
pub const TILES: [(&str, f64, f64, f32); 4] = [
    ("16TER", 0.0, 4.0, 2.0),
    ("16TFR", 2.0, 4.0, 4.0),
    ("16TEQ", 0.0, 2.0, 1.0),
    ("16TFQ", 2.0, 2.0, 3.0),
];

pub fn granule_dir(scene: &Path, id: &str) -> PathBuf {
    scene
        .join("GRANULE")
        .join(format!("L1C_T{}_A005029_20160602T164002", id))
        .join("IMG_DATA")
}

pub fn band_path(scene: &Path, id: &str, code: &str) -> PathBuf {
    granule_dir(scene, id).join(format!("T{}_20160602T164002_B{}.jp2", id, code))
}

/// Lay out the four-granule scene on disk and register its tiles
pub fn build_scene(root: &Path, backend: &mut MemoryBackend, codes: &[&str]) -> PathBuf {
    lay_out_scene(root, backend, codes, None)
}

/// Same scene with every tile holding `value`
pub fn build_flat_scene(root: &Path, backend: &mut MemoryBackend, codes: &[&str], value: f32) -> PathBuf {
    lay_out_scene(root, backend, codes, Some(value))
}

fn lay_out_scene(root: &Path, backend: &mut MemoryBackend, codes: &[&str], flat: Option<f32>) -> PathBuf {
    let scene = root.join(SCENE);
    for (id, x0, y0, tile_value) in TILES {
        let value = flat.unwrap_or(tile_value);
        fs::create_dir_all(granule_dir(&scene, id)).unwrap();
        for code in codes {
            let path = band_path(&scene, id, code);
            fs::write(&path, b"").unwrap();
            let raster = MemoryRaster::new(WGS84_PROJ4, GeoTransform::north_up(x0, y0, 1.0, 1.0), (2, 2))
                .with_band(Array2::from_elem((2, 2), value), BandParams::named("band_1"))
                .unwrap();
            backend.insert(path, raster);
        }
    }
    scene
}

/// 2x2 MODIS-like reference at 2 degrees over the same area; Rrs_412 is negative top-left
pub fn build_reference(root: &Path, backend: &mut MemoryBackend, names: &[String], value: f32) -> PathBuf {
    lay_out_reference(root, backend, names, value, true)
}

/// Reference with every pixel of every band equal to `value`
pub fn build_flat_reference(root: &Path, backend: &mut MemoryBackend, names: &[String], value: f32) -> PathBuf {
    lay_out_reference(root, backend, names, value, false)
}

fn lay_out_reference(root: &Path, backend: &mut MemoryBackend, names: &[String], value: f32, negative: bool) -> PathBuf {
    let path = root.join(LORES);
    let mut raster = MemoryRaster::new(WGS84_PROJ4, GeoTransform::north_up(0.0, 4.0, 2.0, 2.0), (2, 2));
    for name in names {
        let mut data = Array2::from_elem((2, 2), value);
        if negative && name == "Rrs_412" {
            data[[0, 0]] = -0.1;
        }
        raster = raster.with_band(data, BandParams::named(name)).unwrap();
    }
    backend.insert(path.clone(), raster);
    path
}

/// All-water land/water categories on the 4x4 grid
pub fn water_everywhere() -> MemoryRaster {
    MemoryRaster::new(WGS84_PROJ4, GeoTransform::north_up(0.0, 4.0, 1.0, 1.0), (4, 4))
        .with_band(Array2::from_elem((4, 4), 1.0), BandParams::named("watermask"))
        .unwrap()
}

pub fn test_config(output_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.scene.bands = ["01", "02", "03", "04", "05"].iter().map(|s| s.to_string()).collect();
    config.domain.target = DomainMode::Derived { spacing: 1.0 };
    config.domain.tile_spacing = 1.0;
    config.mosaic.resampling = ResampleAlg::NearestNeighbour;
    config.mosaic.max_workers = 2;
    config.masking.cloud_band = 4;
    config.masking.reference_band = 0;
    config.masking.crop = Some(3);
    config.fusion.band_set = colorfuse::ModisBandSet::OneKm;
    config.inversion.band_set = colorfuse::ModisBandSet::OneKm;
    config.output_dir = output_dir.to_path_buf();
    config
}
