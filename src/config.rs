//! Pipeline configuration
//!
//! Loaded from YAML; every field has a default so partial files are accepted.
//!
//! ```yaml
//! scene:
//!   granules: [16TER, 16TFR]
//! masking:
//!   log_transform: true
//!   crop: 1000
//! fusion:
//!   band_set: one_km
//! ```

use crate::bands::{BandTable, ModisBandSet};
use crate::core::domain::{DomainMode, SENTINEL_SPACING};
use crate::io::bathymetry::DepthRange;
use crate::io::granule::GranuleLayout;
use crate::io::quicklook::QuicklookScale;
use crate::types::{FuseError, FuseResult, ResampleAlg};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Complete run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub scene: SceneConfig,
    pub domain: DomainConfig,
    pub mosaic: MosaicConfig,
    pub masking: MaskingConfig,
    pub fusion: FusionConfig,
    pub inversion: InversionConfig,
    pub quicklook: QuicklookScale,
    /// Elevation grid for the depth mask and the inversion
    pub bathymetry_path: Option<PathBuf>,
    /// Land/water category raster
    pub watermask_path: Option<PathBuf>,
    pub output_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scene: SceneConfig::default(),
            domain: DomainConfig::default(),
            mosaic: MosaicConfig::default(),
            masking: MaskingConfig::default(),
            fusion: FusionConfig::default(),
            inversion: InversionConfig::default(),
            quicklook: QuicklookScale::default(),
            bathymetry_path: None,
            watermask_path: None,
            output_dir: PathBuf::from("output"),
        }
    }
}

/// Granule selection and file layout of the high-resolution scene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub granules: Vec<String>,
    pub layout: GranuleLayout,
    /// Band codes to mosaic, in cube order
    pub bands: Vec<String>,
    /// Band whose tiles provide footprints and the tile projection
    pub footprint_band: String,
    /// Reject scenes whose product name does not match the sensor convention
    pub check_product_name: bool,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            granules: ["16TER", "16TFR", "16TEQ", "16TFQ"].iter().map(|s| s.to_string()).collect(),
            layout: GranuleLayout::Raw,
            bands: (1..=11).map(|b| format!("{:02}", b)).collect(),
            footprint_band: "01".to_string(),
            check_product_name: true,
        }
    }
}

/// Target grid and the intermediate tile grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    pub target: DomainMode,
    /// Spacing of the grid derived from the tile footprints (tile map units)
    pub tile_spacing: f64,
    /// Resampling used to move stacked cubes onto the target grid
    pub target_resampling: ResampleAlg,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            target: DomainMode::default(),
            tile_spacing: SENTINEL_SPACING,
            target_resampling: ResampleAlg::NearestNeighbour,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MosaicConfig {
    /// Resampling of radiometric tiles
    pub resampling: ResampleAlg,
    /// Mosaic bands on a worker pool
    pub parallel: bool,
    pub max_workers: usize,
    /// Write the B01 granule quicklook
    pub quicklook: bool,
    /// Cache the mosaicked cube as `<scene>.npz`
    pub archive: bool,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self {
            resampling: ResampleAlg::Bilinear,
            parallel: true,
            max_workers: 7,
            quicklook: false,
            archive: false,
        }
    }
}

/// Toggles and constants of the masking stages, applied in field order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingConfig {
    pub remove_out_of_swath: bool,
    /// Water-mask and cloud masking
    pub mask: bool,
    pub water_sigma: f32,
    /// Smoothed water-mask values above this are excluded
    pub water_threshold: f32,
    /// Cube band compared against `cloud_max`
    pub cloud_band: usize,
    pub cloud_max: f32,
    /// Cube band compared against `reference_min`
    pub reference_band: usize,
    pub reference_min: f32,
    /// Depth-range mask, disabled when absent
    pub depth: Option<DepthRange>,
    pub smooth: bool,
    pub smooth_sigma: f32,
    /// Build the negative-pixel mask from the low-resolution reference
    pub negative_pixels: bool,
    pub negative_pixel_band: String,
    /// Keep only the first N bands
    pub keep_bands: Option<usize>,
    pub log_transform: bool,
    /// Top-left crop size
    pub crop: Option<usize>,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            remove_out_of_swath: true,
            mask: true,
            water_sigma: 1.0,
            water_threshold: 1.0,
            cloud_band: 7,
            cloud_max: 2300.0,
            reference_band: 0,
            reference_min: -30.0,
            depth: None,
            smooth: false,
            smooth_sigma: 1.0,
            negative_pixels: true,
            negative_pixel_band: "Rrs_412".to_string(),
            keep_bands: Some(5),
            log_transform: false,
            crop: Some(2000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub band_set: ModisBandSet,
    pub iterations: usize,
    pub threads: usize,
    /// Wall-clock limit for the whole fusion stage
    pub deadline_secs: Option<u64>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            band_set: ModisBandSet::Full,
            iterations: 20,
            threads: 7,
            deadline_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InversionConfig {
    pub band_set: ModisBandSet,
    pub limits: ConcentrationLimits,
    pub threads: usize,
    /// Reflectance written by the L2 processor for invalid pixels
    pub invalid_reflectance: f32,
    /// Optically-shallow-water mode: pass depth and raw reflectance to the model
    pub shallow_water: bool,
}

impl Default for InversionConfig {
    fn default() -> Self {
        Self {
            band_set: ModisBandSet::Full,
            limits: ConcentrationLimits::default(),
            threads: 4,
            invalid_reflectance: -0.015534,
            shallow_water: true,
        }
    }
}

/// Bounds of the inversion search space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConcentrationLimits {
    pub chl: (f32, f32),
    pub tsm: (f32, f32),
    pub doc: (f32, f32),
    pub residual_limit: f32,
}

impl Default for ConcentrationLimits {
    fn default() -> Self {
        Self {
            chl: (0.01, 3.0),
            tsm: (0.01, 1.0),
            doc: (0.01, 1.0),
            residual_limit: 10.0,
        }
    }
}

impl ConcentrationLimits {
    /// Flat `[chl_min, chl_max, tsm_min, tsm_max, doc_min, doc_max, residual]`
    pub fn to_array(&self) -> [f32; 7] {
        [
            self.chl.0,
            self.chl.1,
            self.tsm.0,
            self.tsm.1,
            self.doc.0,
            self.doc.1,
            self.residual_limit,
        ]
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(yaml: &str) -> FuseResult<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FuseError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> FuseResult<Self> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path)
            .map_err(|e| FuseError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        log::info!("Loading configuration from {}", path.display());
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml(&self) -> FuseResult<String> {
        serde_yaml::to_string(self).map_err(|e| FuseError::Config(e.to_string()))
    }

    /// Check ranges and cross-field consistency
    pub fn validate(&self) -> FuseResult<()> {
        let table = BandTable::sentinel2()?;

        if self.scene.granules.is_empty() {
            return Err(FuseError::Config("No granules requested".to_string()));
        }
        if self.scene.bands.is_empty() {
            return Err(FuseError::Config("No bands requested".to_string()));
        }
        for code in self.scene.bands.iter().chain(std::iter::once(&self.scene.footprint_band)) {
            table.get(code)?;
        }

        if !(self.domain.tile_spacing > 0.0) {
            return Err(FuseError::Config(format!(
                "Tile spacing must be positive, got {}",
                self.domain.tile_spacing
            )));
        }
        if let DomainMode::Derived { spacing } = self.domain.target {
            if !(spacing > 0.0) {
                return Err(FuseError::Config(format!("Domain spacing must be positive, got {}", spacing)));
            }
        }
        if self.mosaic.max_workers == 0 {
            return Err(FuseError::Config("max_workers must be at least 1".to_string()));
        }

        let masking = &self.masking;
        let bands = self.scene.bands.len();
        if masking.mask && (masking.cloud_band >= bands || masking.reference_band >= bands) {
            return Err(FuseError::Config(format!(
                "Cloud band {} / reference band {} outside the {}-band cube",
                masking.cloud_band, masking.reference_band, bands
            )));
        }
        if masking.water_sigma < 0.0 || masking.smooth_sigma < 0.0 {
            return Err(FuseError::Config("Gaussian sigma must be non-negative".to_string()));
        }
        if masking.keep_bands == Some(0) {
            return Err(FuseError::Config("keep_bands must be at least 1".to_string()));
        }
        if masking.crop == Some(0) {
            return Err(FuseError::Config("crop must be at least 1".to_string()));
        }
        if masking.smooth && !masking.negative_pixels {
            return Err(FuseError::Config(
                "Smoothing needs the negative-pixel mask (negative_pixels: true)".to_string(),
            ));
        }
        if let Some(range) = &masking.depth {
            DepthRange::new(range.max_depth, range.min_depth)?;
        }

        if self.fusion.iterations == 0 || self.fusion.threads == 0 {
            return Err(FuseError::Config("Fusion iterations and threads must be positive".to_string()));
        }
        if self.inversion.threads == 0 {
            return Err(FuseError::Config("Inversion threads must be positive".to_string()));
        }
        let limits = &self.inversion.limits;
        for (name, (min, max)) in [("chl", limits.chl), ("tsm", limits.tsm), ("doc", limits.doc)] {
            if !(min >= 0.0 && min < max) {
                return Err(FuseError::Config(format!("Invalid {} limits [{}, {}]", name, min, max)));
            }
        }

        Ok(())
    }
}
