//! colorfuse: Sentinel-2 / MODIS-Aqua ocean-color mosaicking and fusion
//!
//! Mosaics Sentinel-2 granule tiles onto a common grid, co-registers a
//! MODIS-Aqua L2 reference through a per-pixel index, masks the
//! high-resolution cube and hands both to a fusion model. A thin wrapper
//! around an external bio-optical inversion completes the chain.

pub mod bands;
pub mod config;
pub mod core;
pub mod io;
pub mod types;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use bands::{BandTable, ModisBandSet};
pub use config::PipelineConfig;
pub use types::{BoundingBox, Footprint, FuseError, FuseResult, GeoTransform, Raster, RasterCube, ResampleAlg};

pub use crate::core::{Domain, DomainBuilder, FusionPipeline, RunContext, SpectralCube};
pub use io::{GdalBackend, GranuleLocator, MemoryBackend, RasterBackend, RasterHandle};
