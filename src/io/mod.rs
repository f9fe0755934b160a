//! I/O modules for raster files, granule trees and auxiliary products

pub mod archive;
pub mod bathymetry;
pub mod gdal_raster;
pub mod granule;
pub mod memory;
pub mod quicklook;
pub mod raster;
pub mod scene;
pub mod swath;

pub use gdal_raster::{GdalBackend, GdalRaster};
pub use granule::{Granule, GranuleLayout, GranuleLocator, Tile};
pub use memory::{MemoryBackend, MemoryRaster};
pub use raster::{BandId, BandParams, NamedBand, RasterBackend, RasterHandle};
pub use scene::{SceneInfo, Sensor};
