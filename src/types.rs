use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

/// Single-band raster (rows x columns)
pub type Raster = Array2<f32>;

/// Band-ordered raster stack (band x rows x columns)
pub type RasterCube = Array3<f32>;

/// Integer raster holding linear pixel indexes
pub type IndexRaster = Array2<i32>;

/// Resampling algorithm used when a raster is reprojected onto a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResampleAlg {
    /// Categorical data (indexes, masks)
    NearestNeighbour,
    /// Radiometric bands
    Bilinear,
}

impl std::fmt::Display for ResampleAlg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResampleAlg::NearestNeighbour => write!(f, "nearest"),
            ResampleAlg::Bilinear => write!(f, "bilinear"),
        }
    }
}

/// Geographic bounding box in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self { min_lon, max_lon, min_lat, max_lat }
    }

    /// Smallest box holding every (lon, lat) point, `None` for an empty set
    pub fn from_points<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        let mut bbox: Option<BoundingBox> = None;
        for (lon, lat) in points {
            bbox = Some(match bbox {
                None => BoundingBox::new(lon, lat, lon, lat),
                Some(b) => BoundingBox::new(
                    b.min_lon.min(lon),
                    b.min_lat.min(lat),
                    b.max_lon.max(lon),
                    b.max_lat.max(lat),
                ),
            });
        }
        bbox
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox::new(
            self.min_lon.min(other.min_lon),
            self.min_lat.min(other.min_lat),
            self.max_lon.max(other.max_lon),
            self.max_lat.max(other.max_lat),
        )
    }

    pub fn contains_point(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }

    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.contains_point(other.min_lon, other.min_lat)
            && self.contains_point(other.max_lon, other.max_lat)
    }

    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }
}

/// Affine pixel-to-map transform, GDAL ordering
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform without rotation
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Map coordinates of a (fractional) pixel position
    pub fn pixel_to_map(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        )
    }

    /// Fractional pixel position of map coordinates, rotation terms ignored
    pub fn map_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.top_left_x) / self.pixel_width,
            (y - self.top_left_y) / self.pixel_height,
        )
    }

    /// Map corners (UL, UR, LR, LL) of a raster of the given shape
    pub fn corners(&self, rows: usize, cols: usize) -> [(f64, f64); 4] {
        let (r, c) = (rows as f64, cols as f64);
        [
            self.pixel_to_map(0.0, 0.0),
            self.pixel_to_map(c, 0.0),
            self.pixel_to_map(c, r),
            self.pixel_to_map(0.0, r),
        ]
    }
}

/// Ordered polygon of (lon, lat) corner points of one tile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    pub corners: Vec<(f64, f64)>,
}

impl Footprint {
    pub fn new(corners: Vec<(f64, f64)>) -> Self {
        Self { corners }
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(self.corners.iter().copied())
    }
}

/// Error types for mosaicking and fusion
#[derive(Debug, thiserror::Error)]
pub enum FuseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflicting files: {0}")]
    Ambiguous(String),

    #[error("Shape mismatch in {stage}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        stage: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("{stage} failed for {band}: {message}")]
    Collaborator {
        stage: String,
        band: String,
        message: String,
    },

    #[error("Run cancelled during {0}")]
    Cancelled(String),

    #[error("Deadline exceeded during {0}")]
    DeadlineExceeded(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

impl FuseError {
    /// Only a missing or conflicting per-tile band file may be skipped
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FuseError::NotFound(_) | FuseError::Ambiguous(_))
    }

    pub fn shape_mismatch(stage: &str, expected: (usize, usize), found: (usize, usize)) -> Self {
        FuseError::ShapeMismatch {
            stage: stage.to_string(),
            expected,
            found,
        }
    }
}

/// Result type for mosaicking and fusion operations
pub type FuseResult<T> = Result<T, FuseError>;

/// Fails with `ShapeMismatch` unless `found == expected`
pub fn ensure_shape(stage: &str, expected: (usize, usize), found: (usize, usize)) -> FuseResult<()> {
    if expected != found {
        return Err(FuseError::shape_mismatch(stage, expected, found));
    }
    Ok(())
}
