//! Target grids (domains) and the builder that derives them from tile footprints

use crate::types::{BoundingBox, Footprint, FuseError, FuseResult, GeoTransform};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use serde::{Deserialize, Serialize};

/// Plain WGS84 longitude/latitude definition
pub const WGS84_PROJ4: &str = "+proj=latlong +datum=WGS84 +ellps=WGS84 +no_defs";

/// Pixel spacing of a MODIS-resolution domain (meters)
pub const MODIS_SPACING: f64 = 1000.0;

/// Pixel spacing of a Sentinel-2 60 m domain (meters)
pub const SENTINEL_SPACING: f64 = 60.0;

/// How the grid resolution of a domain is specified
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PixelSpacing {
    /// Pixel size in map units
    Resolution { x: f64, y: f64 },
    /// Grid size in pixels
    Size { cols: usize, rows: usize },
}

/// Target grid: spatial reference, extent and pixel spacing
#[derive(Debug, Clone, PartialEq)]
pub struct Domain {
    srs: String,
    transform: GeoTransform,
    rows: usize,
    cols: usize,
    extent: BoundingBox,
}

impl Domain {
    /// Build a domain covering a lon/lat extent in the given spatial reference
    pub fn from_lonlat_extent(srs: &str, extent: BoundingBox, spacing: PixelSpacing) -> FuseResult<Self> {
        if !(extent.width() > 0.0 && extent.height() > 0.0) {
            return Err(FuseError::Config(format!("Degenerate domain extent {:?}", extent)));
        }

        let corners = [
            (extent.min_lon, extent.min_lat),
            (extent.min_lon, extent.max_lat),
            (extent.max_lon, extent.max_lat),
            (extent.max_lon, extent.min_lat),
        ];
        let projected = lonlat_to_srs(srs, &corners)?;

        let x_min = projected.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
        let x_max = projected.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
        let y_min = projected.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
        let y_max = projected.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);

        let (width, height) = (x_max - x_min, y_max - y_min);

        let (cols, rows, res_x, res_y) = match spacing {
            PixelSpacing::Resolution { x, y } => {
                if x <= 0.0 || y <= 0.0 {
                    return Err(FuseError::Config(format!("Invalid pixel spacing {} x {}", x, y)));
                }
                // Round up so the grid always covers the extent
                let cols = ((width / x) - 1e-9).ceil().max(1.0) as usize;
                let rows = ((height / y) - 1e-9).ceil().max(1.0) as usize;
                (cols, rows, x, y)
            }
            PixelSpacing::Size { cols, rows } => {
                if cols == 0 || rows == 0 {
                    return Err(FuseError::Config(format!("Invalid grid size {} x {}", cols, rows)));
                }
                (cols, rows, width / cols as f64, height / rows as f64)
            }
        };

        log::debug!(
            "Domain grid {}x{} (rows x cols), pixel {:.4} x {:.4}",
            rows, cols, res_x, res_y
        );

        Ok(Self {
            srs: srs.to_string(),
            transform: GeoTransform::north_up(x_min, y_max, res_x, res_y),
            rows,
            cols,
            extent,
        })
    }

    /// Wrap an existing grid definition
    pub fn from_grid(srs: &str, transform: GeoTransform, rows: usize, cols: usize) -> FuseResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(FuseError::Config(format!("Invalid grid size {} x {}", cols, rows)));
        }
        let corners = transform.corners(rows, cols);
        let lonlat = srs_to_lonlat(srs, &corners)?;
        let extent = BoundingBox::from_points(lonlat)
            .ok_or_else(|| FuseError::Processing("Empty grid corners".to_string()))?;
        Ok(Self {
            srs: srs.to_string(),
            transform,
            rows,
            cols,
            extent,
        })
    }

    pub fn srs(&self) -> &str {
        &self.srs
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    /// (rows, cols); every mosaic and mask of a run has this shape
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Requested lon/lat extent
    pub fn extent(&self) -> &BoundingBox {
        &self.extent
    }

    /// Lon/lat box of the actual pixel grid
    pub fn grid_bounds(&self) -> FuseResult<BoundingBox> {
        let corners = self.transform.corners(self.rows, self.cols);
        let lonlat = srs_to_lonlat(&self.srs, &corners)?;
        BoundingBox::from_points(lonlat)
            .ok_or_else(|| FuseError::Processing("Empty grid corners".to_string()))
    }

    /// Top-left sub-window sharing this domain's origin and spacing
    pub fn subwindow(&self, rows: usize, cols: usize) -> FuseResult<Domain> {
        let rows = rows.min(self.rows);
        let cols = cols.min(self.cols);
        Domain::from_grid(&self.srs, self.transform, rows, cols)
    }
}

/// Fixed region of interest with a hard-coded grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedRegion {
    pub name: String,
    pub srs: String,
    pub extent: BoundingBox,
    /// Regional extent in kilometers
    pub width_km: usize,
    pub height_km: usize,
    pub pixel_size_m: usize,
}

impl FixedRegion {
    /// Sleeping Bear Dunes, Lake Michigan
    pub fn sleeping_bear_dunes() -> Self {
        Self {
            name: "sleeping_bear_dunes".to_string(),
            srs: WGS84_PROJ4.to_string(),
            extent: BoundingBox::new(-86.3, 44.6, -85.2, 45.3),
            width_km: 122,
            height_km: 78,
            pixel_size_m: SENTINEL_SPACING as usize,
        }
    }

    /// (cols, rows) of the grid; pixels per kilometer are truncated to an integer
    pub fn grid_size(&self) -> FuseResult<(usize, usize)> {
        if self.pixel_size_m == 0 || self.pixel_size_m > 1000 {
            return Err(FuseError::Config(format!(
                "Pixel size {} m is outside 1..=1000",
                self.pixel_size_m
            )));
        }
        let per_km = 1000 / self.pixel_size_m;
        Ok((self.width_km * per_km, self.height_km * per_km))
    }
}

/// Domain construction mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DomainMode {
    /// Bounding box of all tile footprints at a given spacing
    Derived { spacing: f64 },
    /// Predefined region of interest
    Fixed(FixedRegion),
}

impl Default for DomainMode {
    fn default() -> Self {
        DomainMode::Fixed(FixedRegion::sleeping_bear_dunes())
    }
}

/// Builds domains in either construction mode
pub struct DomainBuilder;

impl DomainBuilder {
    /// Minimum bounding rectangle over all footprint corners
    pub fn derived(footprints: &[Footprint], srs: &str, spacing: f64) -> FuseResult<Domain> {
        let extent = BoundingBox::from_points(footprints.iter().flat_map(|f| f.corners.iter().copied()))
            .ok_or_else(|| FuseError::Config("Cannot derive a domain from zero footprints".to_string()))?;

        log::info!(
            "Deriving domain from {} footprints: lon [{:.4}, {:.4}], lat [{:.4}, {:.4}]",
            footprints.len(),
            extent.min_lon,
            extent.max_lon,
            extent.min_lat,
            extent.max_lat
        );

        Domain::from_lonlat_extent(srs, extent, PixelSpacing::Resolution { x: spacing, y: spacing })
    }

    pub fn fixed(region: &FixedRegion) -> FuseResult<Domain> {
        let (cols, rows) = region.grid_size()?;
        log::info!("Using fixed domain '{}' ({}x{} pixels)", region.name, cols, rows);
        Domain::from_lonlat_extent(&region.srs, region.extent, PixelSpacing::Size { cols, rows })
    }

    pub fn build(mode: &DomainMode, footprints: &[Footprint], srs: &str) -> FuseResult<Domain> {
        match mode {
            DomainMode::Derived { spacing } => Self::derived(footprints, srs, *spacing),
            DomainMode::Fixed(region) => Self::fixed(region),
        }
    }
}

/// True for longitude/latitude definitions, which need no coordinate transform
pub fn is_geographic(srs: &str) -> bool {
    let s = srs.trim();
    s.contains("+proj=latlong")
        || s.contains("+proj=longlat")
        || s.eq_ignore_ascii_case("EPSG:4326")
        || s.starts_with("GEOGCS[")
        || s.starts_with("GEOGCRS[")
}

/// Convert (lon, lat) points into the map coordinates of `srs`
pub fn lonlat_to_srs(srs: &str, points: &[(f64, f64)]) -> FuseResult<Vec<(f64, f64)>> {
    if is_geographic(srs) {
        return Ok(points.to_vec());
    }
    let source = SpatialRef::from_proj4("+proj=longlat +datum=WGS84 +no_defs")?;
    let target = SpatialRef::from_definition(srs)?;
    transform_points(&source, &target, points)
}

/// Convert map coordinates of `srs` into (lon, lat) points
pub fn srs_to_lonlat(srs: &str, points: &[(f64, f64)]) -> FuseResult<Vec<(f64, f64)>> {
    if is_geographic(srs) {
        return Ok(points.to_vec());
    }
    let source = SpatialRef::from_definition(srs)?;
    let target = SpatialRef::from_proj4("+proj=longlat +datum=WGS84 +no_defs")?;
    transform_points(&source, &target, points)
}

fn transform_points(
    source: &SpatialRef,
    target: &SpatialRef,
    points: &[(f64, f64)],
) -> FuseResult<Vec<(f64, f64)>> {
    let transform = CoordTransform::new(source, target)?;
    let mut xs: Vec<f64> = points.iter().map(|p| p.0).collect();
    let mut ys: Vec<f64> = points.iter().map(|p| p.1).collect();
    let mut zs = vec![0.0; points.len()];
    transform.transform_coords(&mut xs, &mut ys, &mut zs)?;
    Ok(xs.into_iter().zip(ys).collect())
}
