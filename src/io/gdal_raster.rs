//! GDAL-backed raster I/O
//!
//! Every opened file is materialized into a GDAL `MEM` dataset so that bands
//! can be added and grids replaced in place. NetCDF files whose variables
//! appear as subdatasets are flattened into one band per variable, named after
//! the variable. Swath files keep their GCPs, or get GCPs sampled from their
//! geolocation arrays, and are warped with a thin plate spline.

use crate::core::domain::{self, Domain};
use crate::io::raster::{BandId, BandParams, RasterBackend, RasterHandle};
use crate::io::swath::{GeolocationArrays, GroundControlPoint, DEFAULT_GCP_COUNT};
use crate::types::{ensure_shape, Footprint, FuseError, FuseResult, GeoTransform, Raster, ResampleAlg};
use gdal::raster::Buffer;
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::Array2;
use std::ffi::CString;
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};

/// Raster backend using the GDAL library
#[derive(Debug, Clone)]
pub struct GdalBackend {
    watermask_path: Option<PathBuf>,
    gcp_count: usize,
}

impl Default for GdalBackend {
    fn default() -> Self {
        Self {
            watermask_path: None,
            gcp_count: DEFAULT_GCP_COUNT,
        }
    }
}

impl GdalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Land/water category raster used by `RasterHandle::watermask`
    pub fn with_watermask<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.watermask_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Control points per axis sampled from swath geolocation arrays
    pub fn with_gcp_count(mut self, count: usize) -> Self {
        self.gcp_count = count;
        self
    }
}

impl RasterBackend for GdalBackend {
    type Handle = GdalRaster;

    fn open(&self, path: &Path) -> FuseResult<GdalRaster> {
        log::debug!("Opening raster {}", path.display());
        let dataset = materialize(path, self.gcp_count)?;
        Ok(GdalRaster {
            dataset,
            watermask_path: self.watermask_path.clone(),
        })
    }

    fn create(&self, domain: &Domain) -> FuseResult<GdalRaster> {
        let dataset = mem_dataset(domain.shape(), 0, domain.srs(), Some(domain.transform()))?;
        Ok(GdalRaster {
            dataset,
            watermask_path: self.watermask_path.clone(),
        })
    }

    fn write_quicklook(&self, image: &Array2<u8>, path: &Path) -> FuseResult<()> {
        let (height, width) = image.dim();
        let mut dataset = DriverManager::get_driver_by_name("MEM")?
            .create_with_band_type::<u8, _>("", width as isize, height as isize, 1)?;
        let mut band = dataset.rasterband(1)?;
        let buffer = Buffer::new((width, height), image.iter().copied().collect());
        band.write((0, 0), (width, height), &buffer)?;

        let driver_name = match extension(path).as_deref() {
            Some("jpg") | Some("jpeg") => "JPEG",
            _ => "PNG",
        };
        let driver = DriverManager::get_driver_by_name(driver_name)?;
        dataset.create_copy(&driver, path, &[])?;

        log::info!("Quicklook written to {}", path.display());
        Ok(())
    }
}

/// An opened raster held as a GDAL `MEM` dataset
pub struct GdalRaster {
    dataset: Dataset,
    watermask_path: Option<PathBuf>,
}

impl GdalRaster {
    fn domain(&self) -> FuseResult<Domain> {
        let (rows, cols) = self.shape();
        Domain::from_grid(&self.projection(), self.geo_transform()?, rows, cols)
    }

    fn band_index(&self, band: &BandId) -> FuseResult<isize> {
        let count = self.dataset.raster_count();
        match band {
            BandId::Number(n) if *n >= 1 && (*n as isize) <= count => Ok(*n as isize),
            BandId::Number(n) => Err(FuseError::Config(format!(
                "Band #{} out of range (raster has {} bands)",
                n, count
            ))),
            BandId::Name(name) => {
                for index in 1..=count {
                    let band = self.dataset.rasterband(index)?;
                    if band.description().map(|d| &d == name).unwrap_or(false)
                        || band.metadata_item("name", "").as_deref() == Some(name.as_str())
                    {
                        return Ok(index);
                    }
                }
                Err(FuseError::Config(format!("{} not present in raster", band)))
            }
        }
    }
}

impl RasterHandle for GdalRaster {
    fn shape(&self) -> (usize, usize) {
        let (width, height) = self.dataset.raster_size();
        (height, width)
    }

    fn projection(&self) -> String {
        self.dataset.projection()
    }

    fn geo_transform(&self) -> FuseResult<GeoTransform> {
        Ok(GeoTransform::from_gdal(self.dataset.geo_transform()?))
    }

    fn band_count(&self) -> usize {
        self.dataset.raster_count().max(0) as usize
    }

    fn reproject(&mut self, target: &Domain, alg: ResampleAlg) -> FuseResult<()> {
        let count = self.band_count();
        log::debug!(
            "Reprojecting {} bands {:?} -> {:?} ({})",
            count,
            self.shape(),
            target.shape(),
            alg
        );

        let mut warped = mem_dataset(target.shape(), count, target.srs(), Some(target.transform()))?;

        let algorithm = match alg {
            ResampleAlg::NearestNeighbour => gdal_sys::GDALResampleAlg::GRA_NearestNeighbour,
            ResampleAlg::Bilinear => gdal_sys::GDALResampleAlg::GRA_Bilinear,
        };

        if gcp_count(&self.dataset) > 0 {
            warp_with_gcps(&self.dataset, &warped, algorithm, count)?;
        } else {
            let status = unsafe {
                gdal_sys::GDALReprojectImage(
                    self.dataset.c_dataset(),
                    std::ptr::null(),
                    warped.c_dataset(),
                    std::ptr::null(),
                    algorithm,
                    0.0,
                    0.0,
                    None,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                )
            };
            check_status(status, "GDALReprojectImage")?;
        }

        for index in 1..=count as isize {
            let source = self.dataset.rasterband(index)?;
            let mut band = warped.rasterband(index)?;
            copy_band_params(&source, &mut band)?;
        }

        self.dataset = warped;
        Ok(())
    }

    fn band_array(&self, band: &BandId) -> FuseResult<Raster> {
        let index = self.band_index(band)?;
        read_band(&self.dataset, index)
    }

    fn add_band(&mut self, data: Raster, params: BandParams) -> FuseResult<()> {
        let shape = self.shape();
        ensure_shape(&format!("add_band({})", params.name), shape, data.dim())?;

        // MEM datasets are recreated with one more band
        let count = self.band_count();
        let transform = self.geo_transform().ok();
        let mut extended = mem_dataset(shape, count + 1, &self.projection(), transform.as_ref())?;
        copy_gcps(&self.dataset, &mut extended)?;
        for index in 1..=count as isize {
            let source = self.dataset.rasterband(index)?;
            let mut band = extended.rasterband(index)?;
            write_band(&mut band, &read_band(&self.dataset, index)?)?;
            copy_band_params(&source, &mut band)?;
        }

        let mut band = extended.rasterband(count as isize + 1)?;
        write_band(&mut band, &data)?;
        set_band_params(&mut band, &params)?;

        self.dataset = extended;
        Ok(())
    }

    fn export(&self, path: &Path) -> FuseResult<()> {
        let driver_name = match extension(path).as_deref() {
            Some("tif") | Some("tiff") => "GTiff",
            _ => "netCDF",
        };
        log::info!(
            "Exporting {} bands to {} ({})",
            self.band_count(),
            path.display(),
            driver_name
        );
        let driver = DriverManager::get_driver_by_name(driver_name)?;
        self.dataset.create_copy(&driver, path, &[])?;
        Ok(())
    }

    fn corners(&self) -> FuseResult<Footprint> {
        let (rows, cols) = self.shape();
        let corners = self.geo_transform()?.corners(rows, cols);
        Ok(Footprint::new(domain::srs_to_lonlat(&self.projection(), &corners)?))
    }

    fn watermask(&self) -> FuseResult<Array2<u8>> {
        let path = self
            .watermask_path
            .as_ref()
            .ok_or_else(|| FuseError::Config("No land/water mask configured".to_string()))?;
        let mut mask = GdalRaster {
            dataset: materialize(path, DEFAULT_GCP_COUNT)?,
            watermask_path: None,
        };
        mask.reproject(&self.domain()?, ResampleAlg::NearestNeighbour)?;

        let (rows, cols) = mask.shape();
        let band = mask.dataset.rasterband(1)?;
        let buffer = band.read_as::<u8>((0, 0), (cols, rows), (cols, rows), None)?;
        Array2::from_shape_vec((rows, cols), buffer.data)
            .map_err(|e| FuseError::Processing(format!("Failed to reshape water mask: {}", e)))
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Empty float32 `MEM` dataset; swaths have no transform
fn mem_dataset(
    shape: (usize, usize),
    bands: usize,
    srs: &str,
    transform: Option<&GeoTransform>,
) -> FuseResult<Dataset> {
    let (rows, cols) = shape;
    let mut dataset = DriverManager::get_driver_by_name("MEM")?.create_with_band_type::<f32, _>(
        "",
        cols as isize,
        rows as isize,
        bands as isize,
    )?;
    if let Some(transform) = transform {
        dataset.set_geo_transform(&transform.to_gdal())?;
    }
    if !srs.trim().is_empty() {
        dataset.set_spatial_ref(&SpatialRef::from_definition(srs)?)?;
    }
    Ok(dataset)
}

/// Open `path` and copy its bands (or NetCDF variables) into a `MEM` dataset
fn materialize(path: &Path, gcps_per_axis: usize) -> FuseResult<Dataset> {
    let source = Dataset::open(path)?;
    if source.raster_count() > 0 {
        let (width, height) = source.raster_size();
        let count = source.raster_count() as usize;
        let transform = grid_transform(&source);
        let mut dataset = mem_dataset((height, width), count, &source.projection(), transform.as_ref())?;
        for index in 1..=count as isize {
            let band = source.rasterband(index)?;
            let mut target = dataset.rasterband(index)?;
            write_band(&mut target, &read_band(&source, index)?)?;
            copy_band_params(&band, &mut target)?;
        }
        georeference_swath(&source, &mut dataset, gcps_per_axis)?;
        return Ok(dataset);
    }

    let names: Vec<String> = source
        .metadata_domain("SUBDATASETS")
        .unwrap_or_default()
        .into_iter()
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            key.ends_with("_NAME").then(|| value.to_string())
        })
        .collect();

    if names.is_empty() {
        return Err(FuseError::InvalidFormat(format!(
            "{} contains no raster bands",
            path.display()
        )));
    }

    // Variables sharing the grid of the first one become bands
    let mut variables = Vec::new();
    for name in &names {
        let sub = Dataset::open(Path::new(name))?;
        if sub.raster_count() < 1 {
            continue;
        }
        // NETCDF:"file":/group/variable
        let variable = name
            .rsplit(':')
            .next()
            .and_then(|v| v.rsplit('/').next())
            .unwrap_or(name)
            .to_string();
        variables.push((variable, sub));
    }

    let (_, first) = variables
        .first()
        .ok_or_else(|| FuseError::InvalidFormat(format!("{} has no readable variables", path.display())))?;
    let (width, height) = first.raster_size();
    let projection = first.projection();
    let transform = grid_transform(first);

    let variables: Vec<_> = variables
        .into_iter()
        .filter(|(name, sub)| {
            let same = sub.raster_size() == (width, height);
            if !same {
                log::debug!("Skipping variable {} with a different grid", name);
            }
            same
        })
        .collect();

    let mut dataset = mem_dataset((height, width), variables.len(), &projection, transform.as_ref())?;
    for (index, (name, sub)) in variables.iter().enumerate() {
        let mut target = dataset.rasterband(index as isize + 1)?;
        write_band(&mut target, &read_band(sub, 1)?)?;
        target.set_description(name)?;
    }
    if let Some((_, first)) = variables.first() {
        georeference_swath(first, &mut dataset, gcps_per_axis)?;
    }

    log::debug!("Materialized {} variables from {}", variables.len(), path.display());
    Ok(dataset)
}

/// Geotransform of a gridded source; swaths and GCP-only files have none
fn grid_transform(source: &Dataset) -> Option<GeoTransform> {
    if gcp_count(source) > 0 {
        return None;
    }
    source.geo_transform().ok().map(GeoTransform::from_gdal)
}

/// Carry GCPs over to `target`, or sample them from geolocation arrays.
///
/// The geolocation arrays themselves are not carried; the swath is warped
/// through its GCPs only.
fn georeference_swath(source: &Dataset, target: &mut Dataset, per_axis: usize) -> FuseResult<()> {
    if gcp_count(source) > 0 {
        return copy_gcps(source, target);
    }
    let entries = match source.metadata_domain("GEOLOCATION") {
        Some(entries) if !entries.is_empty() => entries,
        _ => return Ok(()),
    };

    let arrays = GeolocationArrays::from_metadata(&entries)?;
    let lon = read_band(&Dataset::open(Path::new(&arrays.x_dataset))?, arrays.x_band as isize)?;
    let lat = read_band(&Dataset::open(Path::new(&arrays.y_dataset))?, arrays.y_band as isize)?;
    let gcps = arrays.sample_gcps(&lon, &lat, per_axis)?;

    let srs = match &arrays.srs {
        Some(srs) => SpatialRef::from_definition(srs)?,
        None => SpatialRef::from_epsg(4326)?,
    };
    log::info!("Georeferencing swath with {} GCPs from its geolocation arrays", gcps.len());
    set_gcps(target, &gcps, &srs.to_wkt()?)
}

fn gcp_count(dataset: &Dataset) -> usize {
    let count = unsafe { gdal_sys::GDALGetGCPCount(dataset.c_dataset()) };
    count.max(0) as usize
}

fn copy_gcps(source: &Dataset, target: &mut Dataset) -> FuseResult<()> {
    let count = gcp_count(source);
    if count == 0 {
        return Ok(());
    }
    let status = unsafe {
        gdal_sys::GDALSetGCPs(
            target.c_dataset(),
            count as c_int,
            gdal_sys::GDALGetGCPs(source.c_dataset()),
            gdal_sys::GDALGetGCPProjection(source.c_dataset()),
        )
    };
    check_status(status, "GDALSetGCPs")
}

fn set_gcps(target: &mut Dataset, gcps: &[GroundControlPoint], srs_wkt: &str) -> FuseResult<()> {
    let ids = (1..=gcps.len())
        .map(|i| c_string(&i.to_string()))
        .collect::<FuseResult<Vec<_>>>()?;
    let info = c_string("")?;
    let wkt = c_string(srs_wkt)?;

    // GDAL copies the list and its strings
    let list: Vec<gdal_sys::GDAL_GCP> = gcps
        .iter()
        .zip(&ids)
        .map(|(gcp, id)| gdal_sys::GDAL_GCP {
            pszId: id.as_ptr() as *mut c_char,
            pszInfo: info.as_ptr() as *mut c_char,
            dfGCPPixel: gcp.pixel,
            dfGCPLine: gcp.line,
            dfGCPX: gcp.x,
            dfGCPY: gcp.y,
            dfGCPZ: 0.0,
        })
        .collect();
    let status = unsafe { gdal_sys::GDALSetGCPs(target.c_dataset(), list.len() as c_int, list.as_ptr(), wkt.as_ptr()) };
    check_status(status, "GDALSetGCPs")
}

/// Warp every band of a GCP-referenced `source` into `target` with a thin
/// plate spline transformer; cells outside the swath become NaN
fn warp_with_gcps(
    source: &Dataset,
    target: &Dataset,
    algorithm: gdal_sys::GDALResampleAlg::Type,
    bands: usize,
) -> FuseResult<()> {
    let method = c_string("METHOD=GCP_TPS")?;
    let init_key = c_string("INIT_DEST")?;
    let init_value = c_string("NO_DATA")?;
    let mut transformer_options = [method.as_ptr() as *mut c_char, std::ptr::null_mut()];
    let (width, height) = target.raster_size();

    unsafe {
        let transformer = gdal_sys::GDALCreateGenImgProjTransformer2(
            source.c_dataset(),
            target.c_dataset(),
            transformer_options.as_mut_ptr() as _,
        );
        if transformer.is_null() {
            return Err(FuseError::Processing(
                "Failed to create the GCP_TPS transformer".to_string(),
            ));
        }

        // Band lists and no-data arrays are released by GDALDestroyWarpOptions
        let options = gdal_sys::GDALCreateWarpOptions();
        (*options).hSrcDS = source.c_dataset();
        (*options).hDstDS = target.c_dataset();
        (*options).eResampleAlg = algorithm;
        (*options).nBandCount = bands as c_int;
        (*options).panSrcBands = band_list(bands);
        (*options).panDstBands = band_list(bands);
        (*options).padfDstNoDataReal = nan_list(bands);
        (*options).papszWarpOptions =
            gdal_sys::CSLSetNameValue((*options).papszWarpOptions, init_key.as_ptr(), init_value.as_ptr());
        (*options).pfnTransformer = Some(gdal_sys::GDALGenImgProjTransform);
        (*options).pTransformerArg = transformer;

        let operation = gdal_sys::GDALCreateWarpOperation(options);
        let status = if operation.is_null() {
            gdal_sys::CPLErr::CE_Failure
        } else {
            let status = gdal_sys::GDALChunkAndWarpImage(operation, 0, 0, width as c_int, height as c_int);
            gdal_sys::GDALDestroyWarpOperation(operation);
            status
        };
        gdal_sys::GDALDestroyWarpOptions(options);
        gdal_sys::GDALDestroyGenImgProjTransformer(transformer);
        check_status(status, "GCP_TPS warp")
    }
}

/// 1-based band numbers in GDAL-owned memory
unsafe fn band_list(bands: usize) -> *mut c_int {
    let list = gdal_sys::CPLMalloc(bands.max(1) * std::mem::size_of::<c_int>()) as *mut c_int;
    for i in 0..bands {
        *list.add(i) = (i + 1) as c_int;
    }
    list
}

unsafe fn nan_list(bands: usize) -> *mut f64 {
    let list = gdal_sys::CPLMalloc(bands.max(1) * std::mem::size_of::<f64>()) as *mut f64;
    for i in 0..bands {
        *list.add(i) = f64::NAN;
    }
    list
}

fn c_string(value: &str) -> FuseResult<CString> {
    CString::new(value).map_err(|e| FuseError::InvalidFormat(format!("Embedded NUL in '{}': {}", value, e)))
}

fn check_status(status: gdal_sys::CPLErr::Type, call: &str) -> FuseResult<()> {
    if status != gdal_sys::CPLErr::CE_None {
        return Err(FuseError::Processing(format!("{} failed with status {}", call, status)));
    }
    Ok(())
}

fn read_band(dataset: &Dataset, index: isize) -> FuseResult<Raster> {
    let (width, height) = dataset.raster_size();
    let band = dataset.rasterband(index)?;
    let buffer = band.read_as::<f32>((0, 0), (width, height), (width, height), None)?;
    Array2::from_shape_vec((height, width), buffer.data)
        .map_err(|e| FuseError::Processing(format!("Failed to reshape band {}: {}", index, e)))
}

fn write_band(band: &mut gdal::raster::RasterBand, data: &Raster) -> FuseResult<()> {
    let (height, width) = data.dim();
    let buffer = Buffer::new((width, height), data.iter().copied().collect());
    band.write((0, 0), (width, height), &buffer)?;
    Ok(())
}

fn set_band_params(band: &mut gdal::raster::RasterBand, params: &BandParams) -> FuseResult<()> {
    band.set_description(&params.name)?;
    band.set_metadata_item("name", &params.name, "")?;
    if let Some(long_name) = &params.long_name {
        band.set_metadata_item("long_name", long_name, "")?;
    }
    if let Some(units) = &params.units {
        band.set_metadata_item("units", units, "")?;
    }
    if let Some(wavelength) = params.wavelength {
        band.set_metadata_item("wavelength", &wavelength.to_string(), "")?;
    }
    Ok(())
}

fn copy_band_params(source: &gdal::raster::RasterBand, target: &mut gdal::raster::RasterBand) -> FuseResult<()> {
    let description = source.description().unwrap_or_default();
    let name = source.metadata_item("name", "").unwrap_or(description);
    if name.is_empty() {
        return Ok(());
    }
    let params = BandParams {
        name,
        long_name: source.metadata_item("long_name", ""),
        units: source.metadata_item("units", ""),
        wavelength: source
            .metadata_item("wavelength", "")
            .and_then(|w| w.trim().parse().ok()),
    };
    set_band_params(target, &params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::WGS84_PROJ4;

    /// 4x4 swath without a geotransform whose GCPs place pixel (p, l) at lon p, lat 4 - l
    fn gcp_swath() -> GdalRaster {
        let mut dataset = mem_dataset((4, 4), 1, "", None).unwrap();
        let values = Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as f32);
        {
            let mut band = dataset.rasterband(1).unwrap();
            write_band(&mut band, &values).unwrap();
            set_band_params(&mut band, &BandParams::named("Rrs_443")).unwrap();
        }

        let gcps: Vec<GroundControlPoint> = [(0.0, 0.0), (4.0, 0.0), (0.0, 4.0), (4.0, 4.0), (2.0, 2.0)]
            .iter()
            .map(|&(pixel, line)| GroundControlPoint {
                pixel,
                line,
                x: pixel,
                y: 4.0 - line,
            })
            .collect();
        let wkt = SpatialRef::from_proj4(WGS84_PROJ4).unwrap().to_wkt().unwrap();
        set_gcps(&mut dataset, &gcps, &wkt).unwrap();

        GdalRaster {
            dataset,
            watermask_path: None,
        }
    }

    #[test]
    fn test_swath_warps_through_gcps() {
        let mut swath = gcp_swath();
        assert_eq!(gcp_count(&swath.dataset), 5);
        swath
            .add_band(Array2::from_elem((4, 4), 7.0), BandParams::named("index"))
            .unwrap();
        assert_eq!(gcp_count(&swath.dataset), 5);

        let domain = Domain::from_grid(WGS84_PROJ4, GeoTransform::north_up(-1.0, 5.0, 1.0, 1.0), 6, 6).unwrap();
        swath.reproject(&domain, ResampleAlg::NearestNeighbour).unwrap();

        let values = swath.band_array(&BandId::from("Rrs_443")).unwrap();
        assert_eq!(values.dim(), (6, 6));
        // Outside the swath
        assert!(values[[0, 0]].is_nan());
        assert!(values[[5, 5]].is_nan());
        assert_eq!(values[[1, 1]], 0.0);
        assert_eq!(values[[2, 3]], 6.0);
        assert_eq!(values[[4, 4]], 15.0);
        assert_eq!(swath.band_array(&BandId::from("index")).unwrap()[[3, 3]], 7.0);
    }

    #[test]
    fn test_gridded_raster_has_no_gcps() {
        let domain = Domain::from_grid(WGS84_PROJ4, GeoTransform::north_up(0.0, 4.0, 1.0, 1.0), 4, 4).unwrap();
        let raster = GdalBackend::new().create(&domain).unwrap();
        assert_eq!(gcp_count(&raster.dataset), 0);
        assert!(grid_transform(&raster.dataset).is_some());
    }
}
