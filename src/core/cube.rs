//! Band-ordered raster stacks

use crate::io::raster::{BandId, BandParams, NamedBand, RasterHandle};
use crate::types::{ensure_shape, FuseError, FuseResult, Raster, RasterCube};
use ndarray::{s, Array3, ArrayView2, ArrayViewMut2, Axis};

/// Stack of co-registered bands ordered by wavelength
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralCube {
    data: RasterCube,
    names: Vec<String>,
    wavelengths: Vec<Option<u32>>,
}

impl SpectralCube {
    pub fn new(data: RasterCube, names: Vec<String>, wavelengths: Vec<Option<u32>>) -> FuseResult<Self> {
        let bands = data.len_of(Axis(0));
        if names.len() != bands || wavelengths.len() != bands {
            return Err(FuseError::Processing(format!(
                "Cube has {} bands but {} names and {} wavelengths",
                bands,
                names.len(),
                wavelengths.len()
            )));
        }
        Ok(Self { data, names, wavelengths })
    }

    /// Stack bands that share one shape
    pub fn from_bands(bands: Vec<NamedBand>) -> FuseResult<Self> {
        let shape = bands
            .first()
            .map(|b| b.data.dim())
            .ok_or_else(|| FuseError::Processing("Cannot build a cube from zero bands".to_string()))?;

        let mut data = Array3::zeros((bands.len(), shape.0, shape.1));
        let mut names = Vec::with_capacity(bands.len());
        let mut wavelengths = Vec::with_capacity(bands.len());

        for (i, band) in bands.into_iter().enumerate() {
            ensure_shape(&format!("cube band {}", band.name()), shape, band.data.dim())?;
            data.index_axis_mut(Axis(0), i).assign(&band.data);
            wavelengths.push(band.params.wavelength);
            names.push(band.params.name);
        }

        Ok(Self { data, names, wavelengths })
    }

    /// Read named bands of a raster into a cube
    pub fn from_handle<H: RasterHandle>(handle: &H, names: &[String]) -> FuseResult<Self> {
        let bands = names
            .iter()
            .map(|name| {
                let data = handle.band_array(&BandId::Name(name.clone()))?;
                Ok(NamedBand::new(BandParams::named(name), data))
            })
            .collect::<FuseResult<Vec<_>>>()?;
        Self::from_bands(bands)
    }

    pub fn data(&self) -> &RasterCube {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut RasterCube {
        &mut self.data
    }

    pub fn into_data(self) -> RasterCube {
        self.data
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn wavelengths(&self) -> &[Option<u32>] {
        &self.wavelengths
    }

    pub fn band_count(&self) -> usize {
        self.names.len()
    }

    /// (rows, cols) of every band
    pub fn shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.data.dim();
        (rows, cols)
    }

    pub fn band(&self, index: usize) -> FuseResult<ArrayView2<'_, f32>> {
        if index >= self.band_count() {
            return Err(FuseError::Processing(format!(
                "Band index {} outside a {}-band cube",
                index,
                self.band_count()
            )));
        }
        Ok(self.data.index_axis(Axis(0), index))
    }

    pub fn band_mut(&mut self, index: usize) -> FuseResult<ArrayViewMut2<'_, f32>> {
        if index >= self.band_count() {
            return Err(FuseError::Processing(format!(
                "Band index {} outside a {}-band cube",
                index,
                self.band_count()
            )));
        }
        Ok(self.data.index_axis_mut(Axis(0), index))
    }

    pub fn band_by_name(&self, name: &str) -> Option<ArrayView2<'_, f32>> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.data.index_axis(Axis(0), i))
    }

    /// Keep the first `n` bands
    pub fn truncate(&mut self, n: usize) {
        if n >= self.band_count() {
            return;
        }
        self.data = self.data.slice(s![..n, .., ..]).to_owned();
        self.names.truncate(n);
        self.wavelengths.truncate(n);
    }

    /// Top-left `rows` x `cols` window of every band
    pub fn crop(&mut self, rows: usize, cols: usize) {
        let (r, c) = self.shape();
        let (rows, cols) = (rows.min(r), cols.min(c));
        self.data = self.data.slice(s![.., ..rows, ..cols]).to_owned();
    }

    /// Split back into named bands
    pub fn into_named_bands(self) -> Vec<NamedBand> {
        let SpectralCube { data, names, wavelengths } = self;
        names
            .into_iter()
            .zip(wavelengths)
            .zip(data.outer_iter())
            .map(|((name, wavelength), band)| {
                let mut params = BandParams::named(&name);
                params.wavelength = wavelength;
                NamedBand::new(params, band.to_owned())
            })
            .collect()
    }

    /// Copy of one band
    pub fn band_raster(&self, index: usize) -> FuseResult<Raster> {
        self.band(index).map(|b| b.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn cube(bands: usize) -> SpectralCube {
        let named = (0..bands)
            .map(|b| {
                NamedBand::new(
                    BandParams::named(&format!("Rrs_{}", 400 + b)).with_wavelength(400 + b as u32),
                    Array2::from_shape_fn((4, 3), |(r, c)| (b * 100 + r * 10 + c) as f32),
                )
            })
            .collect();
        SpectralCube::from_bands(named).unwrap()
    }

    #[test]
    fn test_from_bands_checks_shapes() {
        let bands = vec![
            NamedBand::new(BandParams::named("a"), Array2::zeros((2, 2))),
            NamedBand::new(BandParams::named("b"), Array2::zeros((3, 2))),
        ];
        assert!(matches!(SpectralCube::from_bands(bands), Err(FuseError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_truncate_and_crop() {
        let mut cube = cube(4);
        cube.truncate(2);
        assert_eq!(cube.band_count(), 2);
        assert_eq!(cube.names(), &["Rrs_400".to_string(), "Rrs_401".to_string()]);

        cube.crop(2, 10);
        assert_eq!(cube.shape(), (2, 3));
        assert_eq!(cube.band(1).unwrap()[[1, 2]], 112.0);
    }

    #[test]
    fn test_into_named_bands_keeps_order() {
        let bands = cube(3).into_named_bands();
        assert_eq!(bands[2].name(), "Rrs_402");
        assert_eq!(bands[2].params.wavelength, Some(402));
        assert_eq!(bands[2].data[[3, 2]], 232.0);
    }
}
