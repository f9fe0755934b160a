//! Bio-optical inversion wrapper
//!
//! Prepares just-below-surface reflectance and a validity mask for an external
//! model, runs it and stores its concentration products as named bands.

use crate::config::InversionConfig;
use crate::io::raster::{BandId, BandParams, NamedBand, RasterHandle};
use crate::types::{ensure_shape, FuseError, FuseResult, Raster};
use ndarray::{Array2, ArrayView2, Zip};

/// Mask value of pixels the model should process
pub const VALID_PIXEL: f32 = 64.0;

/// Mask value of skipped pixels
pub const SKIPPED_PIXEL: f32 = 0.0;

/// Tolerance when matching the invalid-reflectance marker
const MARKER_TOLERANCE: f32 = 1e-6;

/// Inputs of one model run
#[derive(Debug, Clone, Copy)]
pub struct InversionRequest<'a> {
    /// `Rrsw_<wl>` bands, followed by `Rrs_<wl>` bands in shallow-water mode
    pub bands: &'a [NamedBand],
    pub wavelengths: &'a [u32],
    /// `[chl_min, chl_max, tsm_min, tsm_max, doc_min, doc_max, residual]`
    pub limits: [f32; 7],
    pub mask: ArrayView2<'a, f32>,
    pub depth: Option<ArrayView2<'a, f32>>,
    /// Viewing zenith angle per pixel (degrees)
    pub theta: ArrayView2<'a, f32>,
    pub threads: usize,
}

/// Products of one model run
#[derive(Debug, Clone)]
pub struct InversionOutput {
    pub chl: Raster,
    pub tsm: Raster,
    pub doc: Raster,
    pub mse: Raster,
    pub mask: Raster,
}

/// External bio-optical model
pub trait BioOpticalModel: Send + Sync {
    fn process(&self, request: &InversionRequest<'_>) -> FuseResult<InversionOutput>;
}

/// Remote-sensing reflectance just below the surface
pub fn below_surface(rrs: &Raster) -> Raster {
    rrs.mapv(|r| r / (0.52 + 1.7 * r))
}

/// 64 where the model should run, 0 at the invalid-reflectance marker and over land
pub fn input_mask(reference: &Raster, depth: Option<&Raster>, invalid_reflectance: f32) -> FuseResult<Raster> {
    let mut mask = reference.mapv(|v| {
        if (v - invalid_reflectance).abs() <= MARKER_TOLERANCE {
            SKIPPED_PIXEL
        } else {
            VALID_PIXEL
        }
    });
    if let Some(depth) = depth {
        ensure_shape("inversion mask", reference.dim(), depth.dim())?;
        Zip::from(&mut mask).and(depth).for_each(|m, &d| {
            if d.is_nan() {
                *m = SKIPPED_PIXEL;
            }
        });
    }
    Ok(mask)
}

/// Runs a [`BioOpticalModel`] on a reflectance scene
pub struct InversionStage<'a, M: BioOpticalModel + ?Sized> {
    model: &'a M,
    config: &'a InversionConfig,
}

impl<'a, M: BioOpticalModel + ?Sized> InversionStage<'a, M> {
    pub fn new(model: &'a M, config: &'a InversionConfig) -> Self {
        Self { model, config }
    }

    /// Invert `scene`, returning the model inputs followed by its products
    pub fn run<H: RasterHandle>(&self, scene: &H, scene_name: &str, depth: Option<&Raster>) -> FuseResult<Vec<NamedBand>> {
        let wavelengths = self.config.band_set.wavelengths();
        let names = self.config.band_set.band_names();
        let shape = scene.shape();
        log::info!("Inverting {} over {} bands", scene_name, wavelengths.len());

        let mut bands = Vec::new();
        let mut reference = None;
        for (&wavelength, name) in wavelengths.iter().zip(&names) {
            let rrs = scene.band_array(&BandId::Name(name.clone()))?;
            ensure_shape(&format!("inversion input {}", name), shape, rrs.dim())?;

            bands.push(NamedBand::new(
                BandParams::named(&format!("Rrsw_{}", wavelength))
                    .with_units("sr-1")
                    .with_wavelength(wavelength),
                below_surface(&rrs),
            ));
            if reference.is_none() {
                reference = Some(rrs.clone());
            }
            if self.config.shallow_water {
                bands.push(NamedBand::new(
                    BandParams::named(name).with_units("sr-1").with_wavelength(wavelength),
                    rrs,
                ));
            }
        }
        let reference = reference
            .ok_or_else(|| FuseError::Config("Inversion band set is empty".to_string()))?;

        let mask = input_mask(&reference, depth, self.config.invalid_reflectance)?;
        let theta = Array2::zeros(shape);
        let model_depth = if self.config.shallow_water { depth } else { None };

        let request = InversionRequest {
            bands: &bands,
            wavelengths,
            limits: self.config.limits.to_array(),
            mask: mask.view(),
            depth: model_depth.map(|d| d.view()),
            theta: theta.view(),
            threads: self.config.threads,
        };
        let output = self.model.process(&request).map_err(|e| FuseError::Collaborator {
            stage: "inversion".to_string(),
            band: scene_name.to_string(),
            message: e.to_string(),
        })?;

        let valid = mask.iter().filter(|&&m| m == VALID_PIXEL).count();
        log::info!("Inversion finished, {} pixels processed", valid);

        let mut products = vec![NamedBand::new(BandParams::named("input_mask"), mask)];
        for (name, long_name, units, data) in [
            ("chl", "Chlorophyl-a", "mg m-3", output.chl),
            ("tsm", "Total suspended matter", "g m-3", output.tsm),
            ("doc", "Dissolved organic carbon", "gC m-3", output.doc),
            ("mse", "Root Mean Square Error", "sr-1", output.mse),
            ("mask", "L2 inversion mask", "1", output.mask),
        ] {
            ensure_shape(&format!("inversion output {}", name), shape, data.dim())?;
            products.push(NamedBand::new(
                BandParams::named(name).with_long_name(long_name).with_units(units),
                data,
            ));
        }

        bands.extend(products);
        Ok(bands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bands::ModisBandSet;
    use crate::core::domain::{Domain, WGS84_PROJ4};
    use crate::io::memory::MemoryRaster;
    use crate::types::GeoTransform;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    struct ConstantModel;

    impl BioOpticalModel for ConstantModel {
        fn process(&self, request: &InversionRequest<'_>) -> FuseResult<InversionOutput> {
            assert_eq!(request.limits[6], 10.0);
            let shape = request.mask.dim();
            Ok(InversionOutput {
                chl: Array2::from_elem(shape, 1.0),
                tsm: Array2::from_elem(shape, 2.0),
                doc: Array2::from_elem(shape, 3.0),
                mse: Array2::zeros(shape),
                mask: request.mask.to_owned(),
            })
        }
    }

    struct FailingModel;

    impl BioOpticalModel for FailingModel {
        fn process(&self, _request: &InversionRequest<'_>) -> FuseResult<InversionOutput> {
            Err(FuseError::Processing("did not converge".to_string()))
        }
    }

    fn scene(config: &InversionConfig) -> MemoryRaster {
        let domain = Domain::from_grid(WGS84_PROJ4, GeoTransform::north_up(0.0, 2.0, 1.0, 1.0), 2, 2).unwrap();
        let mut raster = MemoryRaster::on_domain(&domain);
        for name in config.band_set.band_names() {
            raster
                .add_band(array![[0.01f32, -0.015534], [0.02, 0.01]], BandParams::named(&name))
                .unwrap();
        }
        raster
    }

    #[test]
    fn test_below_surface_reflectance() {
        let rrsw = below_surface(&array![[0.0f32, 0.01]]);
        assert_eq!(rrsw[[0, 0]], 0.0);
        assert_abs_diff_eq!(rrsw[[0, 1]], 0.01 / 0.537, epsilon = 1e-7);
    }

    #[test]
    fn test_input_mask_marker_and_land() {
        let reference = array![[0.01f32, -0.015534], [0.02, 0.01]];
        let depth = array![[5.0f32, 5.0], [f32::NAN, 5.0]];
        let mask = input_mask(&reference, Some(&depth), -0.015534).unwrap();
        assert_eq!(mask, array![[64.0f32, 0.0], [0.0, 64.0]]);
    }

    #[test]
    fn test_run_names_products() {
        let config = InversionConfig {
            band_set: ModisBandSet::OneKmNoBlue,
            shallow_water: false,
            ..InversionConfig::default()
        };
        let bands = InversionStage::new(&ConstantModel, &config)
            .run(&scene(&config), "A2016154184500", None)
            .unwrap();

        let names: Vec<&str> = bands.iter().map(|b| b.name()).collect();
        assert_eq!(&names[..5], &["Rrsw_443", "Rrsw_488", "Rrsw_531", "Rrsw_645", "Rrsw_678"]);
        assert_eq!(&names[5..], &["input_mask", "chl", "tsm", "doc", "mse", "mask"]);
        assert_eq!(bands[6].params.units.as_deref(), Some("mg m-3"));
        assert_eq!(bands[10].data[[0, 1]], SKIPPED_PIXEL);
    }

    #[test]
    fn test_model_failure_names_scene() {
        let config = InversionConfig::default();
        let err = InversionStage::new(&FailingModel, &config)
            .run(&scene(&config), "A2016154184500", None)
            .unwrap_err();
        match err {
            FuseError::Collaborator { stage, band, .. } => {
                assert_eq!(stage, "inversion");
                assert_eq!(band, "A2016154184500");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
