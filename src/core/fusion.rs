//! Data fusion of the high-resolution cube with low-resolution bands
//!
//! The fusion primitive itself sits behind [`Fuser`]. [`FusionStage`] feeds it
//! one low-resolution band at a time together with the processed cube and the
//! index map, and collects the low-resolution inputs and fused outputs as two
//! band sets on the same grid.

use crate::config::FusionConfig;
use crate::core::cube::SpectralCube;
use crate::core::domain::Domain;
use crate::core::masking::crop_grid;
use crate::core::pipeline::RunContext;
use crate::core::reference::{IndexMap, LowResReference};
use crate::io::raster::{BandParams, NamedBand, RasterBackend, RasterHandle};
use crate::types::{ensure_shape, FuseError, FuseResult, Raster};
use ndarray::{Array2, ArrayView2, ArrayView3, Axis, Zip};
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

/// One call of the fusion primitive
#[derive(Debug, Clone, Copy)]
pub struct FuseRequest<'a> {
    /// Processed high-resolution cube (band, row, col)
    pub hires: ArrayView3<'a, f32>,
    /// Low-resolution band on the same grid, NaN where invalid
    pub lores: ArrayView2<'a, f32>,
    /// Native low-resolution pixel of each grid cell, -1 where unknown
    pub index: ArrayView2<'a, i32>,
    pub network_name: &'a str,
    pub iterations: usize,
    pub threads: usize,
    pub deadline: Option<Instant>,
}

impl FuseRequest<'_> {
    pub fn shape(&self) -> (usize, usize) {
        self.lores.dim()
    }

    pub fn check_deadline(&self) -> FuseResult<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(FuseError::DeadlineExceeded(format!("fusion of {}", self.network_name)))
            }
            _ => Ok(()),
        }
    }
}

/// Point-wise fusion primitive: returns one fused band shaped like `request.lores`
pub trait Fuser: Send + Sync {
    fn fuse(&self, request: &FuseRequest<'_>) -> FuseResult<Raster>;
}

impl<F: Fn(&FuseRequest<'_>) -> FuseResult<Raster> + Send + Sync> Fuser for F {
    fn fuse(&self, request: &FuseRequest<'_>) -> FuseResult<Raster> {
        self(request)
    }
}

/// Low-resolution inputs and fused outputs, band for band
#[derive(Debug, Clone, Default)]
pub struct FusionResult {
    pub lores: Vec<NamedBand>,
    pub fused: Vec<NamedBand>,
}

impl FusionResult {
    pub fn band_names(&self) -> Vec<&str> {
        self.fused.iter().map(|b| b.name()).collect()
    }

    /// Export both band sets on the (possibly cropped) grid
    pub fn export<B: RasterBackend>(&self, backend: &B, domain: &Domain, lores_path: &Path, fused_path: &Path) -> FuseResult<()> {
        let shape = self
            .fused
            .first()
            .map(|b| b.data.dim())
            .unwrap_or_else(|| domain.shape());
        let grid = domain.subwindow(shape.0, shape.1)?;
        backend.export_bands(&grid, &self.lores, lores_path)?;
        backend.export_bands(&grid, &self.fused, fused_path)
    }
}

/// Runs the fusion primitive over a set of low-resolution bands
pub struct FusionStage<'a, F: Fuser + ?Sized> {
    fuser: &'a F,
    config: &'a FusionConfig,
}

impl<'a, F: Fuser + ?Sized> FusionStage<'a, F> {
    pub fn new(fuser: &'a F, config: &'a FusionConfig) -> Self {
        Self { fuser, config }
    }

    /// Fuse every band of `band_names` from `reference` into the cube grid.
    ///
    /// Reference bands are cropped to the cube and nulled at the reference's
    /// negative pixels before fusion.
    pub fn run<H: RasterHandle>(
        &self,
        cube: &SpectralCube,
        reference: &LowResReference<H>,
        band_names: &[String],
        ctx: &RunContext,
    ) -> FuseResult<FusionResult> {
        let (rows, cols) = cube.shape();
        let index = reference.index();
        ensure_shape("fusion index", (rows, cols), index.dim())?;
        if let Some(negative) = reference.negative_pixels() {
            ensure_shape("fusion negative-pixel mask", (rows, cols), negative.dim())?;
        }

        let ctx = match self.config.deadline_secs {
            Some(secs) => ctx.child_with_timeout(std::time::Duration::from_secs(secs)),
            None => ctx.clone(),
        };

        let mut result = FusionResult::default();
        for name in band_names {
            ctx.checkpoint("fusion")?;

            let mut lores = crop_grid(&reference.band(name)?, rows, cols);
            ensure_shape(&format!("fusion of {}", name), (rows, cols), lores.dim())?;
            if let Some(negative) = reference.negative_pixels() {
                Zip::from(&mut lores).and(negative).for_each(|v, &neg| {
                    if neg {
                        *v = f32::NAN;
                    }
                });
            }

            let fused = self.fuse_band(cube, &lores, index, name, &ctx)?;

            let params = band_params(name);
            result.lores.push(NamedBand::new(params.clone(), lores));
            result.fused.push(NamedBand::new(params, fused));
        }

        ctx.checkpoint("fusion")?;
        log::info!("Fused {} bands", result.fused.len());
        Ok(result)
    }

    /// One call of the primitive with error attribution
    pub fn fuse_band(
        &self,
        cube: &SpectralCube,
        lores: &Raster,
        index: &IndexMap,
        name: &str,
        ctx: &RunContext,
    ) -> FuseResult<Raster> {
        let request = FuseRequest {
            hires: cube.data().view(),
            lores: lores.view(),
            index: index.view(),
            network_name: name,
            iterations: self.config.iterations,
            threads: self.config.threads,
            deadline: ctx.deadline(),
        };

        log::info!(
            "Fusing {} ({} hi-res bands, {} iterations, {} threads)",
            name,
            cube.band_count(),
            request.iterations,
            request.threads
        );
        let started = Instant::now();

        let fused = self.fuser.fuse(&request).map_err(|e| match e {
            FuseError::Cancelled(_) | FuseError::DeadlineExceeded(_) => e,
            other => FuseError::Collaborator {
                stage: "fusion".to_string(),
                band: name.to_string(),
                message: other.to_string(),
            },
        })?;
        ensure_shape(&format!("fused {}", name), lores.dim(), fused.dim())?;

        log::debug!("Fused {} in {:.1?}", name, started.elapsed());
        Ok(fused)
    }
}

fn band_params(name: &str) -> BandParams {
    let mut params = BandParams::named(name);
    params.wavelength = name.strip_prefix("Rrs_").and_then(|w| w.parse().ok());
    params
}

/// Closed-form fusion by ridge regression.
///
/// High-resolution bands are averaged over each native low-resolution pixel,
/// a linear model from those averages to the low-resolution value is fitted,
/// and the model is applied to every high-resolution pixel. `iterations` and
/// `threads` are hints for learned primitives and are not used here.
#[derive(Debug, Clone, Copy)]
pub struct RegressionFuser {
    pub ridge: f64,
}

impl Default for RegressionFuser {
    fn default() -> Self {
        Self { ridge: 1e-6 }
    }
}

impl Fuser for RegressionFuser {
    fn fuse(&self, request: &FuseRequest<'_>) -> FuseResult<Raster> {
        request.check_deadline()?;
        let bands = request.hires.len_of(Axis(0));
        let shape = request.shape();
        ensure_shape("regression hires", shape, (request.hires.dim().1, request.hires.dim().2))?;

        // Per native pixel: feature sums, target sum, count
        let mut cells: HashMap<i32, (Vec<f64>, f64, usize)> = HashMap::new();
        for ((row, col), &cell) in request.index.indexed_iter() {
            let target = request.lores[[row, col]];
            if cell < 0 || !target.is_finite() {
                continue;
            }
            let pixel = request.hires.slice(ndarray::s![.., row, col]);
            if pixel.iter().any(|v| !v.is_finite()) {
                continue;
            }
            let entry = cells.entry(cell).or_insert_with(|| (vec![0.0; bands], 0.0, 0));
            for (sum, &v) in entry.0.iter_mut().zip(pixel.iter()) {
                *sum += v as f64;
            }
            entry.1 += target as f64;
            entry.2 += 1;
        }

        if cells.len() < 2 {
            return Err(FuseError::Processing(format!(
                "Only {} valid low-resolution pixels to fit",
                cells.len()
            )));
        }
        request.check_deadline()?;

        let samples: Vec<(Vec<f64>, f64)> = cells
            .into_values()
            .map(|(sums, target, n)| (sums.into_iter().map(|s| s / n as f64).collect(), target / n as f64))
            .collect();
        let model = LinearModel::fit(&samples, bands, self.ridge)?;

        let mut fused = Array2::from_elem(shape, f32::NAN);
        Zip::indexed(&mut fused).for_each(|(row, col), out| {
            let pixel = request.hires.slice(ndarray::s![.., row, col]);
            if pixel.iter().all(|v| v.is_finite()) {
                *out = model.predict(pixel.iter().map(|&v| v as f64)) as f32;
            }
        });
        Ok(fused)
    }
}

/// Ridge regression on standardized features
#[derive(Debug, Clone)]
struct LinearModel {
    intercept: f64,
    means: Vec<f64>,
    scales: Vec<f64>,
    coefficients: Vec<f64>,
}

impl LinearModel {
    fn fit(samples: &[(Vec<f64>, f64)], features: usize, ridge: f64) -> FuseResult<Self> {
        let n = samples.len() as f64;
        let mut means = vec![0.0; features];
        for (x, _) in samples {
            for (m, v) in means.iter_mut().zip(x) {
                *m += v / n;
            }
        }
        let mut scales = vec![0.0; features];
        for (x, _) in samples {
            for ((s, v), m) in scales.iter_mut().zip(x).zip(&means) {
                *s += (v - m) * (v - m) / n;
            }
        }
        for s in scales.iter_mut() {
            *s = if *s > 0.0 { s.sqrt() } else { 1.0 };
        }
        let intercept = samples.iter().map(|(_, y)| y).sum::<f64>() / n;

        let mut gram = vec![vec![0.0; features]; features];
        let mut rhs = vec![0.0; features];
        for (x, y) in samples {
            let z: Vec<f64> = x.iter().zip(&means).zip(&scales).map(|((v, m), s)| (v - m) / s).collect();
            for i in 0..features {
                rhs[i] += z[i] * (y - intercept);
                for j in 0..features {
                    gram[i][j] += z[i] * z[j];
                }
            }
        }
        for (i, row) in gram.iter_mut().enumerate() {
            row[i] += ridge * n;
        }

        let coefficients = solve(gram, rhs)
            .ok_or_else(|| FuseError::Processing("Singular regression system".to_string()))?;

        Ok(Self {
            intercept,
            means,
            scales,
            coefficients,
        })
    }

    fn predict<I: Iterator<Item = f64>>(&self, x: I) -> f64 {
        self.intercept
            + x.zip(&self.means)
                .zip(&self.scales)
                .zip(&self.coefficients)
                .map(|(((v, m), s), b)| b * (v - m) / s)
                .sum::<f64>()
    }
}

/// Gaussian elimination with partial pivoting
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}
