//! Gaussian smoothing
//!
//! Separable correlation with a sampled Gaussian kernel. Borders use
//! half-sample reflection (`d c b a | a b c d | d c b a`), the kernel radius is
//! `round(truncate * sigma)` and non-finite samples propagate into every output
//! pixel whose window touches them.

use crate::types::RasterCube;
use ndarray::{Array2, Axis, Zip};
use num_traits::Float;

/// Kernel extent in standard deviations
pub const DEFAULT_TRUNCATE: f64 = 4.0;

/// Sigmas at or below this leave the input unchanged
const MIN_SIGMA: f64 = 1e-15;

/// Normalized 1-D Gaussian weights of length `2 * radius + 1`
pub fn gaussian_kernel(sigma: f64, truncate: f64) -> Vec<f64> {
    let radius = (truncate * sigma + 0.5) as usize;
    let denom = 2.0 * sigma * sigma;
    let weights: Vec<f64> = (0..=2 * radius)
        .map(|k| {
            let x = k as f64 - radius as f64;
            (-x * x / denom).exp()
        })
        .collect();
    let sum: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / sum).collect()
}

/// Map an out-of-range index into `0..n` by half-sample reflection
pub fn reflect_index(i: isize, n: isize) -> usize {
    if n <= 1 {
        return 0;
    }
    let period = 2 * n;
    let m = i.rem_euclid(period);
    (if m >= n { period - 1 - m } else { m }) as usize
}

fn correlate_axis<T: Float>(input: &Array2<T>, kernel: &[f64], axis: Axis) -> Array2<T> {
    let radius = (kernel.len() / 2) as isize;
    let mut output = Array2::zeros(input.dim());

    Zip::from(output.lanes_mut(axis))
        .and(input.lanes(axis))
        .for_each(|mut out, lane| {
            let n = lane.len() as isize;
            for i in 0..n {
                let mut acc = 0.0f64;
                for (k, w) in kernel.iter().enumerate() {
                    let j = reflect_index(i + k as isize - radius, n);
                    acc += w * lane[j].to_f64().unwrap_or(f64::NAN);
                }
                out[i as usize] = T::from(acc).unwrap_or_else(T::nan);
            }
        });

    output
}

/// 2-D Gaussian filter with the same sigma on both axes
pub fn gaussian_filter<T: Float>(image: &Array2<T>, sigma: f64) -> Array2<T> {
    gaussian_filter_truncated(image, sigma, DEFAULT_TRUNCATE)
}

pub fn gaussian_filter_truncated<T: Float>(image: &Array2<T>, sigma: f64, truncate: f64) -> Array2<T> {
    if sigma <= MIN_SIGMA {
        return image.clone();
    }
    let kernel = gaussian_kernel(sigma, truncate);
    let rows_done = correlate_axis(image, &kernel, Axis(0));
    correlate_axis(&rows_done, &kernel, Axis(1))
}

/// Smooth every band of a cube spatially; bands are never mixed
#[cfg(feature = "parallel")]
pub fn gaussian_filter_cube(cube: &mut RasterCube, sigma: f64) {
    use ndarray::parallel::prelude::*;

    cube.axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut band| {
            let smoothed = gaussian_filter(&band.to_owned(), sigma);
            band.assign(&smoothed);
        });
}

#[cfg(not(feature = "parallel"))]
pub fn gaussian_filter_cube(cube: &mut RasterCube, sigma: f64) {
    for mut band in cube.axis_iter_mut(Axis(0)) {
        let smoothed = gaussian_filter(&band.to_owned(), sigma);
        band.assign(&smoothed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};

    #[test]
    fn test_kernel_is_normalized_and_symmetric() {
        let kernel = gaussian_kernel(1.0, DEFAULT_TRUNCATE);
        assert_eq!(kernel.len(), 9);
        assert_abs_diff_eq!(kernel.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(kernel[0], kernel[8], epsilon = 1e-15);
        assert!(kernel[4] > kernel[3]);
    }

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect_index(-1, 4), 0);
        assert_eq!(reflect_index(-2, 4), 1);
        assert_eq!(reflect_index(4, 4), 3);
        assert_eq!(reflect_index(5, 4), 2);
        assert_eq!(reflect_index(9, 4), 1);
        assert_eq!(reflect_index(3, 1), 0);
    }

    #[test]
    fn test_constant_image_unchanged() {
        let image = Array2::from_elem((6, 5), 3.5f32);
        let smoothed = gaussian_filter(&image, 1.0);
        for v in smoothed.iter() {
            assert_abs_diff_eq!(*v, 3.5, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_impulse_spreads_symmetrically() {
        let mut image = Array2::<f64>::zeros((9, 9));
        image[[4, 4]] = 1.0;
        let smoothed = gaussian_filter(&image, 1.0);
        assert_abs_diff_eq!(smoothed.sum(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(smoothed[[3, 4]], smoothed[[5, 4]], epsilon = 1e-12);
        assert_abs_diff_eq!(smoothed[[4, 3]], smoothed[[3, 4]], epsilon = 1e-12);
        assert!(smoothed[[4, 4]] > smoothed[[3, 3]]);
    }

    #[test]
    fn test_nan_propagates_within_radius() {
        let mut image = Array2::from_elem((12, 12), 1.0f32);
        image[[0, 0]] = f32::NAN;
        let smoothed = gaussian_filter(&image, 1.0);
        assert!(smoothed[[4, 4]].is_nan());
        assert!(!smoothed[[5, 0]].is_nan());
    }

    #[test]
    fn test_cube_bands_not_mixed() {
        let mut cube = Array3::zeros((2, 5, 5));
        cube.index_axis_mut(Axis(0), 1).fill(7.0f32);
        gaussian_filter_cube(&mut cube, 1.0);
        assert_abs_diff_eq!(cube[[0, 2, 2]], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(cube[[1, 2, 2]], 7.0, epsilon = 1e-5);
    }

    #[test]
    fn test_zero_sigma_is_identity() {
        let image = array![[1.0f32, 2.0], [3.0, 4.0]];
        assert_eq!(gaussian_filter(&image, 0.0), image);
    }
}
