//! 8-bit quicklooks of mosaicked bands

use crate::io::raster::{RasterBackend, WATERMASK_AMBIGUOUS};
use crate::types::{ensure_shape, FuseResult, Raster};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Linear display stretch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuicklookScale {
    pub vmin: f32,
    pub vmax: f32,
}

impl Default for QuicklookScale {
    /// Top-of-atmosphere digital numbers of B01 over the lake
    fn default() -> Self {
        Self {
            vmin: 1050.0,
            vmax: 1400.0,
        }
    }
}

impl QuicklookScale {
    pub fn to_u8(&self, value: f32) -> u8 {
        if !value.is_finite() || self.vmax <= self.vmin {
            return 0;
        }
        let t = ((value - self.vmin) / (self.vmax - self.vmin)).clamp(0.0, 1.0);
        (t * 255.0).round() as u8
    }
}

/// Stretch `band` to 8 bits, blanking ambiguous water-mask pixels when a mask is given
pub fn render(band: &Raster, watermask: Option<&Array2<u8>>, scale: &QuicklookScale) -> FuseResult<Array2<u8>> {
    let mut image = band.mapv(|v| scale.to_u8(v));
    if let Some(mask) = watermask {
        ensure_shape("quicklook", band.dim(), mask.dim())?;
        Zip::from(&mut image).and(mask).for_each(|pixel, &category| {
            if category == WATERMASK_AMBIGUOUS {
                *pixel = 0;
            }
        });
    }
    Ok(image)
}

/// `<scene name>_ql.png` in `dir`
pub fn quicklook_path(dir: &Path, scene: &Path) -> PathBuf {
    let name = scene
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "scene".to_string());
    dir.join(format!("{}_ql.png", name))
}

/// Render and write a quicklook through `backend`
pub fn write_quicklook<B: RasterBackend>(
    backend: &B,
    band: &Raster,
    watermask: Option<&Array2<u8>>,
    scale: &QuicklookScale,
    path: &Path,
) -> FuseResult<()> {
    let image = render(band, watermask, scale)?;
    backend.write_quicklook(&image, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::raster::{WATERMASK_LAND, WATERMASK_WATER};
    use ndarray::array;

    #[test]
    fn test_stretch_clamps_and_handles_nan() {
        let scale = QuicklookScale::default();
        assert_eq!(scale.to_u8(1000.0), 0);
        assert_eq!(scale.to_u8(1400.0), 255);
        assert_eq!(scale.to_u8(2000.0), 255);
        assert_eq!(scale.to_u8(f32::NAN), 0);
        assert_eq!(scale.to_u8(1225.0), 128);
    }

    #[test]
    fn test_ambiguous_pixels_blanked() {
        let band = array![[1400.0f32, 1400.0], [1400.0, 1400.0]];
        let mask = array![[WATERMASK_WATER, WATERMASK_AMBIGUOUS], [WATERMASK_LAND, WATERMASK_WATER]];
        let image = render(&band, Some(&mask), &QuicklookScale::default()).unwrap();
        assert_eq!(image, array![[255u8, 0], [255, 255]]);
    }

    #[test]
    fn test_quicklook_path() {
        let path = quicklook_path(Path::new("/out"), Path::new("/data/S2A_MSIL1C_X.SAFE"));
        assert_eq!(path, PathBuf::from("/out/S2A_MSIL1C_X.SAFE_ql.png"));
    }
}
