use colorfuse::config::MaskingConfig;
use colorfuse::core::cube::SpectralCube;
use colorfuse::core::domain::{Domain, WGS84_PROJ4};
use colorfuse::core::masking::{crop_grid, log_transform, CubeMasker, MaskInputs};
use colorfuse::io::bathymetry::DepthRange;
use colorfuse::io::raster::{BandParams, NamedBand, WATERMASK_AMBIGUOUS, WATERMASK_WATER};
use colorfuse::types::GeoTransform;
use colorfuse::RunContext;
use ndarray::Array2;

fn sample_cube(bands: usize, rows: usize, cols: usize) -> SpectralCube {
    let bands = (0..bands)
        .map(|b| {
            let data = Array2::from_shape_fn((rows, cols), |(r, c)| 100.0 * b as f32 + (r * cols + c) as f32 + 1.0);
            NamedBand::new(BandParams::named(&format!("Rrs_{}", 443 + b)), data)
        })
        .collect();
    SpectralCube::from_bands(bands).unwrap()
}

fn masking_all_on() -> MaskingConfig {
    MaskingConfig {
        cloud_band: 1,
        cloud_max: 130.0,
        depth: Some(DepthRange::new(10.0, None).unwrap()),
        keep_bands: None,
        crop: None,
        ..MaskingConfig::default()
    }
}

fn nan_count(cube: &SpectralCube) -> usize {
    cube.data().iter().filter(|v| v.is_nan()).count()
}

#[test]
fn test_masking_only_adds_nans() {
    let mut cube = sample_cube(3, 6, 6);
    cube.band_mut(0).unwrap()[[5, 5]] = 0.0;
    let before = cube.clone();

    let mut categories = Array2::from_elem((6, 6), WATERMASK_WATER);
    categories[[0, 0]] = WATERMASK_AMBIGUOUS;
    let mut depth = Array2::from_elem((6, 6), 5.0f32);
    depth[[3, 5]] = 25.0;
    depth[[4, 5]] = f32::NAN;

    let inputs = MaskInputs {
        watermask: Some(&categories),
        depth: Some(&depth),
        ..MaskInputs::default()
    };
    CubeMasker::new(&masking_all_on())
        .run(&mut cube, inputs, &RunContext::new())
        .unwrap();

    for (after, before) in cube.data().iter().zip(before.data().iter()) {
        assert!(after.is_nan() || after == before);
        if before.is_nan() {
            assert!(after.is_nan());
        }
    }
    let data = cube.data();
    // out of swath, coastal, cloudy (band 1 above 130 on the last row), too deep, land
    assert!(data[[0, 5, 5]].is_nan());
    assert!(data[[2, 0, 0]].is_nan());
    assert!(data[[2, 2, 2]].is_nan());
    assert!(data[[0, 5, 0]].is_nan());
    assert!(data[[1, 3, 5]].is_nan());
    assert!(data[[1, 4, 5]].is_nan());
    assert_eq!(data[[0, 2, 5]], 18.0);
}

#[test]
fn test_masking_twice_changes_nothing() {
    let config = MaskingConfig {
        keep_bands: None,
        crop: None,
        ..masking_all_on()
    };
    let mut categories = Array2::from_elem((5, 5), WATERMASK_WATER);
    categories[[4, 4]] = WATERMASK_AMBIGUOUS;
    let depth = Array2::from_elem((5, 5), 5.0f32);
    let inputs = MaskInputs {
        watermask: Some(&categories),
        depth: Some(&depth),
        ..MaskInputs::default()
    };

    let mut cube = sample_cube(2, 5, 5);
    CubeMasker::new(&config).run(&mut cube, inputs, &RunContext::new()).unwrap();
    let once = nan_count(&cube);
    let snapshot = cube.clone();
    CubeMasker::new(&config).run(&mut cube, inputs, &RunContext::new()).unwrap();

    assert_eq!(nan_count(&cube), once);
    for (a, b) in cube.data().iter().zip(snapshot.data().iter()) {
        assert!((a.is_nan() && b.is_nan()) || a == b);
    }
}

#[test]
fn test_log_transform_inverts() {
    let mut cube = sample_cube(2, 3, 3);
    let original = cube.clone();
    log_transform(&mut cube);
    for (logged, raw) in cube.data().iter().zip(original.data().iter()) {
        let back = 10f32.powf(*logged) - 1.0;
        assert!((back - raw).abs() <= 1e-3 * raw.abs().max(1.0));
    }
}

#[test]
fn test_crop_matches_domain_subwindow() {
    let config = MaskingConfig {
        remove_out_of_swath: false,
        mask: false,
        keep_bands: Some(2),
        crop: Some(3),
        ..MaskingConfig::default()
    };
    let mut cube = sample_cube(4, 5, 4);
    let original = cube.clone();
    let outcome = CubeMasker::new(&config)
        .run(&mut cube, MaskInputs::default(), &RunContext::new())
        .unwrap();

    assert_eq!(outcome.crop, Some((3, 3)));
    assert_eq!(cube.band_count(), 2);
    assert_eq!(cube.band(1).unwrap(), crop_grid(&original.band(1).unwrap().to_owned(), 3, 3));

    let domain = Domain::from_grid(WGS84_PROJ4, GeoTransform::north_up(10.0, 50.0, 0.5, 0.5), 5, 4).unwrap();
    let window = domain.subwindow(3, 3).unwrap();
    assert_eq!(window.shape(), cube.shape());
    assert_eq!(window.transform(), domain.transform());
}
