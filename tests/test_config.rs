use colorfuse::config::PipelineConfig;
use colorfuse::core::domain::DomainMode;
use colorfuse::io::granule::GranuleLayout;
use colorfuse::types::{FuseError, ResampleAlg};
use std::fs;
use tempfile::TempDir;

const RUN_YAML: &str = r#"
scene:
  granules: [16TER, 16TFR]
  layout:
    layout: resolution_subdir
    resolution_m: 60
  bands: ["01", "02", "03", "04", "05", "06", "07", "08"]
domain:
  target:
    mode: derived
    spacing: 1000.0
  target_resampling: Bilinear
mosaic:
  max_workers: 3
  quicklook: true
masking:
  depth:
    max_depth: 10.0
  smooth: true
  log_transform: true
fusion:
  iterations: 5
  deadline_secs: 600
bathymetry_path: /data/bathymetry/lake_michigan.nc
output_dir: /tmp/fused
"#;

#[test]
fn test_load_run_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.yaml");
    fs::write(&path, RUN_YAML).unwrap();

    let config = PipelineConfig::from_yaml_file(&path).unwrap();
    assert_eq!(config.scene.granules.len(), 2);
    assert_eq!(config.scene.layout, GranuleLayout::ResolutionSubdir { resolution_m: 60 });
    assert_eq!(config.domain.target, DomainMode::Derived { spacing: 1000.0 });
    assert_eq!(config.domain.target_resampling, ResampleAlg::Bilinear);
    assert_eq!(config.mosaic.max_workers, 3);
    assert_eq!(config.masking.depth.as_ref().map(|d| d.max_depth), Some(10.0));
    assert!(config.masking.smooth);
    assert_eq!(config.fusion.iterations, 5);
    assert_eq!(config.fusion.threads, 7);
    assert_eq!(config.fusion.deadline_secs, Some(600));
    assert!(config.bathymetry_path.is_some());

    let reloaded = PipelineConfig::from_yaml_str(&config.to_yaml().unwrap()).unwrap();
    assert_eq!(reloaded, config);
}

#[test]
fn test_missing_run_file() {
    let dir = TempDir::new().unwrap();
    let err = PipelineConfig::from_yaml_file(dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, FuseError::Io(_) | FuseError::Config(_)));
}

#[test]
fn test_cloud_band_must_exist() {
    let yaml = "scene:\n  bands: [\"01\", \"02\"]\n";
    assert!(matches!(PipelineConfig::from_yaml_str(yaml), Err(FuseError::Config(_))));
}
