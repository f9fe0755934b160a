//! Python bindings

use crate::config::PipelineConfig;
use crate::core::filters;
use crate::core::mosaic;
use crate::core::{FusionPipeline, RegressionFuser, RunContext};
use crate::io::scene::SceneInfo;
use crate::io::GdalBackend;
use crate::types::FuseError;
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::path::Path;

impl From<FuseError> for PyErr {
    fn from(err: FuseError) -> PyErr {
        match err {
            FuseError::Config(_) | FuseError::ShapeMismatch { .. } => PyValueError::new_err(err.to_string()),
            _ => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyPipelineConfig>()?;
    m.add_function(wrap_pyfunction!(run_fusion, m)?)?;
    m.add_function(wrap_pyfunction!(scene_time, m)?)?;
    m.add_function(wrap_pyfunction!(gaussian_filter, m)?)?;
    m.add_function(wrap_pyfunction!(composite, m)?)?;
    Ok(())
}

/// Python wrapper for PipelineConfig
#[pyclass(name = "PipelineConfig")]
#[derive(Clone, Default)]
struct PyPipelineConfig {
    inner: PipelineConfig,
}

#[pymethods]
impl PyPipelineConfig {
    #[new]
    fn new() -> Self {
        Self::default()
    }

    #[staticmethod]
    fn from_yaml(yaml: &str) -> PyResult<Self> {
        Ok(Self {
            inner: PipelineConfig::from_yaml_str(yaml)?,
        })
    }

    #[staticmethod]
    fn from_file(path: &str) -> PyResult<Self> {
        Ok(Self {
            inner: PipelineConfig::from_yaml_file(path)?,
        })
    }

    fn to_yaml(&self) -> PyResult<String> {
        Ok(self.inner.to_yaml()?)
    }

    #[getter]
    fn output_dir(&self) -> String {
        self.inner.output_dir.display().to_string()
    }

    #[setter]
    fn set_output_dir(&mut self, dir: &str) {
        self.inner.output_dir = dir.into();
    }

    fn __repr__(&self) -> String {
        format!(
            "PipelineConfig(granules={:?}, bands={:?}, output_dir='{}')",
            self.inner.scene.granules,
            self.inner.scene.bands,
            self.inner.output_dir.display()
        )
    }
}

/// Run the full pipeline with the GDAL backend and the regression fuser;
/// returns the fused band names. Water masking needs `watermask_path`.
#[pyfunction]
#[pyo3(signature = (scene, lores, config=None))]
fn run_fusion(py: Python<'_>, scene: &str, lores: &str, config: Option<PyPipelineConfig>) -> PyResult<Vec<String>> {
    let config = config.unwrap_or_default().inner;
    let result = py.allow_threads(|| {
        let mut backend = GdalBackend::new();
        if let Some(path) = &config.watermask_path {
            backend = backend.with_watermask(path);
        }
        let fuser = RegressionFuser::default();
        let pipeline = FusionPipeline::new(&backend, &fuser, config)?;
        let output = pipeline.run(Path::new(scene), Path::new(lores), &RunContext::new())?;
        Ok::<_, FuseError>(output.fusion.band_names().into_iter().map(String::from).collect())
    });
    Ok(result?)
}

/// Sensing time of a product name in RFC 3339
#[pyfunction]
fn scene_time(path: &str) -> PyResult<String> {
    Ok(SceneInfo::parse(Path::new(path))?.sensing_time.to_rfc3339())
}

#[pyfunction]
fn gaussian_filter<'py>(py: Python<'py>, image: PyReadonlyArray2<'py, f32>, sigma: f64) -> &'py PyArray2<f32> {
    filters::gaussian_filter(&image.as_array().to_owned(), sigma).into_pyarray(py)
}

/// Paint `tile` over `mosaic` where the tile is positive; returns the new mosaic
#[pyfunction]
fn composite<'py>(
    py: Python<'py>,
    mosaic: PyReadonlyArray2<'py, f32>,
    tile: PyReadonlyArray2<'py, f32>,
) -> PyResult<&'py PyArray2<f32>> {
    let mut out = mosaic.as_array().to_owned();
    mosaic::composite(&mut out, &tile.as_array().to_owned())?;
    Ok(out.into_pyarray(py))
}
