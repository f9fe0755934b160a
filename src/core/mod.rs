//! Core ocean-color processing modules

pub mod cube;
pub mod domain;
pub mod filters;
pub mod fusion;
pub mod inversion;
pub mod masking;
pub mod mosaic;
pub mod pipeline;
pub mod reference;

// Re-export main types
pub use cube::SpectralCube;
pub use domain::{Domain, DomainBuilder, DomainMode, FixedRegion, PixelSpacing};
pub use fusion::{FuseRequest, Fuser, FusionResult, FusionStage, RegressionFuser};
pub use inversion::{BioOpticalModel, InversionOutput, InversionRequest, InversionStage};
pub use masking::{CubeMasker, MaskInputs, MaskStage, MaskingOutcome};
pub use mosaic::Mosaicker;
pub use pipeline::{FusionPipeline, PipelineOutput, RunContext};
pub use reference::{IndexMap, LowResReference};
