#![recursion_limit = "256"]

//! LPIPS-style perceptual image features on top of a frozen VGG16 backbone.
//!
//! The embedding distance between two images approximates human-perceived
//! visual difference far better than raw pixel distance. See
//! <https://github.com/richzhang/PerceptualSimilarity> for the published
//! weights this crate consumes.

pub mod extractor;
pub mod vgg;
pub mod weights;

pub use extractor::{
    FeatureStack, LpipsExtractor, LpipsExtractorConfig, ShapeMismatchError, normalize_channels,
};
pub use vgg::{STAGE_CHANNELS, VggActivations, VggBackbone, VggBackboneConfig};
pub use weights::{LIN_KEYS, LinWeights, WeightLoadError};
