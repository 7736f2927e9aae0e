use crate::vgg::{VggBackbone, VggBackboneConfig};
use crate::weights::{LinWeights, WeightLoadError};
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::{
    config::Config,
    module::Module,
    tensor::{Device, Tensor, backend::Backend},
};
use std::path::Path;
use thiserror::Error;

/// Keeps channel norms finite on all-zero activation maps.
const NORM_EPS: f64 = 1e-10;

/// Per-channel statistics of the backbone's expected input distribution.
const INPUT_SHIFT: [f32; 3] = [-0.030, -0.088, -0.188];
const INPUT_SCALE: [f32; 3] = [0.458, 0.448, 0.450];

#[derive(Debug, Error)]
#[error("expected an NCHW batch with 3 channels, got shape {dims:?}")]
pub struct ShapeMismatchError {
    pub dims: [usize; 4],
}

/// Scales every spatial location's channel vector to unit L2 norm.
///
/// The norm is offset by `eps` both under and outside the square root, so
/// all-zero locations divide by a small positive number instead of by zero.
pub fn normalize_channels<B: Backend>(map: Tensor<B, 4>, eps: f64) -> Tensor<B, 4> {
    let norm = (map.clone().powi_scalar(2).sum_dim(1) + eps).sqrt();
    map / (norm + eps)
}

/// Flattened weighted features, one term per tapped depth, shallow to deep.
#[derive(Debug, Clone)]
pub struct FeatureStack<B: Backend> {
    pub relu1_2: Tensor<B, 2>,
    pub relu2_2: Tensor<B, 2>,
    pub relu3_3: Tensor<B, 2>,
    pub relu4_3: Tensor<B, 2>,
    pub relu5_3: Tensor<B, 2>,
}

impl<B: Backend> FeatureStack<B> {
    pub fn into_array(self) -> [Tensor<B, 2>; 5] {
        [
            self.relu1_2,
            self.relu2_2,
            self.relu3_3,
            self.relu4_3,
            self.relu5_3,
        ]
    }
}

/// Computes LPIPS feature embeddings for image batches.
///
/// All weights and constants are fixed at construction; extraction is a pure
/// function of the input batch, safe to share read-only across threads.
#[derive(Debug)]
pub struct LpipsExtractor<B: Backend> {
    backbone: VggBackbone<B>,
    lins: LinWeights<B>,
    shift: Tensor<B, 4>,
    scale: Tensor<B, 4>,
    alpha: f64,
}

#[derive(Config, Debug)]
pub struct LpipsExtractorConfig {
    /// Mixing weight of the raw-pixel term in
    /// [`extract_with_raw`](LpipsExtractor::extract_with_raw).
    #[config(default = 0.1)]
    pub alpha: f64,
}

impl LpipsExtractorConfig {
    /// Initialize with a random backbone and unit depth weights. Output
    /// shapes match the pretrained extractor; values are meaningless.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> LpipsExtractor<B> {
        LpipsExtractor::assemble(
            VggBackboneConfig::new().init(device),
            LinWeights::unit(device),
            self.alpha,
            device,
        )
    }

    /// Load the pretrained backbone record (as written by `lpips-import`)
    /// and the published depth weights.
    pub fn load<B: Backend>(
        &self,
        backbone: &Path,
        weights: &Path,
        device: &Device<B>,
    ) -> Result<LpipsExtractor<B>, WeightLoadError> {
        let model = VggBackboneConfig::new().init(device);
        let record = BinFileRecorder::<FullPrecisionSettings>::new()
            .load(backbone.to_path_buf(), device)?;
        let model = model.load_record(record).no_grad();

        let lins = LinWeights::from_safetensors(weights, device)?;
        log::debug!(
            "loaded LPIPS extractor from {} and {}",
            backbone.display(),
            weights.display()
        );
        Ok(LpipsExtractor::assemble(model, lins, self.alpha, device))
    }
}

impl<B: Backend> LpipsExtractor<B> {
    /// Assemble from already-loaded parts.
    pub fn new(backbone: VggBackbone<B>, lins: LinWeights<B>, device: &Device<B>) -> Self {
        Self::assemble(backbone, lins, LpipsExtractorConfig::new().alpha, device)
    }

    fn assemble(
        backbone: VggBackbone<B>,
        lins: LinWeights<B>,
        alpha: f64,
        device: &Device<B>,
    ) -> Self {
        let shift: Tensor<B, 4> =
            Tensor::<B, 1>::from_floats(INPUT_SHIFT, device).reshape([1, 3, 1, 1]);
        let scale: Tensor<B, 4> =
            Tensor::<B, 1>::from_floats(INPUT_SCALE, device).reshape([1, 3, 1, 1]);
        Self {
            backbone,
            lins,
            shift,
            scale,
            alpha,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Perceptual features of `batch`, one flattened term per depth.
    ///
    /// Inputs are NCHW in [0, 1]; with `normalize` unset the caller is
    /// expected to have rescaled to [-1, 1] already.
    pub fn extract(
        &self,
        batch: Tensor<B, 4>,
        normalize: bool,
    ) -> Result<FeatureStack<B>, ShapeMismatchError> {
        let batch = if normalize { batch * 2.0 - 1.0 } else { batch };
        let whitened = self.whiten(batch)?;
        let [f1, f2, f3, f4, f5] = self.weighted_maps(whitened);
        Ok(FeatureStack {
            relu1_2: f1.flatten(1, 3),
            relu2_2: f2.flatten(1, 3),
            relu3_3: f3.flatten(1, 3),
            relu4_3: f4.flatten(1, 3),
            relu5_3: f5.flatten(1, 3),
        })
    }

    /// Single embedding mixing the perceptual terms with a raw-pixel term.
    /// Inputs are NCHW in [0, 1].
    ///
    /// Each flattened depth term is divided by the square root of its own
    /// length so terms of different dimensionality contribute comparably;
    /// the re-whitened input is appended scaled by `sqrt(alpha / (C*H*W))`.
    pub fn extract_with_raw(
        &self,
        batch: Tensor<B, 4>,
    ) -> Result<Tensor<B, 2>, ShapeMismatchError> {
        let whitened = self.whiten(batch * 2.0 - 1.0)?;
        let [_, channels, height, width] = whitened.dims();

        let mut terms: Vec<Tensor<B, 2>> = self
            .weighted_maps(whitened.clone())
            .into_iter()
            .map(|map| {
                let flat: Tensor<B, 2> = map.flatten(1, 3);
                let len = flat.dims()[1];
                flat / (len as f64).sqrt()
            })
            .collect();

        let raw_dim = (channels * height * width) as f64;
        let raw: Tensor<B, 2> = whitened.flatten(1, 3);
        terms.push(raw * (self.alpha / raw_dim).sqrt());

        Ok(Tensor::cat(terms, 1))
    }

    fn whiten(&self, batch: Tensor<B, 4>) -> Result<Tensor<B, 4>, ShapeMismatchError> {
        let dims = batch.dims();
        if dims[1] != 3 {
            return Err(ShapeMismatchError { dims });
        }
        Ok((batch - self.shift.clone()) / self.scale.clone())
    }

    fn weighted_maps(&self, whitened: Tensor<B, 4>) -> [Tensor<B, 4>; 5] {
        let acts = self.backbone.forward(whitened);
        let weigh = |map: Tensor<B, 4>, index: usize| {
            normalize_channels(map, NORM_EPS) * self.lins.depth(index).clone()
        };
        [
            weigh(acts.relu1_2, 0),
            weigh(acts.relu2_2, 1),
            weigh(acts.relu3_3, 2),
            weigh(acts.relu4_3, 3),
            weigh(acts.relu5_3, 4),
        ]
    }
}
