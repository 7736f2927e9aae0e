use crate::vgg::STAGE_CHANNELS;
use burn::tensor::{Device, Tensor, TensorData, backend::Backend};
use safetensors::tensor::{Dtype, SafeTensors};
use std::path::Path;
use thiserror::Error;

/// Keys of the published per-depth weight tensors inside the weight asset.
pub const LIN_KEYS: [&str; 5] = [
    "lin0.model.1.weight",
    "lin1.model.1.weight",
    "lin2.model.1.weight",
    "lin3.model.1.weight",
    "lin4.model.1.weight",
];

#[derive(Debug, Error)]
pub enum WeightLoadError {
    #[error("weight asset is missing tensor {name:?}")]
    MissingTensor { name: &'static str },
    #[error("tensor {name:?} has shape {shape:?}, expected {channels} channels")]
    UnexpectedShape {
        name: &'static str,
        shape: Vec<usize>,
        channels: usize,
    },
    #[error("tensor {name:?} is stored as {dtype:?}, expected F32")]
    UnsupportedDtype { name: &'static str, dtype: Dtype },
    #[error("tensor {name:?} contains negative values, published weights are non-negative")]
    NegativeWeight { name: &'static str },
    #[error("failed to parse weight asset: {0}")]
    Parse(#[from] safetensors::tensor::SafeTensorError),
    #[error("failed to read weight asset: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to load backbone record: {0}")]
    Record(#[from] burn::record::RecorderError),
}

/// Learned per-channel weights at the five tapped depths.
///
/// Stored as the square root of the published values, taken once at load
/// time, so scaling a normalized activation map is a single multiply.
#[derive(Debug, Clone)]
pub struct LinWeights<B: Backend> {
    depths: [Tensor<B, 4>; 5],
}

impl<B: Backend> LinWeights<B> {
    /// Read the weight asset fetched by `lpips-fetch`.
    pub fn from_safetensors(path: &Path, device: &Device<B>) -> Result<Self, WeightLoadError> {
        let bytes = std::fs::read(path)?;
        Self::from_safetensor_bytes(&bytes, device)
    }

    pub fn from_safetensor_bytes(
        bytes: &[u8],
        device: &Device<B>,
    ) -> Result<Self, WeightLoadError> {
        let asset = SafeTensors::deserialize(bytes)?;
        let depth = |index| decode_depth(&asset, index, device);
        Ok(Self {
            depths: [depth(0)?, depth(1)?, depth(2)?, depth(3)?, depth(4)?],
        })
    }

    /// Build from published per-channel values held in memory.
    pub fn from_published(
        values: &[Vec<f32>; 5],
        device: &Device<B>,
    ) -> Result<Self, WeightLoadError> {
        let depth = |index: usize| depth_tensor(index, &values[index], device);
        Ok(Self {
            depths: [depth(0)?, depth(1)?, depth(2)?, depth(3)?, depth(4)?],
        })
    }

    /// Unit weights at every depth. Stands in for the published values in
    /// shape checks and freshly initialized models.
    pub fn unit(device: &Device<B>) -> Self {
        Self {
            depths: STAGE_CHANNELS.map(|channels| Tensor::ones([1, channels, 1, 1], device)),
        }
    }

    /// Weight tensor for one tapped depth, shaped `[1, C, 1, 1]` for
    /// broadcasting over batch and space.
    ///
    /// # Panics
    /// If `index` is not one of the five tapped depths.
    pub fn depth(&self, index: usize) -> &Tensor<B, 4> {
        assert!(index < 5, "depth index out of range: {index}");
        &self.depths[index]
    }

    pub fn into_array(self) -> [Tensor<B, 4>; 5] {
        self.depths
    }
}

fn decode_depth<B: Backend>(
    asset: &SafeTensors,
    index: usize,
    device: &Device<B>,
) -> Result<Tensor<B, 4>, WeightLoadError> {
    let name = LIN_KEYS[index];
    let channels = STAGE_CHANNELS[index];

    let view = asset
        .tensor(name)
        .map_err(|_| WeightLoadError::MissingTensor { name })?;
    if view.dtype() != Dtype::F32 {
        return Err(WeightLoadError::UnsupportedDtype {
            name,
            dtype: view.dtype(),
        });
    }
    // The published tensors are 1x1 conv kernels, but accept a bare channel
    // vector too.
    let shape = view.shape();
    if shape != [channels].as_slice() && shape != [1, channels, 1, 1].as_slice() {
        return Err(WeightLoadError::UnexpectedShape {
            name,
            shape: shape.to_vec(),
            channels,
        });
    }

    // Safetensors data is little-endian and not necessarily aligned.
    let values: Vec<f32> = view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    depth_tensor(index, &values, device)
}

fn depth_tensor<B: Backend>(
    index: usize,
    published: &[f32],
    device: &Device<B>,
) -> Result<Tensor<B, 4>, WeightLoadError> {
    let name = LIN_KEYS[index];
    let channels = STAGE_CHANNELS[index];

    if published.len() != channels {
        return Err(WeightLoadError::UnexpectedShape {
            name,
            shape: vec![published.len()],
            channels,
        });
    }
    if published.iter().any(|v| *v < 0.0) {
        return Err(WeightLoadError::NegativeWeight { name });
    }

    let data = TensorData::new(published.to_vec(), [1, channels, 1, 1]);
    Ok(Tensor::from_data(data, device).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use burn::backend::NdArray;
    use burn::backend::ndarray::NdArrayDevice;
    use safetensors::tensor::TensorView;

    type TestBackend = NdArray;

    fn published_values(channels: usize) -> Vec<f32> {
        (0..channels).map(|i| 0.5 + i as f32 * 0.01).collect()
    }

    fn asset_bytes(depths: &[(&str, usize)]) -> Vec<u8> {
        let payloads: Vec<Vec<u8>> = depths
            .iter()
            .map(|&(_, channels)| {
                bytemuck::cast_slice(&published_values(channels)).to_vec()
            })
            .collect();
        let views: Vec<(&str, TensorView)> = depths
            .iter()
            .zip(&payloads)
            .map(|(&(name, channels), bytes)| {
                (
                    name,
                    TensorView::new(Dtype::F32, vec![channels], bytes).unwrap(),
                )
            })
            .collect();
        safetensors::serialize(views, None).unwrap()
    }

    fn full_asset() -> Vec<u8> {
        let depths: Vec<(&str, usize)> = LIN_KEYS.into_iter().zip(STAGE_CHANNELS).collect();
        asset_bytes(&depths)
    }

    #[test]
    fn loaded_weights_square_back_to_published_values() {
        let device = NdArrayDevice::default();
        let lins =
            LinWeights::<TestBackend>::from_safetensor_bytes(&full_asset(), &device).unwrap();

        for (index, &channels) in STAGE_CHANNELS.iter().enumerate() {
            let loaded = lins.depth(index).clone().into_data();
            let loaded = loaded.as_slice::<f32>().unwrap();
            assert_eq!(loaded.len(), channels);
            for (stored, published) in loaded.iter().zip(published_values(channels)) {
                assert_approx_eq!(stored * stored, published, 1e-5);
            }
        }
    }

    #[test]
    fn missing_depth_tensor_is_rejected() {
        let device = NdArrayDevice::default();
        let depths: Vec<(&str, usize)> = LIN_KEYS
            .into_iter()
            .zip(STAGE_CHANNELS)
            .filter(|(name, _)| *name != "lin3.model.1.weight")
            .collect();

        let err = LinWeights::<TestBackend>::from_safetensor_bytes(&asset_bytes(&depths), &device)
            .unwrap_err();
        assert!(
            matches!(
                err,
                WeightLoadError::MissingTensor {
                    name: "lin3.model.1.weight"
                }
            ),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn wrong_channel_count_is_rejected() {
        let device = NdArrayDevice::default();
        let mut depths: Vec<(&str, usize)> =
            LIN_KEYS.into_iter().zip(STAGE_CHANNELS).collect();
        depths[0].1 = 32;

        let err = LinWeights::<TestBackend>::from_safetensor_bytes(&asset_bytes(&depths), &device)
            .unwrap_err();
        assert!(
            matches!(err, WeightLoadError::UnexpectedShape { channels: 64, .. }),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn negative_published_weight_is_rejected() {
        let device = NdArrayDevice::default();
        let mut values = STAGE_CHANNELS.map(published_values);
        values[2][0] = -0.25;

        let err = LinWeights::<TestBackend>::from_published(&values, &device).unwrap_err();
        assert!(
            matches!(
                err,
                WeightLoadError::NegativeWeight {
                    name: "lin2.model.1.weight"
                }
            ),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    #[should_panic(expected = "depth index out of range: 5")]
    fn depth_index_past_the_deepest_tap_panics() {
        let device = NdArrayDevice::default();
        let lins = LinWeights::<TestBackend>::unit(&device);
        let _ = lins.depth(5);
    }

    #[test]
    fn unit_weights_broadcast_over_batch_and_space() {
        let device = NdArrayDevice::default();
        let lins = LinWeights::<TestBackend>::unit(&device);
        for (index, channels) in STAGE_CHANNELS.into_iter().enumerate() {
            assert_eq!(lins.depth(index).dims(), [1, channels, 1, 1]);
        }
    }
}
