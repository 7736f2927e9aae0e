use burn::nn::Initializer;
use burn::nn::PaddingConfig2d;
use burn::nn::Relu;
use burn::nn::conv::Conv2d;
use burn::nn::conv::Conv2dConfig;
use burn::nn::pool::MaxPool2d;
use burn::nn::pool::MaxPool2dConfig;
use burn::tensor::Device;
use burn::{
    config::Config,
    module::Module,
    tensor::{Tensor, backend::Backend},
};
use std::f64::consts::SQRT_2;

/// Channel widths at the five tapped depths of the VGG16 feature stack.
pub const STAGE_CHANNELS: [usize; 5] = [64, 128, 256, 512, 512];

/// A 3x3 same-padding convolution followed by a ReLU.
///
/// `Relu` is a pure op: its output never aliases the input buffer, so the
/// pre-pool activations the backbone hands out stay valid however often a
/// caller reuses them.
#[derive(Module, Debug)]
pub struct VggConv<B: Backend> {
    conv: Conv2d<B>,
    relu: Relu,
}

impl<B: Backend> VggConv<B> {
    fn conv3x3(in_channels: usize, out_channels: usize, device: &Device<B>) -> Self {
        let initializer = Initializer::KaimingNormal {
            gain: SQRT_2,
            fan_out_only: true,
        };
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_initializer(initializer)
                .init(device),
            relu: Relu::new(),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.relu.forward(self.conv.forward(input))
    }
}

/// A run of conv+relu layers between two pooling boundaries.
#[derive(Module, Debug)]
pub struct VggStage<B: Backend> {
    convs: Vec<VggConv<B>>,
}

impl<B: Backend> VggStage<B> {
    fn new(convs: usize, in_channels: usize, out_channels: usize, device: &Device<B>) -> Self {
        let convs = (0..convs)
            .map(|i| {
                let in_channels = if i == 0 { in_channels } else { out_channels };
                VggConv::conv3x3(in_channels, out_channels, device)
            })
            .collect();
        Self { convs }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut cur = input;
        for conv in &self.convs {
            cur = conv.forward(cur);
        }
        cur
    }
}

/// Activations at the five tapped depths, shallow to deep. Each map is taken
/// before the pooling step that follows its stage, matching the reference
/// slicing of the torchvision layer stack (0-3, 4-8, 9-15, 16-22, 23-29).
#[derive(Debug, Clone)]
pub struct VggActivations<B: Backend> {
    pub relu1_2: Tensor<B, 4>,
    pub relu2_2: Tensor<B, 4>,
    pub relu3_3: Tensor<B, 4>,
    pub relu4_3: Tensor<B, 4>,
    pub relu5_3: Tensor<B, 4>,
}

impl<B: Backend> VggActivations<B> {
    pub fn into_array(self) -> [Tensor<B, 4>; 5] {
        [
            self.relu1_2,
            self.relu2_2,
            self.relu3_3,
            self.relu4_3,
            self.relu5_3,
        ]
    }
}

/// The VGG16 feature stack, used purely as a frozen feature extractor.
#[derive(Module, Debug)]
pub struct VggBackbone<B: Backend> {
    stage1: VggStage<B>,
    stage2: VggStage<B>,
    stage3: VggStage<B>,
    stage4: VggStage<B>,
    stage5: VggStage<B>,
    pool: MaxPool2d,
}

impl<B: Backend> VggBackbone<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> VggActivations<B> {
        let relu1_2 = self.stage1.forward(input);
        let relu2_2 = self.stage2.forward(self.pool.forward(relu1_2.clone()));
        let relu3_3 = self.stage3.forward(self.pool.forward(relu2_2.clone()));
        let relu4_3 = self.stage4.forward(self.pool.forward(relu3_3.clone()));
        let relu5_3 = self.stage5.forward(self.pool.forward(relu4_3.clone()));
        VggActivations {
            relu1_2,
            relu2_2,
            relu3_3,
            relu4_3,
            relu5_3,
        }
    }
}

#[derive(Config)]
pub struct VggBackboneConfig {}

impl VggBackboneConfig {
    /// Initialize the backbone with Kaiming-normal weights. Pretrained
    /// parameters are loaded on top via a record, see
    /// [`LpipsExtractorConfig::load`](crate::LpipsExtractorConfig::load).
    pub fn init<B: Backend>(&self, device: &Device<B>) -> VggBackbone<B> {
        VggBackbone {
            stage1: VggStage::new(2, 3, 64, device),
            stage2: VggStage::new(2, 64, 128, device),
            stage3: VggStage::new(3, 128, 256, device),
            stage4: VggStage::new(3, 256, 512, device),
            stage5: VggStage::new(3, 512, 512, device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::backend::ndarray::NdArrayDevice;

    type TestBackend = NdArray;

    #[test]
    fn activations_halve_spatially_and_widen() {
        let device = NdArrayDevice::default();
        let backbone = VggBackboneConfig::new().init::<TestBackend>(&device);

        let input = Tensor::ones([1, 3, 32, 32], &device);
        let acts = backbone.forward(input);

        assert_eq!(acts.relu1_2.dims(), [1, 64, 32, 32]);
        assert_eq!(acts.relu2_2.dims(), [1, 128, 16, 16]);
        assert_eq!(acts.relu3_3.dims(), [1, 256, 8, 8]);
        assert_eq!(acts.relu4_3.dims(), [1, 512, 4, 4]);
        assert_eq!(acts.relu5_3.dims(), [1, 512, 2, 2]);
    }

    #[test]
    fn stage_widths_match_tapped_depths() {
        let device = NdArrayDevice::default();
        let backbone = VggBackboneConfig::new().init::<TestBackend>(&device);

        let acts = backbone
            .forward(Tensor::ones([2, 3, 32, 32], &device))
            .into_array();
        for (map, channels) in acts.iter().zip(STAGE_CHANNELS) {
            assert_eq!(map.dims()[0], 2, "batch dimension must be preserved");
            assert_eq!(map.dims()[1], channels);
        }
    }
}
