#![recursion_limit = "256"]

//! Converts the published PyTorch weight files into the formats the library
//! loads: the torchvision VGG16 checkpoint into a burn record, the LPIPS
//! linear weights into a safetensors asset keeping the published key names.

use anyhow::Context;
use burn::backend::NdArray;
use burn::module::{Module, Param};
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::{Tensor, backend::Backend};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use lpips_feats::vgg::{VggBackbone, VggBackboneConfig};
use lpips_feats::weights::LIN_KEYS;
use safetensors::tensor::{Dtype, TensorView};

const VGG_SOURCE: &str = "vgg16.pth";
const LIN_SOURCE: &str = "vgg_lpips_weights.pth";
/// `BinFileRecorder` appends its own `.bin` extension.
const VGG_TARGET: &str = "vgg16_backbone";
const LIN_TARGET: &str = "vgg_lpips_weights.safetensors";

// Torchvision layer index | stage | conv index within the stage.
const VGG_LAYER_MAP: [(&str, usize, usize); 13] = [
    ("0", 1, 0),
    ("2", 1, 1),
    ("5", 2, 0),
    ("7", 2, 1),
    ("10", 3, 0),
    ("12", 3, 1),
    ("14", 3, 2),
    ("17", 4, 0),
    ("19", 4, 1),
    ("21", 4, 2),
    ("24", 5, 0),
    ("26", 5, 1),
    ("28", 5, 2),
];

fn convert_backbone<B: Backend>(device: &B::Device) -> anyhow::Result<()> {
    let mut load_args = LoadArgs::new(VGG_SOURCE.into());
    for (torch_idx, stage, conv) in VGG_LAYER_MAP {
        load_args = load_args.with_key_remap(
            &format!(r"^features\.{torch_idx}\.(weight|bias)$"),
            &format!(r"stage{stage}.convs.{conv}.conv.$1"),
        );
    }

    let record: <VggBackbone<B> as Module<B>>::Record =
        PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(load_args, device)
            .context("failed to read the torchvision VGG16 checkpoint")?;
    let model = VggBackboneConfig::new().init::<B>(device).load_record(record);

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .save_file(VGG_TARGET, &recorder)
        .context("failed to write the backbone record")?;
    Ok(())
}

/// Shell for deserializing the five published linear-weight tensors.
#[derive(Module, Debug)]
struct LinHead<B: Backend> {
    lin0: Param<Tensor<B, 4>>,
    lin1: Param<Tensor<B, 4>>,
    lin2: Param<Tensor<B, 4>>,
    lin3: Param<Tensor<B, 4>>,
    lin4: Param<Tensor<B, 4>>,
}

fn convert_lin_weights<B: Backend>(device: &B::Device) -> anyhow::Result<()> {
    let mut load_args = LoadArgs::new(LIN_SOURCE.into());
    for (index, key) in LIN_KEYS.iter().enumerate() {
        load_args = load_args.with_key_remap(
            &format!("^{}$", key.replace('.', r"\.")),
            &format!("lin{index}"),
        );
    }

    let record: <LinHead<B> as Module<B>>::Record =
        PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(load_args, device)
            .context("failed to read the published LPIPS linear weights")?;
    let params = [
        record.lin0,
        record.lin1,
        record.lin2,
        record.lin3,
        record.lin4,
    ];

    // The asset keeps the raw published values; the library takes square
    // roots at load time.
    let payloads: Vec<(Vec<usize>, Vec<f32>)> = params
        .into_iter()
        .map(|param| {
            let tensor = param.val();
            let shape = tensor.dims().to_vec();
            let values = tensor
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| anyhow::anyhow!("failed to read tensor data: {e:?}"))?;
            Ok((shape, values))
        })
        .collect::<anyhow::Result<_>>()?;
    let views: Vec<(&str, TensorView)> = LIN_KEYS
        .iter()
        .zip(&payloads)
        .map(|(key, (shape, values))| {
            let view = TensorView::new(Dtype::F32, shape.clone(), bytemuck::cast_slice(values))?;
            Ok((*key, view))
        })
        .collect::<anyhow::Result<_>>()?;

    let bytes = safetensors::serialize(views, None)?;
    std::fs::write(LIN_TARGET, bytes).context("failed to write the weight asset")?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let device = Default::default();

    log::info!("converting {VGG_SOURCE}");
    convert_backbone::<NdArray>(&device)?;
    log::info!("converting {LIN_SOURCE}");
    convert_lin_weights::<NdArray>(&device)?;
    log::info!("wrote {VGG_TARGET}.bin and {LIN_TARGET}");
    Ok(())
}
