use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::errors::{Result, ScanError};

/// Resize filter used when bringing an upload to the patch grid size.
///
/// `bilinear` reproduces OpenCV `INTER_LINEAR` (point-sampled, no
/// antialiasing), which is how the segmentation encoder's training images were
/// resized. `triangle` is the antialiased tent filter of `imageops`. Whatever is
/// chosen stays fixed for the process.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ResizeFilter {
    Nearest,
    #[default]
    Bilinear,
    Triangle,
    Bicubic,
    Lanczos3,
}

/// Channel order of the flattened patch tensor.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChannelOrder {
    #[default]
    Bgr,
    Rgb,
}

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    #[arg(long, env = "INTELLISCAN_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(short, long, env = "INTELLISCAN_PORT", default_value_t = 5003)]
    pub port: u16,

    /// ONNX export of the patch-based segmentation encoder
    #[arg(short, long, env = "INTELLISCAN_SEGMENTATION_MODEL", default_value = "best_model.onnx")]
    pub segmentation_model: PathBuf,

    /// ONNX export of the tumor classifier
    #[arg(short, long, env = "INTELLISCAN_CLASSIFIER_MODEL", default_value = "classifier.onnx")]
    pub classifier_model: PathBuf,

    /// Optional safetensors checkpoint merged into the classifier by name and shape
    #[arg(long, env = "INTELLISCAN_CLASSIFIER_WEIGHTS")]
    pub classifier_weights: Option<PathBuf>,

    /// Labeled training directory; its subdirectory names are the class names
    #[arg(long, env = "INTELLISCAN_CLASS_DIR", default_value = "archive/Training")]
    pub class_dir: PathBuf,

    #[arg(long, env = "INTELLISCAN_IMAGE_SIZE", default_value_t = 256)]
    pub image_size: u32,

    #[arg(long, env = "INTELLISCAN_PATCH_SIZE", default_value_t = 16)]
    pub patch_size: u32,

    #[arg(long, env = "INTELLISCAN_NUM_CHANNELS", default_value_t = 3)]
    pub num_channels: u32,

    #[arg(long, env = "INTELLISCAN_RESIZE_FILTER", value_enum, default_value_t = ResizeFilter::Bilinear)]
    pub resize_filter: ResizeFilter,

    #[arg(long, env = "INTELLISCAN_CHANNEL_ORDER", value_enum, default_value_t = ChannelOrder::Bgr)]
    pub channel_order: ChannelOrder,

    #[arg(short, long, env = "INTELLISCAN_DEVICE_ID", default_value_t = 0)]
    pub device_id: i32,

    /// Intra-op threads per ONNX session (runtime default when unset)
    #[arg(long, env = "INTELLISCAN_INTRA_THREADS")]
    pub intra_threads: Option<usize>,

    /// Also write every overlay to this file (last write wins)
    #[arg(long, env = "INTELLISCAN_MASK_PATH")]
    pub mask_path: Option<PathBuf>,

    /// Prefix for `segmentation_mask_url`; empty yields a relative URL
    #[arg(long, env = "INTELLISCAN_PUBLIC_BASE_URL", default_value = "")]
    pub public_base_url: String,

    /// Number of overlays kept in memory
    #[arg(long, env = "INTELLISCAN_ARTIFACT_CAPACITY", default_value_t = 64)]
    pub artifact_capacity: usize,

    #[arg(long, env = "INTELLISCAN_MAX_UPLOAD_BYTES", default_value_t = 16 * 1024 * 1024)]
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5003,
            segmentation_model: "best_model.onnx".into(),
            classifier_model: "classifier.onnx".into(),
            classifier_weights: None,
            class_dir: "archive/Training".into(),
            image_size: 256,
            patch_size: 16,
            num_channels: 3,
            resize_filter: ResizeFilter::default(),
            channel_order: ChannelOrder::default(),
            device_id: 0,
            intra_threads: None,
            mask_path: None,
            public_base_url: String::new(),
            artifact_capacity: 64,
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0 {
            return Err(validation("image_size", "must be greater than zero"));
        }
        if self.patch_size == 0 {
            return Err(validation("patch_size", "must be greater than zero"));
        }
        if self.image_size % self.patch_size != 0 {
            return Err(validation(
                "patch_size",
                &format!("must divide image_size {}", self.image_size),
            ));
        }
        if self.num_channels == 0 {
            return Err(validation("num_channels", "must be greater than zero"));
        }
        if self.artifact_capacity == 0 {
            return Err(validation("artifact_capacity", "must be greater than zero"));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ScanError::Configuration {
                message: format!("invalid listen address {}:{}: {}", self.host, self.port, e),
            })
    }

    /// URL under which the overlay with `id` can be fetched.
    pub fn mask_url(&self, id: &str) -> String {
        format!("{}/mask/{}", self.public_base_url.trim_end_matches('/'), id)
    }
}

fn validation(field: &str, reason: &str) -> ScanError {
    ScanError::Validation {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
