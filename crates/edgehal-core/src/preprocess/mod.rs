//! Preprocessing: geometry + normalization from camera frames to network
//! input tensors.
//!
//! Two engines implement the same [`Preprocessor`] contract: the pure-CPU
//! [`software::SoftwarePreprocessor`] and [`scaler::ScalerPreprocessor`],
//! which drives the SoC's hardware scaler through a driver seam and only
//! adds the cache discipline around it.
//!
//! The rescale config a preprocessor reports is the *forward* mapping from
//! source to destination pixels; postprocessing inverts it to map network
//! coordinates back onto the original frame.

pub mod ops;
pub mod scaler;
pub mod software;

use serde::{Deserialize, Serialize};

use crate::error::HalResult;
use crate::image::{Image, ImageFormat};
use crate::tensor::Tensor;

pub use scaler::{HostScalerDriver, ScalerDriver, ScalerPreprocessor};
pub use software::SoftwarePreprocessor;

/// Region of the source frame to preprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMethod {
    #[default]
    Bilinear,
    Nearest,
}

/// Per-model preprocessing parameters.
///
/// Normalization is `(pixel - mean[c]) * scale[c]` per channel; for
/// quantized inputs the pipeline folds the network's quantization scale
/// into both factors before handing the params to a preprocessor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessParams {
    pub mean: [f32; 3],
    pub scale: [f32; 3],
    pub keep_aspect_ratio: bool,
    pub pad_value: u8,
    pub resize_method: ResizeMethod,
    #[serde(default)]
    pub crop: Option<CropRect>,
}

impl Default for PreprocessParams {
    fn default() -> Self {
        PreprocessParams {
            mean: [0.0; 3],
            scale: [1.0; 3],
            keep_aspect_ratio: false,
            pad_value: 0,
            resize_method: ResizeMethod::Bilinear,
            crop: None,
        }
    }
}

/// Forward mapping from source to destination pixel coordinates:
/// `dst = src * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RescaleConfig {
    pub scale_x: f32,
    pub scale_y: f32,
    pub offset_x: f32,
    pub offset_y: f32,
}

impl RescaleConfig {
    pub fn identity() -> RescaleConfig {
        RescaleConfig {
            scale_x: 1.0,
            scale_y: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }

    /// Map a destination coordinate back onto the source frame.
    pub fn invert(&self, dst_x: f32, dst_y: f32) -> (f32, f32) {
        (
            (dst_x - self.offset_x) / self.scale_x,
            (dst_y - self.offset_y) / self.scale_y,
        )
    }
}

/// Compute the forward rescale mapping for a source/destination geometry.
///
/// With `keep_aspect_ratio` the smaller axis ratio wins and the image is
/// centered with equal bars on the other axis (offsets truncate to whole
/// pixels). A crop folds in as `offset = pad - crop_origin * scale`.
pub fn compute_rescale_config(
    params: &PreprocessParams,
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
) -> RescaleConfig {
    let (crop_x, crop_y, region_w, region_h) = match params.crop {
        Some(c) => (c.x as f32, c.y as f32, c.width as f32, c.height as f32),
        None => (0.0, 0.0, src_width as f32, src_height as f32),
    };
    let dw = dst_width as f32;
    let dh = dst_height as f32;
    let (scale_x, scale_y) = if params.keep_aspect_ratio {
        let s = (dw / region_w).min(dh / region_h);
        (s, s)
    } else {
        (dw / region_w, dh / region_h)
    };
    let pad_x = ((dw - region_w * scale_x) / 2.0).trunc();
    let pad_y = ((dh - region_h * scale_y) / 2.0).trunc();
    RescaleConfig {
        scale_x,
        scale_y,
        offset_x: pad_x - crop_x * scale_x,
        offset_y: pad_y - crop_y * scale_y,
    }
}

/// Common contract for the preprocessing engines.
pub trait Preprocessor {
    /// Transform `src` into `dst`'s geometry and format, applying the
    /// normalization in `params`. Leaves `dst` synchronized for hardware.
    fn preprocess(
        &self,
        src: &dyn Image,
        dst: &mut dyn Image,
        params: &PreprocessParams,
    ) -> HalResult<()>;

    /// The forward mapping `preprocess` applies for this geometry.
    fn rescale_config(
        &self,
        params: &PreprocessParams,
        src: &dyn Image,
        dst_width: u32,
        dst_height: u32,
    ) -> RescaleConfig {
        compute_rescale_config(params, src.width(), src.height(), dst_width, dst_height)
    }

    /// Preprocess straight into one batch slot of a network input tensor,
    /// avoiding an intermediate frame. The slot is aliased as a planar
    /// image view, so writes land in network memory directly.
    fn preprocess_to_tensor(
        &self,
        src: &dyn Image,
        tensor: &mut Tensor,
        batch_index: usize,
        dst_width: u32,
        dst_height: u32,
        dst_format: ImageFormat,
        params: &PreprocessParams,
    ) -> HalResult<()> {
        let mut view =
            tensor.construct_image_view(batch_index, dst_width, dst_height, dst_format)?;
        self.preprocess(src, &mut view, params)?;
        tensor.flush()
    }

    /// Plain resize: no normalization, no letterbox.
    fn resize(&self, src: &dyn Image, dst: &mut dyn Image) -> HalResult<()> {
        self.preprocess(src, dst, &PreprocessParams::default())
    }

    /// Extract a region at its native size.
    fn crop(&self, src: &dyn Image, dst: &mut dyn Image, rect: CropRect) -> HalResult<()> {
        self.preprocess(
            src,
            dst,
            &PreprocessParams {
                crop: Some(rect),
                ..Default::default()
            },
        )
    }

    /// Extract a region and resize it to the destination geometry.
    fn crop_resize(&self, src: &dyn Image, dst: &mut dyn Image, rect: CropRect) -> HalResult<()> {
        self.crop(src, dst, rect)
    }
}
