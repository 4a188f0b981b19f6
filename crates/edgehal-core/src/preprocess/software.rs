//! Pure-CPU preprocessing engine.
//!
//! Handles the packed 8-bit camera formats: warp (resize, letterbox, crop)
//! into a packed intermediate, fix the channel order, then split into the
//! destination planes with per-channel normalization and sample-type
//! conversion. Slower than the hardware scaler but available everywhere,
//! including the accelerator platform where frames arrive over PCIe.

use crate::dtype::DataType;
use crate::error::{HalError, HalResult};
use crate::image::{Image, ImageFormat};
use crate::preprocess::ops::{split_scale, swap_rb, warp_into, PackedView, PackedViewMut};
use crate::preprocess::{PreprocessParams, Preprocessor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelOrder {
    Rgb,
    Bgr,
    Mono,
}

fn channel_order(format: ImageFormat) -> Option<ChannelOrder> {
    match format {
        ImageFormat::Gray => Some(ChannelOrder::Mono),
        ImageFormat::RgbPacked | ImageFormat::RgbPlanar => Some(ChannelOrder::Rgb),
        ImageFormat::BgrPacked | ImageFormat::BgrPlanar => Some(ChannelOrder::Bgr),
        _ => None,
    }
}

#[derive(Default)]
pub struct SoftwarePreprocessor;

impl SoftwarePreprocessor {
    pub fn new() -> Self {
        SoftwarePreprocessor
    }
}

impl Preprocessor for SoftwarePreprocessor {
    fn preprocess(
        &self,
        src: &dyn Image,
        dst: &mut dyn Image,
        params: &PreprocessParams,
    ) -> HalResult<()> {
        let src_layout = src.layout().clone();
        let dst_layout = dst.layout().clone();
        if src_layout.dtype != DataType::Uint8 {
            return Err(HalError::UnsupportedFormat(format!(
                "software preprocessing reads 8-bit sources, got {:?}",
                src_layout.dtype
            )));
        }
        if src_layout.format.is_planar() && src_layout.format != ImageFormat::Gray {
            return Err(HalError::UnsupportedFormat(format!(
                "software preprocessing reads packed sources, got {:?}",
                src_layout.format
            )));
        }
        let src_order = channel_order(src_layout.format).ok_or_else(|| {
            HalError::UnsupportedFormat(format!(
                "software preprocessing cannot read {:?}",
                src_layout.format
            ))
        })?;
        let dst_order = channel_order(dst_layout.format).ok_or_else(|| {
            HalError::UnsupportedFormat(format!(
                "software preprocessing cannot write {:?}",
                dst_layout.format
            ))
        })?;
        let channels = src_layout.format.packed_channels();
        if (dst_order == ChannelOrder::Mono) != (src_order == ChannelOrder::Mono) {
            return Err(HalError::UnsupportedFormat(
                "gray/color conversion is not part of preprocessing".into(),
            ));
        }

        src.invalidate_cache()?;
        let cfg = self.rescale_config(params, src, dst_layout.width, dst_layout.height);

        let src_block = src
            .memory_block()
            .ok_or_else(|| HalError::InvalidState("source image memory not set up".into()))?;
        let src_view = PackedView {
            data: src_block.as_slice()?,
            width: src_layout.width as usize,
            height: src_layout.height as usize,
            stride: src_layout.strides[0],
            channels,
        };

        let dw = dst_layout.width as usize;
        let dh = dst_layout.height as usize;
        let mut packed = vec![0u8; dw * dh * channels];
        {
            let mut packed_view = PackedViewMut {
                data: &mut packed,
                width: dw,
                height: dh,
                stride: dw * channels,
                channels,
            };
            warp_into(
                &src_view,
                &mut packed_view,
                &cfg,
                params.crop,
                params.resize_method,
                params.pad_value,
            )?;
            if src_order != dst_order && channels == 3 {
                swap_rb(&mut packed_view);
            }
        }

        let packed_view = PackedView {
            data: &packed,
            width: dw,
            height: dh,
            stride: dw * channels,
            channels,
        };
        if dst_layout.format.is_planar() {
            // The planar split writes tightly packed planes; padded
            // destination strides would shear the pixels.
            if !dst.is_aligned() {
                return Err(HalError::UnsupportedFormat(
                    "planar preprocessing targets need packed strides".into(),
                ));
            }
            let virts = dst.virtual_address()?;
            let plane_len = dst_layout.plane_lengths[0];
            let mut planes: Vec<&mut [u8]> = virts
                .iter()
                // Safety: each plane points at plane_len bytes of the block.
                .map(|&p| unsafe { std::slice::from_raw_parts_mut(p, plane_len) })
                .collect();
            split_scale(
                &packed_view,
                &mut planes,
                dst_layout.dtype,
                &params.mean,
                &params.scale,
            )?;
        } else {
            if dst_layout.dtype != DataType::Uint8 {
                return Err(HalError::UnsupportedFormat(format!(
                    "packed preprocessing targets must be 8-bit, got {:?}",
                    dst_layout.dtype
                )));
            }
            let stride = dst_layout.strides[0];
            let base = dst.virtual_address()?[0];
            for y in 0..dh {
                let src_row = &packed[y * dw * channels..(y + 1) * dw * channels];
                // Safety: each destination row carries `stride` valid bytes.
                let dst_row =
                    unsafe { std::slice::from_raw_parts_mut(base.add(y * stride), dw * channels) };
                for (i, &v) in src_row.iter().enumerate() {
                    let c = i % channels;
                    let out = (v as f32 - params.mean[c]) * params.scale[c];
                    dst_row[i] = out.round().clamp(0.0, 255.0) as u8;
                }
            }
        }
        dst.flush_cache()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::SoftwareImage;
    use crate::memory::{CpuMemoryPool, SharedPool};
    use crate::preprocess::{compute_rescale_config, CropRect};
    use std::sync::{Arc, Mutex};

    fn cpu_pool() -> SharedPool {
        Arc::new(Mutex::new(CpuMemoryPool::new()))
    }

    fn packed_bgr(pixels: &[u8], w: u32, h: u32) -> SoftwareImage {
        let mut img = SoftwareImage::new(
            w,
            h,
            ImageFormat::BgrPacked,
            DataType::Uint8,
            Some(cpu_pool()),
        )
        .unwrap();
        img.allocate_memory().unwrap();
        img.copy_from_buffer(pixels).unwrap();
        img
    }

    #[test]
    fn test_packed_to_planar_normalization() {
        // One blue pixel in BGR order.
        let src = packed_bgr(&[255, 0, 0], 1, 1);
        let mut dst = SoftwareImage::new(
            1,
            1,
            ImageFormat::RgbPlanar,
            DataType::Fp32,
            Some(cpu_pool()),
        )
        .unwrap();
        dst.allocate_memory().unwrap();
        let params = PreprocessParams {
            mean: [127.5; 3],
            scale: [1.0 / 127.5; 3],
            ..Default::default()
        };
        SoftwarePreprocessor::new()
            .preprocess(&src, &mut dst, &params)
            .unwrap();
        let bytes = dst.memory_block().unwrap().as_slice().unwrap();
        let read = |plane: usize| {
            f32::from_ne_bytes(bytes[plane * 4..plane * 4 + 4].try_into().unwrap())
        };
        // RGB planar destination: R and G at -1, B at +1.
        assert_eq!(read(0), -1.0);
        assert_eq!(read(1), -1.0);
        assert_eq!(read(2), 1.0);
    }

    #[test]
    fn test_letterbox_preserves_aspect_ratio() {
        // 2x1 white source into 4x4 with letterbox: the scaled rows sit in
        // the vertical middle, padding everywhere else.
        let src = packed_bgr(&[255; 6], 2, 1);
        let mut dst = SoftwareImage::new(
            4,
            4,
            ImageFormat::BgrPacked,
            DataType::Uint8,
            Some(cpu_pool()),
        )
        .unwrap();
        dst.allocate_memory().unwrap();
        let params = PreprocessParams {
            keep_aspect_ratio: true,
            pad_value: 7,
            resize_method: crate::preprocess::ResizeMethod::Nearest,
            ..Default::default()
        };
        let pre = SoftwarePreprocessor::new();
        pre.preprocess(&src, &mut dst, &params).unwrap();
        let cfg = compute_rescale_config(&params, 2, 1, 4, 4);
        assert_eq!(cfg.scale_x, 2.0);
        assert_eq!(cfg.offset_y, 1.0);
        let out = dst.memory_block().unwrap().as_slice().unwrap();
        // Row 0 is padding, rows 1-2 hold scaled pixels.
        assert!(out[..12].iter().all(|&v| v == 7));
        assert!(out[12..24].iter().all(|&v| v == 255));
    }

    #[test]
    fn test_crop_extracts_region() {
        // 2x2 gray gradient; crop the bottom-right pixel into a 1x1 dst.
        let mut src = SoftwareImage::new(
            2,
            2,
            ImageFormat::Gray,
            DataType::Uint8,
            Some(cpu_pool()),
        )
        .unwrap();
        src.allocate_memory().unwrap();
        src.copy_from_buffer(&[10, 20, 30, 40]).unwrap();
        let mut dst =
            SoftwareImage::new(1, 1, ImageFormat::Gray, DataType::Uint8, Some(cpu_pool()))
                .unwrap();
        dst.allocate_memory().unwrap();
        SoftwarePreprocessor::new()
            .crop(
                &src,
                &mut dst,
                CropRect {
                    x: 1,
                    y: 1,
                    width: 1,
                    height: 1,
                },
            )
            .unwrap();
        assert_eq!(dst.memory_block().unwrap().as_slice().unwrap(), &[40]);
    }

    #[test]
    fn test_planar_source_rejected() {
        let mut src = SoftwareImage::new(
            2,
            2,
            ImageFormat::RgbPlanar,
            DataType::Uint8,
            Some(cpu_pool()),
        )
        .unwrap();
        src.allocate_memory().unwrap();
        let mut dst = SoftwareImage::new(
            2,
            2,
            ImageFormat::RgbPlanar,
            DataType::Uint8,
            Some(cpu_pool()),
        )
        .unwrap();
        dst.allocate_memory().unwrap();
        assert!(matches!(
            SoftwarePreprocessor::new().preprocess(&src, &mut dst, &Default::default()),
            Err(HalError::UnsupportedFormat(_))
        ));
    }
}
