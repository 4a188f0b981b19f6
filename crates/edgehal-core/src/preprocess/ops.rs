//! CPU pixel kernels behind the software preprocessor.
//!
//! All kernels work on 8-bit packed views (interleaved channels, arbitrary
//! row stride); the planar split with normalization is the final step and
//! the only one that changes the sample type.

use crate::dtype::DataType;
use crate::error::{HalError, HalResult};
use crate::preprocess::{CropRect, RescaleConfig, ResizeMethod};

/// Read-only packed 8-bit pixel view.
pub struct PackedView<'a> {
    pub data: &'a [u8],
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub channels: usize,
}

impl PackedView<'_> {
    fn sample(&self, x: usize, y: usize, c: usize) -> u8 {
        self.data[y * self.stride + x * self.channels + c]
    }
}

/// Mutable packed 8-bit pixel view.
pub struct PackedViewMut<'a> {
    pub data: &'a mut [u8],
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub channels: usize,
}

/// Warp a source region into the destination using the inverse of the
/// forward rescale mapping. Destination pixels that map outside the source
/// region (letterbox bars) are filled with `pad_value`.
pub fn warp_into(
    src: &PackedView<'_>,
    dst: &mut PackedViewMut<'_>,
    cfg: &RescaleConfig,
    crop: Option<CropRect>,
    method: ResizeMethod,
    pad_value: u8,
) -> HalResult<()> {
    if src.channels != dst.channels {
        return Err(HalError::ShapeMismatch {
            expected: format!("{} channels", src.channels),
            actual: format!("{} channels", dst.channels),
        });
    }
    if cfg.scale_x <= 0.0 || cfg.scale_y <= 0.0 {
        return Err(HalError::InvalidState(format!(
            "degenerate rescale {cfg:?}"
        )));
    }
    let (rx0, ry0, rw, rh) = match crop {
        Some(c) => (
            c.x.max(0) as f32,
            c.y.max(0) as f32,
            c.width as f32,
            c.height as f32,
        ),
        None => (0.0, 0.0, src.width as f32, src.height as f32),
    };
    let channels = dst.channels;
    for dy in 0..dst.height {
        let row = &mut dst.data[dy * dst.stride..dy * dst.stride + dst.width * channels];
        // Invert the forward mapping: dst = src * scale + offset. The
        // offset already folds in any crop origin, so this lands in
        // full-frame source coordinates; the crop only bounds the region
        // considered valid.
        let sy = (dy as f32 - cfg.offset_y) / cfg.scale_y;
        for dx in 0..dst.width {
            let sx = (dx as f32 - cfg.offset_x) / cfg.scale_x;
            let out = &mut row[dx * channels..(dx + 1) * channels];
            let inside = sx > (rx0 - 0.5).max(-0.5)
                && sx <= rx0 + rw - 0.5
                && sy > (ry0 - 0.5).max(-0.5)
                && sy <= ry0 + rh - 0.5
                && sx < src.width as f32
                && sy < src.height as f32;
            if !inside {
                out.fill(pad_value);
                continue;
            }
            match method {
                ResizeMethod::Nearest => {
                    let x = (sx.round().max(0.0) as usize).min(src.width - 1);
                    let y = (sy.round().max(0.0) as usize).min(src.height - 1);
                    for c in 0..channels {
                        out[c] = src.sample(x, y, c);
                    }
                }
                ResizeMethod::Bilinear => {
                    let fx = sx.max(0.0).min((src.width - 1) as f32);
                    let fy = sy.max(0.0).min((src.height - 1) as f32);
                    let x0 = fx.floor() as usize;
                    let y0 = fy.floor() as usize;
                    let x1 = (x0 + 1).min(src.width - 1);
                    let y1 = (y0 + 1).min(src.height - 1);
                    let tx = fx - x0 as f32;
                    let ty = fy - y0 as f32;
                    for c in 0..channels {
                        let top = src.sample(x0, y0, c) as f32 * (1.0 - tx)
                            + src.sample(x1, y0, c) as f32 * tx;
                        let bottom = src.sample(x0, y1, c) as f32 * (1.0 - tx)
                            + src.sample(x1, y1, c) as f32 * tx;
                        out[c] = (top * (1.0 - ty) + bottom * ty).round().clamp(0.0, 255.0)
                            as u8;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Swap channels 0 and 2 in place (RGB <-> BGR).
pub fn swap_rb(view: &mut PackedViewMut<'_>) {
    if view.channels < 3 {
        return;
    }
    let channels = view.channels;
    for y in 0..view.height {
        let row = &mut view.data[y * view.stride..y * view.stride + view.width * channels];
        for px in row.chunks_exact_mut(channels) {
            px.swap(0, 2);
        }
    }
}

/// Split a packed 8-bit view into planes, applying `(v - mean[c]) * scale[c]`
/// per channel and converting to the destination sample type.
///
/// `planes` are tightly packed (one `width * height` run per channel, in the
/// destination dtype).
pub fn split_scale(
    src: &PackedView<'_>,
    planes: &mut [&mut [u8]],
    dtype: DataType,
    mean: &[f32; 3],
    scale: &[f32; 3],
) -> HalResult<()> {
    if planes.len() != src.channels {
        return Err(HalError::ShapeMismatch {
            expected: format!("{} planes", src.channels),
            actual: format!("{}", planes.len()),
        });
    }
    let pix = dtype.size();
    for (c, plane) in planes.iter_mut().enumerate() {
        if plane.len() != src.width * src.height * pix {
            return Err(HalError::ShapeMismatch {
                expected: format!("{} bytes per plane", src.width * src.height * pix),
                actual: format!("{} bytes", plane.len()),
            });
        }
        for y in 0..src.height {
            for x in 0..src.width {
                let v = (src.sample(x, y, c) as f32 - mean[c]) * scale[c];
                let at = (y * src.width + x) * pix;
                match dtype {
                    DataType::Uint8 => plane[at] = v.round().clamp(0.0, 255.0) as u8,
                    DataType::Int8 => plane[at] = v.round().clamp(-128.0, 127.0) as i8 as u8,
                    DataType::Fp32 => {
                        plane[at..at + 4].copy_from_slice(&v.to_ne_bytes());
                    }
                    other => {
                        return Err(HalError::UnsupportedFormat(format!(
                            "preprocessing cannot produce {other:?} samples"
                        )))
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(data: &[u8], w: usize, h: usize) -> PackedView<'_> {
        PackedView {
            data,
            width: w,
            height: h,
            stride: w,
            channels: 1,
        }
    }

    #[test]
    fn test_identity_warp_copies_pixels() {
        let src_data: Vec<u8> = (0..16).collect();
        let src = gray(&src_data, 4, 4);
        let mut dst_data = vec![0u8; 16];
        let mut dst = PackedViewMut {
            data: &mut dst_data,
            width: 4,
            height: 4,
            stride: 4,
            channels: 1,
        };
        warp_into(
            &src,
            &mut dst,
            &RescaleConfig::identity(),
            None,
            ResizeMethod::Nearest,
            0,
        )
        .unwrap();
        assert_eq!(dst_data, src_data);
    }

    #[test]
    fn test_letterbox_pads_outside_region() {
        // 2x2 source into 4x2 with scale 1 and x offset 1: columns 0 and 3
        // are padding.
        let src_data = vec![10, 20, 30, 40];
        let src = gray(&src_data, 2, 2);
        let mut dst_data = vec![0u8; 8];
        let mut dst = PackedViewMut {
            data: &mut dst_data,
            width: 4,
            height: 2,
            stride: 4,
            channels: 1,
        };
        let cfg = RescaleConfig {
            scale_x: 1.0,
            scale_y: 1.0,
            offset_x: 1.0,
            offset_y: 0.0,
        };
        warp_into(&src, &mut dst, &cfg, None, ResizeMethod::Nearest, 255).unwrap();
        assert_eq!(dst_data, vec![255, 10, 20, 255, 255, 30, 40, 255]);
    }

    #[test]
    fn test_split_scale_int8() {
        let src_data = vec![0u8, 128, 255, 0, 128, 255];
        let src = PackedView {
            data: &src_data,
            width: 2,
            height: 1,
            stride: 6,
            channels: 3,
        };
        let mut p0 = vec![0u8; 2];
        let mut p1 = vec![0u8; 2];
        let mut p2 = vec![0u8; 2];
        let mut planes: Vec<&mut [u8]> = vec![&mut p0, &mut p1, &mut p2];
        split_scale(
            &src,
            &mut planes,
            DataType::Int8,
            &[128.0, 128.0, 128.0],
            &[1.0, 1.0, 1.0],
        )
        .unwrap();
        assert_eq!(p0, vec![(-128i8) as u8, (-128i8) as u8]);
        assert_eq!(p1, vec![0, 0]);
        assert_eq!(p2, vec![127, 127]);
    }

    #[test]
    fn test_swap_rb() {
        let mut data = vec![1u8, 2, 3, 4, 5, 6];
        let mut view = PackedViewMut {
            data: &mut data,
            width: 2,
            height: 1,
            stride: 6,
            channels: 3,
        };
        swap_rb(&mut view);
        assert_eq!(data, vec![3, 2, 1, 6, 5, 4]);
    }
}
