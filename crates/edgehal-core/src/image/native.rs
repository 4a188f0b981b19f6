//! Mapping between the portable (format, dtype) pair and the video
//! pipeline's native pixel-format enumeration.
//!
//! The table is total and fail-closed: combinations the hardware cannot
//! express map to [`NativePixelFormat::Unsupported`] instead of panicking,
//! and callers turn that into a typed error at frame-construction time.

use serde::{Deserialize, Serialize};

use crate::dtype::DataType;
use crate::image::ImageFormat;

/// Pixel formats the video pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativePixelFormat {
    Yuv400,
    Nv12,
    Nv21,
    Rgb888,
    Bgr888,
    Rgb888Planar,
    Bgr888Planar,
    Uint8C3Planar,
    Int8C3Planar,
    Fp32C3Planar,
    Unsupported,
}

impl NativePixelFormat {
    /// Map a portable (format, dtype) pair onto the native enumeration.
    pub fn from_base(format: ImageFormat, dtype: DataType) -> NativePixelFormat {
        match (format, dtype) {
            (ImageFormat::Gray, DataType::Uint8) => NativePixelFormat::Yuv400,
            (ImageFormat::Yuv420SpUv, DataType::Uint8) => NativePixelFormat::Nv12,
            (ImageFormat::Yuv420SpVu, DataType::Uint8) => NativePixelFormat::Nv21,
            (ImageFormat::RgbPacked, DataType::Uint8) => NativePixelFormat::Rgb888,
            (ImageFormat::BgrPacked, DataType::Uint8) => NativePixelFormat::Bgr888,
            (ImageFormat::RgbPlanar, DataType::Uint8) => NativePixelFormat::Rgb888Planar,
            (ImageFormat::BgrPlanar, DataType::Uint8) => NativePixelFormat::Bgr888Planar,
            (ImageFormat::RgbPlanar, DataType::Int8) => NativePixelFormat::Int8C3Planar,
            (ImageFormat::RgbPlanar, DataType::Fp32) => NativePixelFormat::Fp32C3Planar,
            _ => NativePixelFormat::Unsupported,
        }
    }

    /// Inverse mapping. `Uint8C3Planar` is channel-order agnostic on the
    /// hardware side and lands on RGB planar by convention.
    pub fn to_base(self) -> Option<(ImageFormat, DataType)> {
        match self {
            NativePixelFormat::Yuv400 => Some((ImageFormat::Gray, DataType::Uint8)),
            NativePixelFormat::Nv12 => Some((ImageFormat::Yuv420SpUv, DataType::Uint8)),
            NativePixelFormat::Nv21 => Some((ImageFormat::Yuv420SpVu, DataType::Uint8)),
            NativePixelFormat::Rgb888 => Some((ImageFormat::RgbPacked, DataType::Uint8)),
            NativePixelFormat::Bgr888 => Some((ImageFormat::BgrPacked, DataType::Uint8)),
            NativePixelFormat::Rgb888Planar => Some((ImageFormat::RgbPlanar, DataType::Uint8)),
            NativePixelFormat::Bgr888Planar => Some((ImageFormat::BgrPlanar, DataType::Uint8)),
            NativePixelFormat::Uint8C3Planar => Some((ImageFormat::RgbPlanar, DataType::Uint8)),
            NativePixelFormat::Int8C3Planar => Some((ImageFormat::RgbPlanar, DataType::Int8)),
            NativePixelFormat::Fp32C3Planar => Some((ImageFormat::RgbPlanar, DataType::Fp32)),
            NativePixelFormat::Unsupported => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::ALL_DATA_TYPES;

    #[test]
    fn test_mapping_is_total_and_fail_closed() {
        let formats = [
            ImageFormat::Gray,
            ImageFormat::RgbPacked,
            ImageFormat::BgrPacked,
            ImageFormat::RgbPlanar,
            ImageFormat::BgrPlanar,
            ImageFormat::Yuv420SpUv,
            ImageFormat::Yuv420SpVu,
            ImageFormat::Yuv420PlanarUv,
            ImageFormat::Yuv420PlanarVu,
            ImageFormat::Yuv422SpUv,
            ImageFormat::Yuv422SpVu,
            ImageFormat::Yuv422PlanarUv,
            ImageFormat::Yuv422PlanarVu,
        ];
        for format in formats {
            for dtype in ALL_DATA_TYPES {
                let native = NativePixelFormat::from_base(format, dtype);
                if let Some((back_fmt, back_dtype)) = native.to_base() {
                    // Round-trips land on the same dtype and an equivalent
                    // format (planar channel order aside).
                    assert_eq!(back_dtype, dtype);
                    assert_eq!(
                        NativePixelFormat::from_base(back_fmt, back_dtype),
                        native
                    );
                }
            }
        }
        assert_eq!(
            NativePixelFormat::from_base(ImageFormat::Yuv422PlanarUv, DataType::Uint8),
            NativePixelFormat::Unsupported
        );
        assert_eq!(
            NativePixelFormat::from_base(ImageFormat::RgbPacked, DataType::Fp32),
            NativePixelFormat::Unsupported
        );
    }

    #[test]
    fn test_uint8_c3_planar_lands_on_rgb_planar() {
        assert_eq!(
            NativePixelFormat::Uint8C3Planar.to_base(),
            Some((ImageFormat::RgbPlanar, DataType::Uint8))
        );
    }
}
