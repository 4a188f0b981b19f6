//! Image abstraction: pixel formats, plane/stride layout and the three
//! frame backends.
//!
//! The backends differ in *which object owns the pixel layout*:
//!
//! - [`software::SoftwareImage`] — layout recomputed from width/height/
//!   format/dtype with no external constraint; also supports non-owning
//!   views over memory somebody else provided.
//! - [`video::VideoFrameImage`] — layout dictated by the SoC video
//!   pipeline; formats map onto the native pixel-format enumeration
//!   through a total, fail-closed table.
//! - [`accel::AcceleratorImage`] — layout dictated by the accelerator
//!   vendor's own image descriptor, which is authoritative for geometry.
//!
//! Per-plane addresses are always derived from the single base address plus
//! cumulative plane lengths, recomputed whenever memory is (re)attached.

pub mod accel;
pub mod native;
pub mod software;
pub mod video;

use std::any::Any;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dtype::DataType;
use crate::error::{HalError, HalResult};
use crate::memory::{lock_pool, MemoryBlock, SharedPool};

pub use accel::{AcceleratorImage, NativeImageDesc};
pub use native::NativePixelFormat;
pub use software::SoftwareImage;
pub use video::{VideoFrame, VideoFrameImage};

/// Pixel arrangement of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Gray,
    RgbPacked,
    BgrPacked,
    RgbPlanar,
    BgrPlanar,
    /// Semi-planar 4:2:0, chroma interleaved U-then-V (NV12 family).
    Yuv420SpUv,
    /// Semi-planar 4:2:0, chroma interleaved V-then-U (NV21 family).
    Yuv420SpVu,
    Yuv420PlanarUv,
    Yuv420PlanarVu,
    Yuv422SpUv,
    Yuv422SpVu,
    Yuv422PlanarUv,
    Yuv422PlanarVu,
}

impl ImageFormat {
    /// True for formats whose color components occupy separate planes.
    pub fn is_planar(self) -> bool {
        matches!(
            self,
            ImageFormat::RgbPlanar | ImageFormat::BgrPlanar | ImageFormat::Gray
        )
    }

    /// Channels carried by plane 0 of a packed layout.
    pub fn packed_channels(self) -> usize {
        match self {
            ImageFormat::RgbPacked | ImageFormat::BgrPacked => 3,
            _ => 1,
        }
    }
}

/// Which backend (and therefore which native object) an image wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    /// Software image, layout computed locally.
    Software,
    /// Hardware video-pipeline frame.
    VideoFrame,
    /// Accelerator-native image descriptor.
    Accelerator,
    /// Single-plane raw buffer (feature/audio frames).
    Raw,
    /// Non-owning view aliasing one batch slot of a tensor.
    TensorView,
}

/// Computed plane/stride geometry for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub dtype: DataType,
    pub strides: Vec<usize>,
    pub plane_lengths: Vec<usize>,
}

fn align_up(v: usize, align: usize) -> usize {
    if align <= 1 {
        v
    } else {
        (v + align - 1) & !(align - 1)
    }
}

impl ImageLayout {
    /// Compute plane count, strides and plane lengths for a geometry.
    ///
    /// `row_align` is the hardware row-alignment boundary (1 for software
    /// images). Allocates nothing.
    pub fn compute(
        width: u32,
        height: u32,
        format: ImageFormat,
        dtype: DataType,
        row_align: usize,
    ) -> HalResult<ImageLayout> {
        if width == 0 || height == 0 {
            return Err(HalError::UnsupportedFormat(format!(
                "zero image dimension {width}x{height}"
            )));
        }
        // Chroma subsampling halves a dimension; odd geometry would
        // truncate the chroma planes short.
        let needs_even_width = matches!(
            format,
            ImageFormat::Yuv420SpUv
                | ImageFormat::Yuv420SpVu
                | ImageFormat::Yuv420PlanarUv
                | ImageFormat::Yuv420PlanarVu
                | ImageFormat::Yuv422SpUv
                | ImageFormat::Yuv422SpVu
                | ImageFormat::Yuv422PlanarUv
                | ImageFormat::Yuv422PlanarVu
        );
        let needs_even_height = matches!(
            format,
            ImageFormat::Yuv420SpUv
                | ImageFormat::Yuv420SpVu
                | ImageFormat::Yuv420PlanarUv
                | ImageFormat::Yuv420PlanarVu
        );
        if (needs_even_width && width % 2 != 0) || (needs_even_height && height % 2 != 0) {
            return Err(HalError::UnsupportedFormat(format!(
                "{format:?} requires even subsampled dimensions, got {width}x{height}"
            )));
        }
        let w = width as usize;
        let h = height as usize;
        let pix = dtype.size();
        let (strides, plane_lengths): (Vec<usize>, Vec<usize>) = match format {
            ImageFormat::Gray => {
                let s = align_up(w * pix, row_align);
                (vec![s], vec![s * h])
            }
            ImageFormat::RgbPacked | ImageFormat::BgrPacked => {
                let s = align_up(w * pix * 3, row_align);
                (vec![s], vec![s * h])
            }
            ImageFormat::RgbPlanar | ImageFormat::BgrPlanar => {
                let s = align_up(w * pix, row_align);
                (vec![s; 3], vec![s * h; 3])
            }
            ImageFormat::Yuv420SpUv | ImageFormat::Yuv420SpVu => {
                if pix != 1 {
                    return Err(HalError::UnsupportedFormat(format!(
                        "{format:?} requires 8-bit samples, got {dtype:?}"
                    )));
                }
                let s = align_up(w, row_align);
                (vec![s, s], vec![s * h, s * h / 2])
            }
            ImageFormat::Yuv420PlanarUv | ImageFormat::Yuv420PlanarVu => {
                if pix != 1 {
                    return Err(HalError::UnsupportedFormat(format!(
                        "{format:?} requires 8-bit samples, got {dtype:?}"
                    )));
                }
                let s0 = align_up(w, row_align);
                let sc = align_up(w.div_ceil(2), row_align);
                (vec![s0, sc, sc], vec![s0 * h, sc * h / 2, sc * h / 2])
            }
            ImageFormat::Yuv422SpUv | ImageFormat::Yuv422SpVu => {
                if pix != 1 {
                    return Err(HalError::UnsupportedFormat(format!(
                        "{format:?} requires 8-bit samples, got {dtype:?}"
                    )));
                }
                let s = align_up(w, row_align);
                (vec![s, s], vec![s * h, s * h])
            }
            ImageFormat::Yuv422PlanarUv | ImageFormat::Yuv422PlanarVu => {
                if pix != 1 {
                    return Err(HalError::UnsupportedFormat(format!(
                        "{format:?} requires 8-bit samples, got {dtype:?}"
                    )));
                }
                let s0 = align_up(w, row_align);
                let sc = align_up(w.div_ceil(2), row_align);
                (vec![s0, sc, sc], vec![s0 * h, sc * h, sc * h])
            }
        };
        Ok(ImageLayout {
            width,
            height,
            format,
            dtype,
            strides,
            plane_lengths,
        })
    }

    pub fn plane_count(&self) -> usize {
        self.plane_lengths.len()
    }

    /// Total backing size: the sum of the plane lengths, by definition.
    pub fn byte_size(&self) -> usize {
        self.plane_lengths.iter().sum()
    }

    /// Tightly packed row size of plane 0 (no alignment padding).
    pub fn packed_row_bytes(&self) -> usize {
        self.width as usize * self.dtype.size() * self.format.packed_channels()
    }
}

/// Derive per-plane virtual/physical addresses from one base block.
///
/// Plane N starts at base + Σ plane_lengths[0..N]. This is recomputed on
/// every call so it can never go stale after a `setup_memory_block`.
pub(crate) fn plane_addresses(
    block: &MemoryBlock,
    plane_lengths: &[usize],
) -> HalResult<(Vec<*mut u8>, Vec<u64>)> {
    let base_virt = block.virt_addr();
    if base_virt.is_null() {
        return Err(HalError::InvalidState("image memory not set up".into()));
    }
    let base_phys = block.phys_addr();
    let mut virts = Vec::with_capacity(plane_lengths.len());
    let mut physes = Vec::with_capacity(plane_lengths.len());
    let mut offset = 0usize;
    for &len in plane_lengths {
        // Safety: offsets stay inside the block; adopters validated size.
        virts.push(unsafe { base_virt.add(offset) });
        physes.push(if base_phys == 0 {
            0
        } else {
            base_phys + offset as u64
        });
        offset += len;
    }
    Ok((virts, physes))
}

/// Pool/block state shared by every image backend.
#[derive(Default)]
pub(crate) struct ImageMem {
    pub pool: Option<SharedPool>,
    pub block: Option<MemoryBlock>,
}

impl ImageMem {
    pub fn allocate(&mut self, byte_size: usize) -> HalResult<MemoryBlock> {
        if byte_size == 0 {
            return Err(HalError::InvalidState("image layout not prepared".into()));
        }
        if self.block.is_some() {
            return Err(HalError::AlreadyInitialized(
                "image memory block already attached".into(),
            ));
        }
        let pool = self.pool.as_ref().ok_or(HalError::PoolUnattached)?;
        lock_pool(pool)?.allocate(byte_size, 0)
    }

    pub fn adopt(&mut self, block: MemoryBlock, expected_size: usize) -> HalResult<()> {
        if self.block.is_some() {
            return Err(HalError::AlreadyInitialized(
                "image memory block already attached".into(),
            ));
        }
        if block.size() != expected_size {
            return Err(HalError::ShapeMismatch {
                expected: format!("{expected_size} bytes"),
                actual: format!("{} bytes", block.size()),
            });
        }
        self.block = Some(block);
        Ok(())
    }

    pub fn free(&mut self) -> HalResult<()> {
        let mut block = self
            .block
            .take()
            .ok_or_else(|| HalError::InvalidState("image has no memory block".into()))?;
        if block.is_owned() {
            let pool = self.pool.as_ref().ok_or(HalError::PoolUnattached)?;
            lock_pool(pool)?.release(&mut block)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> HalResult<()> {
        let block = self
            .block
            .as_ref()
            .ok_or_else(|| HalError::InvalidState("image has no memory block".into()))?;
        let pool = self.pool.as_ref().ok_or(HalError::PoolUnattached)?;
        lock_pool(pool)?.flush_cache(block)
    }

    pub fn invalidate(&self) -> HalResult<()> {
        let block = self
            .block
            .as_ref()
            .ok_or_else(|| HalError::InvalidState("image has no memory block".into()))?;
        let pool = self.pool.as_ref().ok_or(HalError::PoolUnattached)?;
        lock_pool(pool)?.invalidate_cache(block)
    }
}

impl Drop for ImageMem {
    fn drop(&mut self) {
        if let Some(block) = self.block.as_mut() {
            if block.is_owned() {
                match self.pool.as_ref() {
                    Some(pool) => {
                        if let Ok(mut guard) = lock_pool(pool) {
                            let _ = guard.release(block);
                        }
                    }
                    None => log::error!("owned image block dropped without a pool to release it"),
                }
            }
        }
    }
}

/// Common contract for the image backends.
pub trait Image {
    fn image_type(&self) -> ImageType;

    fn layout(&self) -> &ImageLayout;

    /// Recompute layout for a new geometry. Allocates no memory.
    fn prepare_image_info(
        &mut self,
        width: u32,
        height: u32,
        format: ImageFormat,
        dtype: DataType,
    ) -> HalResult<()>;

    /// Attach a pool for later allocation.
    fn set_pool(&mut self, pool: SharedPool);

    /// Allocate backing memory from the attached pool.
    fn allocate_memory(&mut self) -> HalResult<()>;

    /// Release the backing memory (owned blocks only).
    fn free_memory(&mut self) -> HalResult<()>;

    /// Adopt caller-supplied memory. Fails if the supplied length does not
    /// equal the image's computed byte size.
    fn setup_memory_block(&mut self, block: MemoryBlock) -> HalResult<()>;

    fn memory_block(&self) -> Option<&MemoryBlock>;

    fn is_initialized(&self) -> bool {
        self.memory_block().is_some()
    }

    /// Whether plane 0's stride equals the tightly packed row size. Fast
    /// paths that assume no padding must check this.
    fn is_aligned(&self) -> bool {
        self.layout().strides[0] == self.layout().packed_row_bytes()
    }

    fn width(&self) -> u32 {
        self.layout().width
    }

    fn height(&self) -> u32 {
        self.layout().height
    }

    fn format(&self) -> ImageFormat {
        self.layout().format
    }

    fn dtype(&self) -> DataType {
        self.layout().dtype
    }

    fn plane_count(&self) -> usize {
        self.layout().plane_count()
    }

    fn byte_size(&self) -> usize {
        self.layout().byte_size()
    }

    /// Per-plane CPU addresses, derived from the base block.
    fn virtual_address(&self) -> HalResult<Vec<*mut u8>> {
        let block = self
            .memory_block()
            .ok_or_else(|| HalError::InvalidState("image memory not set up".into()))?;
        Ok(plane_addresses(block, &self.layout().plane_lengths)?.0)
    }

    /// Per-plane physical/device addresses, derived from the base block.
    fn physical_address(&self) -> HalResult<Vec<u64>> {
        let block = self
            .memory_block()
            .ok_or_else(|| HalError::InvalidState("image memory not set up".into()))?;
        Ok(plane_addresses(block, &self.layout().plane_lengths)?.1)
    }

    fn flush_cache(&self) -> HalResult<()>;

    fn invalidate_cache(&self) -> HalResult<()>;

    /// Copy a full-size pixel buffer in, then flush so hardware sees it.
    fn copy_from_buffer(&mut self, data: &[u8]) -> HalResult<()>;

    /// Checked downcast support.
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Fill an image with random bytes and flush. Test/bring-up helper.
pub fn random_fill(image: &mut dyn Image) -> HalResult<()> {
    let size = image.byte_size();
    let base = image.virtual_address()?[0];
    // Safety: plane 0 base points at `byte_size` contiguous bytes.
    let buf = unsafe { std::slice::from_raw_parts_mut(base, size) };
    // Small xorshift; no RNG dependency needed for scribbling test pixels.
    let mut state: u32 = 0x9E37_79B9;
    for b in buf.iter_mut() {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        *b = (state & 0xFF) as u8;
    }
    image.flush_cache()
}

/// Decode an image file into a packed 8-bit software image.
///
/// `use_rgb` selects RGB channel order; the default order is BGR, matching
/// what the detection models in this SDK family are trained on.
pub fn read_image(path: &Path, use_rgb: bool, pool: SharedPool) -> HalResult<SoftwareImage> {
    let decoded = image::open(path)
        .map_err(|e| HalError::Codec(format!("decode {}: {e}", path.display())))?
        .to_rgb8();
    let (w, h) = decoded.dimensions();
    let format = if use_rgb {
        ImageFormat::RgbPacked
    } else {
        ImageFormat::BgrPacked
    };
    let mut img = SoftwareImage::new(w, h, format, DataType::Uint8, Some(pool))?;
    img.allocate_memory()?;
    let row = img.layout().packed_row_bytes();
    {
        let stride = img.layout().strides[0];
        let base = img.virtual_address()?[0];
        for y in 0..h as usize {
            // Safety: stride * height bytes are backed by the allocation.
            let dst = unsafe { std::slice::from_raw_parts_mut(base.add(y * stride), row) };
            for x in 0..w as usize {
                let px = decoded.get_pixel(x as u32, y as u32);
                let (c0, c1, c2) = if use_rgb {
                    (px[0], px[1], px[2])
                } else {
                    (px[2], px[1], px[0])
                };
                dst[x * 3] = c0;
                dst[x * 3 + 1] = c1;
                dst[x * 3 + 2] = c2;
            }
        }
    }
    img.flush_cache()?;
    Ok(img)
}

/// Encode an image to a file.
///
/// Invalidates cache first so CPU reads observe hardware-written pixels,
/// and rebuilds a contiguous non-padded buffer when the stride carries
/// alignment padding.
pub fn write_image(path: &Path, img: &dyn Image) -> HalResult<()> {
    img.invalidate_cache()?;
    let layout = img.layout();
    if layout.dtype != DataType::Uint8 {
        return Err(HalError::UnsupportedFormat(format!(
            "write_image supports 8-bit images, got {:?}",
            layout.dtype
        )));
    }
    let w = layout.width;
    let h = layout.height;
    let virts = img.virtual_address()?;
    let mut rgb = vec![0u8; (w * h * 3) as usize];
    match layout.format {
        ImageFormat::RgbPacked | ImageFormat::BgrPacked => {
            let stride = layout.strides[0];
            let swap = layout.format == ImageFormat::BgrPacked;
            for y in 0..h as usize {
                // Safety: each row has `stride` valid bytes.
                let src =
                    unsafe { std::slice::from_raw_parts(virts[0].add(y * stride), w as usize * 3) };
                let dst = &mut rgb[y * w as usize * 3..][..w as usize * 3];
                for x in 0..w as usize {
                    let (r, g, b) = if swap {
                        (src[x * 3 + 2], src[x * 3 + 1], src[x * 3])
                    } else {
                        (src[x * 3], src[x * 3 + 1], src[x * 3 + 2])
                    };
                    dst[x * 3] = r;
                    dst[x * 3 + 1] = g;
                    dst[x * 3 + 2] = b;
                }
            }
        }
        ImageFormat::RgbPlanar | ImageFormat::BgrPlanar => {
            let stride = layout.strides[0];
            let order: [usize; 3] = if layout.format == ImageFormat::BgrPlanar {
                [2, 1, 0]
            } else {
                [0, 1, 2]
            };
            for (c, &plane) in order.iter().enumerate() {
                for y in 0..h as usize {
                    // Safety: plane rows carry `stride` valid bytes.
                    let src = unsafe {
                        std::slice::from_raw_parts(virts[plane].add(y * stride), w as usize)
                    };
                    for x in 0..w as usize {
                        rgb[(y * w as usize + x) * 3 + c] = src[x];
                    }
                }
            }
        }
        ImageFormat::Gray => {
            let stride = layout.strides[0];
            for y in 0..h as usize {
                // Safety: each row has `stride` valid bytes.
                let src = unsafe { std::slice::from_raw_parts(virts[0].add(y * stride), w as usize) };
                for x in 0..w as usize {
                    let v = src[x];
                    let dst = &mut rgb[(y * w as usize + x) * 3..][..3];
                    dst.copy_from_slice(&[v, v, v]);
                }
            }
        }
        other => {
            return Err(HalError::UnsupportedFormat(format!(
                "write_image does not support {other:?}"
            )))
        }
    }
    let buf: image::RgbImage = image::ImageBuffer::from_raw(w, h, rgb)
        .ok_or_else(|| HalError::Codec("image buffer construction failed".into()))?;
    buf.save(path)
        .map_err(|e| HalError::Codec(format!("encode {}: {e}", path.display())))
}
