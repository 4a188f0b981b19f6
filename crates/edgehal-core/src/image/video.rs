//! Video-pipeline frame backend.
//!
//! The layout here is whatever the SoC video pipeline dictates: rows are
//! aligned to the hardware stride boundary and, for three-plane planar
//! formats, each plane length is rounded up to a page so the scaler can DMA
//! plane-at-a-time. Frames either wrap hardware-owned buffers (borrowed)
//! or are allocated from a contiguous pool and described back to the
//! hardware through a [`VideoFrame`] record.

use std::any::Any;

use crate::dtype::DataType;
use crate::error::{HalError, HalResult};
use crate::image::{
    plane_addresses, Image, ImageFormat, ImageLayout, ImageMem, ImageType, NativePixelFormat,
};
use crate::memory::{MemoryBlock, Ownership, PoolBackend, SharedPool};

/// Hardware row-stride boundary for video frames.
pub const VIDEO_STRIDE_ALIGN: usize = 64;

/// Three-plane planar frames carry page-aligned plane lengths so the
/// scaler can address each plane independently.
const PLANE_LEN_PAGE_ALIGN: usize = 0x1000;

/// The frame record exchanged with the video pipeline. Plane addresses are
/// base + cumulative plane lengths; the buffer is one contiguous range.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub pixel_format: NativePixelFormat,
    pub strides: Vec<usize>,
    pub plane_lengths: Vec<usize>,
    pub phys_addr: u64,
    pub virt_addr: *mut u8,
    /// Hardware buffer-pool slot this frame came from, if any.
    pub pool_id: Option<u32>,
}

fn page_align(v: usize) -> usize {
    (v + PLANE_LEN_PAGE_ALIGN - 1) & !(PLANE_LEN_PAGE_ALIGN - 1)
}

fn video_layout(
    width: u32,
    height: u32,
    format: ImageFormat,
    dtype: DataType,
) -> HalResult<ImageLayout> {
    if NativePixelFormat::from_base(format, dtype) == NativePixelFormat::Unsupported {
        return Err(HalError::UnsupportedFormat(format!(
            "video pipeline cannot express {format:?}/{dtype:?}"
        )));
    }
    let mut layout = ImageLayout::compute(width, height, format, dtype, VIDEO_STRIDE_ALIGN)?;
    if layout.plane_count() == 3 && format.is_planar() {
        for len in layout.plane_lengths.iter_mut() {
            *len = page_align(*len);
        }
    }
    Ok(layout)
}

pub struct VideoFrameImage {
    layout: ImageLayout,
    mem: ImageMem,
    frame: Option<VideoFrame>,
}

impl VideoFrameImage {
    pub fn new(
        width: u32,
        height: u32,
        format: ImageFormat,
        dtype: DataType,
        pool: Option<SharedPool>,
    ) -> HalResult<VideoFrameImage> {
        let layout = video_layout(width, height, format, dtype)?;
        Ok(VideoFrameImage {
            layout,
            mem: ImageMem { pool, block: None },
            frame: None,
        })
    }

    /// Wrap a frame the video pipeline produced. `ownership` says whether
    /// this image should release the buffer when freed; frames still held
    /// by the pipeline are wrapped [`Ownership::Borrowed`].
    pub fn wrap(frame: VideoFrame, ownership: Ownership) -> HalResult<VideoFrameImage> {
        let (format, dtype) = frame
            .pixel_format
            .to_base()
            .ok_or_else(|| {
                HalError::UnsupportedFormat(format!(
                    "cannot wrap a frame with pixel format {:?}",
                    frame.pixel_format
                ))
            })?;
        let mut layout = video_layout(frame.width, frame.height, format, dtype)?;
        // The producing hardware is authoritative for geometry.
        layout.strides = frame.strides.clone();
        layout.plane_lengths = frame.plane_lengths.clone();
        let total = layout.byte_size();
        let mut block = match ownership {
            Ownership::Borrowed => {
                MemoryBlock::borrowed(PoolBackend::Contig, frame.virt_addr, frame.phys_addr, total)
            }
            Ownership::Owned => {
                return Err(HalError::InvalidState(
                    "wrapping an owned frame requires the pool that allocated it".into(),
                ))
            }
        };
        if let Some(id) = frame.pool_id {
            block.set_pool_id(id);
        }
        Ok(VideoFrameImage {
            layout,
            mem: ImageMem {
                pool: None,
                block: Some(block),
            },
            frame: Some(frame),
        })
    }

    /// The frame record describing the current memory, for handing to the
    /// video pipeline.
    pub fn frame(&self) -> Option<&VideoFrame> {
        self.frame.as_ref()
    }

    fn rebuild_frame(&mut self) -> HalResult<()> {
        let block = self
            .mem
            .block
            .as_ref()
            .ok_or_else(|| HalError::InvalidState("image memory not set up".into()))?;
        self.frame = Some(VideoFrame {
            width: self.layout.width,
            height: self.layout.height,
            pixel_format: NativePixelFormat::from_base(self.layout.format, self.layout.dtype),
            strides: self.layout.strides.clone(),
            plane_lengths: self.layout.plane_lengths.clone(),
            phys_addr: block.phys_addr(),
            virt_addr: block.virt_addr(),
            pool_id: block.pool_id(),
        });
        Ok(())
    }
}

impl Image for VideoFrameImage {
    fn image_type(&self) -> ImageType {
        ImageType::VideoFrame
    }

    fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    fn prepare_image_info(
        &mut self,
        width: u32,
        height: u32,
        format: ImageFormat,
        dtype: DataType,
    ) -> HalResult<()> {
        if self.mem.block.is_some() {
            return Err(HalError::AlreadyInitialized(
                "cannot change geometry while memory is attached".into(),
            ));
        }
        self.layout = video_layout(width, height, format, dtype)?;
        self.frame = None;
        Ok(())
    }

    fn set_pool(&mut self, pool: SharedPool) {
        self.mem.pool = Some(pool);
    }

    fn allocate_memory(&mut self) -> HalResult<()> {
        let block = self.mem.allocate(self.layout.byte_size())?;
        self.mem.block = Some(block);
        self.rebuild_frame()
    }

    fn free_memory(&mut self) -> HalResult<()> {
        self.mem.free()?;
        self.frame = None;
        Ok(())
    }

    fn setup_memory_block(&mut self, block: MemoryBlock) -> HalResult<()> {
        self.mem.adopt(block, self.layout.byte_size())?;
        self.rebuild_frame()
    }

    fn memory_block(&self) -> Option<&MemoryBlock> {
        self.mem.block.as_ref()
    }

    fn flush_cache(&self) -> HalResult<()> {
        self.mem.flush()
    }

    fn invalidate_cache(&self) -> HalResult<()> {
        if self.mem.pool.is_none() {
            // Wrapped pipeline frames have no pool handle; the producer
            // already synchronized the range before handing the frame over.
            return Ok(());
        }
        self.mem.invalidate()
    }

    fn copy_from_buffer(&mut self, data: &[u8]) -> HalResult<()> {
        let expected = self.layout.byte_size();
        if data.len() != expected {
            return Err(HalError::ShapeMismatch {
                expected: format!("{expected} bytes"),
                actual: format!("{} bytes", data.len()),
            });
        }
        let block = self
            .mem
            .block
            .as_mut()
            .ok_or_else(|| HalError::InvalidState("image memory not set up".into()))?;
        block.as_mut_slice()?.copy_from_slice(data);
        self.flush_cache()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl VideoFrameImage {
    /// Per-plane physical addresses as the hardware record reports them.
    pub fn plane_physical_addresses(&self) -> HalResult<Vec<u64>> {
        let block = self
            .mem
            .block
            .as_ref()
            .ok_or_else(|| HalError::InvalidState("image memory not set up".into()))?;
        Ok(plane_addresses(block, &self.layout.plane_lengths)?.1)
    }
}
