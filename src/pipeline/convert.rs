//! Device-native YUV layouts to packed I420.
//!
//! Devices hand out buffers whose rows are padded to `stride` bytes and
//! whose planes are padded to `slice_height` rows. Every read here is
//! bounds-checked against the reported buffer; a short buffer is an error,
//! never an out-of-bounds read.

use std::time::Instant;

use bytes::BytesMut;

use crate::codec::{I420Buffer, PlaneLayout};
use crate::error::ConvertError;

/// Geometry of a device output buffer, as negotiated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceGeometry {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub slice_height: usize,
}

/// Convert one output buffer to a packed [`I420Buffer`].
///
/// `src` is exactly the reported payload (offset and size already applied).
pub fn convert_to_i420(
    src: &[u8],
    geometry: SourceGeometry,
    layout: PlaneLayout,
) -> Result<I420Buffer, ConvertError> {
    let SourceGeometry { width, height, .. } = geometry;
    if width == 0 || height == 0 {
        return Err(ConvertError::ZeroDimensions { width, height });
    }

    let (w, h) = (width as usize, height as usize);
    let size = src.len();
    if size < w * h * 3 / 2 {
        return Err(ConvertError::BufferTooSmall {
            size,
            width,
            height,
        });
    }

    let mut stride = geometry.stride;
    let slice_height = geometry.slice_height;
    // Some devices report a padded stride with an unpadded buffer. Derive
    // the stride from the buffer size in that case.
    if size < stride * h * 3 / 2 && slice_height == h && stride > w {
        stride = size * 2 / (h * 3);
    }

    let started = Instant::now();
    let mut out = BytesMut::zeroed(I420Buffer::packed_len(width, height));
    let chroma_width = w.div_ceil(2);
    let chroma_height = h.div_ceil(2);
    {
        let (dst_y, chroma) = out.split_at_mut(w * h);
        let (dst_u, dst_v) = chroma.split_at_mut(chroma_width * chroma_height);

        copy_plane(src, 0, stride, dst_y, w, h)?;
        match layout {
            PlaneLayout::Planar => {
                copy_planar_chroma(src, w, h, stride, slice_height, dst_u, dst_v)?
            }
            PlaneLayout::SemiPlanar => {
                let uv_pos = stride * slice_height;
                split_uv(src, uv_pos, stride, dst_u, dst_v, chroma_width, chroma_height)?
            }
        }
    }

    metrics::histogram!("hwdec_convert_time_us").record(started.elapsed().as_micros() as f64);
    Ok(I420Buffer::from_packed_unchecked(
        width,
        height,
        out.freeze(),
    ))
}

fn copy_planar_chroma(
    src: &[u8],
    w: usize,
    h: usize,
    stride: usize,
    slice_height: usize,
    dst_u: &mut [u8],
    dst_v: &mut [u8],
) -> Result<(), ConvertError> {
    if stride % 2 != 0 {
        return Err(ConvertError::OddStride(stride));
    }

    let uv_stride = stride / 2;
    let u_pos = stride * slice_height;
    let plane_size = uv_stride * slice_height / 2;
    let v_pos = u_pos + plane_size;
    let v_end = v_pos + plane_size;

    let chroma_width = w.div_ceil(2);
    let rows = if slice_height % 2 == 0 {
        h.div_ceil(2)
    } else {
        h / 2
    };

    let u_plane = region(src, u_pos, v_pos)?;
    let v_plane = region(src, v_pos, v_end)?;
    copy_plane(u_plane, 0, uv_stride, dst_u, chroma_width, rows)?;
    copy_plane(v_plane, 0, uv_stride, dst_v, chroma_width, rows)?;

    // An odd slice height leaves the last destination chroma row without a
    // source row of its own; repeat the last one.
    if slice_height % 2 == 1 && rows < h.div_ceil(2) {
        let last = rows.saturating_sub(1) * uv_stride;
        let dst_offset = rows * chroma_width;
        for (plane, dst) in [(u_plane, &mut *dst_u), (v_plane, &mut *dst_v)] {
            let row = region(plane, last, last + chroma_width)?;
            dst[dst_offset..dst_offset + chroma_width].copy_from_slice(row);
        }
    }
    Ok(())
}

/// Copy `rows` rows of `width` bytes from `src` (starting at `offset`, rows
/// `stride` apart) into a packed destination.
fn copy_plane(
    src: &[u8],
    offset: usize,
    stride: usize,
    dst: &mut [u8],
    width: usize,
    rows: usize,
) -> Result<(), ConvertError> {
    for (row, dst_row) in dst.chunks_exact_mut(width).take(rows).enumerate() {
        let start = offset + row * stride;
        dst_row.copy_from_slice(region(src, start, start + width)?);
    }
    Ok(())
}

/// De-interleave a UV plane into separate U and V planes.
fn split_uv(
    src: &[u8],
    uv_pos: usize,
    stride: usize,
    dst_u: &mut [u8],
    dst_v: &mut [u8],
    chroma_width: usize,
    chroma_height: usize,
) -> Result<(), ConvertError> {
    let rows = dst_u
        .chunks_exact_mut(chroma_width)
        .zip(dst_v.chunks_exact_mut(chroma_width))
        .take(chroma_height);
    for (row, (u_row, v_row)) in rows.enumerate() {
        let start = uv_pos + row * stride;
        let uv = region(src, start, start + 2 * chroma_width)?;
        for ((u, v), pair) in u_row.iter_mut().zip(v_row.iter_mut()).zip(uv.chunks_exact(2)) {
            *u = pair[0];
            *v = pair[1];
        }
    }
    Ok(())
}

fn region(src: &[u8], start: usize, end: usize) -> Result<&[u8], ConvertError> {
    src.get(start..end).ok_or(ConvertError::SourceOutOfBounds {
        needed: end,
        available: src.len(),
    })
}
