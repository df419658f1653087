//! Plane packing and colour conversion helpers

use crate::capture::{FrameGeometry, PixelFormat};
use crate::filter::{ResultImage, Roi};

/// Copy `rows` rows of `row_bytes` out of a strided plane into `out`,
/// dropping the row padding.
pub fn pack_plane(src: &[u8], stride: u32, row_bytes: u32, rows: u32, out: &mut Vec<u8>) {
    let (stride, row_bytes) = (stride as usize, row_bytes as usize);
    for row in 0..rows as usize {
        let start = row * stride;
        out.extend_from_slice(&src[start..start + row_bytes]);
    }
}

/// Copy both planes exactly as given, stride and any short last row
/// included, into one contiguous result.
pub fn passthrough_image(
    luma: &[u8],
    chroma: &[u8],
    geometry: FrameGeometry,
    format: PixelFormat,
) -> ResultImage {
    let mut data = Vec::with_capacity(luma.len() + chroma.len());
    data.extend_from_slice(luma);
    data.extend_from_slice(chroma);

    ResultImage {
        data,
        chroma_offset: luma.len(),
        width: geometry.width,
        height: geometry.height,
        stride: geometry.luma_stride,
        chroma_stride: geometry.chroma_stride,
        roi: Roi::full(geometry.width, geometry.height),
        format,
    }
}

/// JFIF YCbCr → RGB with fixed-point coefficients
#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as i32;
    let u = u as i32 - 128;
    let v = v as i32 - 128;

    // R = Y + 1.402 V, G = Y - 0.34414 U - 0.71414 V, B = Y + 1.772 U
    let r = y + ((v * 1436) >> 10);
    let g = y - ((u * 46549 + v * 93604) >> 17);
    let b = y + ((u * 1814) >> 10);

    [
        r.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        b.clamp(0, 255) as u8,
    ]
}

/// Convert the region of interest of a semi-planar image to packed RGB8.
///
/// Returns `None` if the region falls outside the image or the buffer is
/// too short for the declared geometry.
pub fn roi_to_rgb(image: &ResultImage, roi: Roi) -> Option<Vec<u8>> {
    if roi.width == 0
        || roi.height == 0
        || roi.x.checked_add(roi.width)? > image.width
        || roi.y.checked_add(roi.height)? > image.height
    {
        return None;
    }

    let luma = image.luma();
    let chroma = image.chroma()?;
    let (ls, cs) = (image.stride as usize, image.chroma_stride as usize);
    let (v_off, u_off) = match image.format {
        PixelFormat::Nv21 => (0, 1),
        PixelFormat::Nv12 => (1, 0),
    };

    let mut rgb = Vec::with_capacity((roi.width * roi.height * 3) as usize);
    for y in roi.y..roi.y + roi.height {
        let (y, cy) = (y as usize, (y / 2) as usize);
        for x in roi.x..roi.x + roi.width {
            let (x, cx) = (x as usize, (x as usize / 2) * 2);
            let luma_px = *luma.get(y * ls + x)?;
            let v = *chroma.get(cy * cs + cx + v_off)?;
            let u = *chroma.get(cy * cs + cx + u_off)?;
            rgb.extend_from_slice(&yuv_to_rgb(luma_px, u, v));
        }
    }
    Some(rgb)
}
