//! Pixel layout conversion for the software encode path.
//!
//! Hardware pipelines convert inside GStreamer; this module covers the
//! case where a consumer needs planar input from a packed capture without
//! a pipeline in between. Conversion never touches the PTS.

use stream_capture::{PixelLayout, RawVideoFrame};

use crate::error::EncodeError;

/// BT.601 full-range RGB→YUV coefficients, fixed-point (x256).
const KR: i32 = 66;
const KG: i32 = 129;
const KB: i32 = 25;
const UR: i32 = -38;
const UG: i32 = -74;
const UB: i32 = 112;
const VR: i32 = 112;
const VG: i32 = -94;
const VB: i32 = -18;

/// Convert a packed BGRA/RGBA frame to planar I420.
///
/// Output stride is the width; odd dimensions are handled by clamping the
/// chroma taps to the frame edge. The returned frame keeps the input PTS
/// and keyframe hint.
pub fn to_i420(frame: &RawVideoFrame) -> Result<RawVideoFrame, EncodeError> {
    let (r_off, b_off) = match frame.layout {
        PixelLayout::Bgra => (2usize, 0usize),
        PixelLayout::Rgba => (0usize, 2usize),
        PixelLayout::I420 => return Ok(frame.clone()),
        PixelLayout::Nv12 => {
            return Err(EncodeError::InvalidArgument(
                "NV12 to I420 repacking is not supported".into(),
            ))
        }
    };

    frame
        .validate()
        .map_err(|e| EncodeError::InvalidArgument(e.to_string()))?;

    let w = frame.width as usize;
    let h = frame.height as usize;
    let stride = frame.stride as usize;
    let chroma_w = w.div_ceil(2);
    let chroma_h = h.div_ceil(2);

    let mut out = vec![0u8; w * h + 2 * chroma_w * chroma_h];
    let (y_plane, uv) = out.split_at_mut(w * h);
    let (u_plane, v_plane) = uv.split_at_mut(chroma_w * chroma_h);

    for row in 0..h {
        for col in 0..w {
            let src = row * stride + col * 4;
            let r = i32::from(frame.data[src + r_off]);
            let g = i32::from(frame.data[src + 1]);
            let b = i32::from(frame.data[src + b_off]);

            let y = (KR * r + KG * g + KB * b + 128) >> 8;
            y_plane[row * w + col] = (y + 16).clamp(0, 255) as u8;

            if row % 2 == 0 && col % 2 == 0 {
                let u = (UR * r + UG * g + UB * b + 128) >> 8;
                let v = (VR * r + VG * g + VB * b + 128) >> 8;
                let idx = (row / 2) * chroma_w + col / 2;
                u_plane[idx] = (u + 128).clamp(0, 255) as u8;
                v_plane[idx] = (v + 128).clamp(0, 255) as u8;
            }
        }
    }

    Ok(RawVideoFrame {
        data: out,
        width: frame.width,
        height: frame.height,
        stride: frame.width,
        layout: PixelLayout::I420,
        pts_us: frame.pts_us,
        keyframe_hint: frame.keyframe_hint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(layout: PixelLayout, pixel: [u8; 4], w: u32, h: u32) -> RawVideoFrame {
        let mut data = Vec::with_capacity((w * h * 4) as usize);
        for _ in 0..w * h {
            data.extend_from_slice(&pixel);
        }
        RawVideoFrame {
            data,
            width: w,
            height: h,
            stride: w * 4,
            layout,
            pts_us: 777,
            keyframe_hint: true,
        }
    }

    #[test]
    fn black_converts_to_luma_floor() {
        let out = to_i420(&frame(PixelLayout::Bgra, [0, 0, 0, 255], 4, 4)).unwrap();
        assert_eq!(out.layout, PixelLayout::I420);
        assert_eq!(out.data.len(), 16 + 4 + 4);
        assert_eq!(out.data[0], 16);
        // Chroma neutral.
        assert_eq!(out.data[16], 128);
        assert_eq!(out.data[20], 128);
    }

    #[test]
    fn white_converts_to_luma_ceiling() {
        let out = to_i420(&frame(PixelLayout::Bgra, [255, 255, 255, 255], 2, 2)).unwrap();
        assert!(out.data[0] >= 234, "luma {} too low for white", out.data[0]);
    }

    #[test]
    fn pts_is_preserved() {
        let out = to_i420(&frame(PixelLayout::Rgba, [10, 20, 30, 255], 2, 2)).unwrap();
        assert_eq!(out.pts_us, 777);
        assert!(out.keyframe_hint);
    }

    #[test]
    fn odd_dimensions_round_chroma_up() {
        let out = to_i420(&frame(PixelLayout::Bgra, [0, 0, 0, 255], 3, 3)).unwrap();
        // 9 luma + 2x2 U + 2x2 V.
        assert_eq!(out.data.len(), 9 + 4 + 4);
    }

    #[test]
    fn red_channel_lands_in_v() {
        let bgra = to_i420(&frame(PixelLayout::Bgra, [0, 0, 200, 255], 2, 2)).unwrap();
        let rgba = to_i420(&frame(PixelLayout::Rgba, [200, 0, 0, 255], 2, 2)).unwrap();
        // Same red pixel through both layouts must agree.
        assert_eq!(bgra.data, rgba.data);
        // Layout: 4 luma, 1 U, 1 V. V is well above neutral for red.
        let v = bgra.data[5];
        assert!(v > 128, "expected V > 128 for red, got {v}");
    }
}
