use crate::core::PixelFormat;

/// 把解码输出转换为 RGBA，并从 `decoded` 尺寸裁剪到 `display` 尺寸
///
/// 数据长度不足一帧时返回 None。YUV 按 BT.601 有限范围换算。
pub fn to_rgba(
    format: PixelFormat,
    data: &[u8],
    decoded_width: usize,
    decoded_height: usize,
    display_width: usize,
    display_height: usize,
) -> Option<Vec<u8>> {
    if data.len() < format.frame_size(decoded_width, decoded_height) {
        return None;
    }
    let width = display_width.min(decoded_width);
    let height = display_height.min(decoded_height);
    let mut out = Vec::with_capacity(width * height * 4);

    match format {
        PixelFormat::RGBA => {
            for y in 0..height {
                let row = y * decoded_width * 4;
                out.extend_from_slice(&data[row..row + width * 4]);
            }
        }
        PixelFormat::RGB => {
            for y in 0..height {
                let row = y * decoded_width * 3;
                for px in data[row..row + width * 3].chunks_exact(3) {
                    out.extend_from_slice(&[px[0], px[1], px[2], 255]);
                }
            }
        }
        PixelFormat::YUV420P => {
            let chroma_width = decoded_width.div_ceil(2);
            let chroma_size = chroma_width * decoded_height.div_ceil(2);
            let luma_size = decoded_width * decoded_height;
            let (u_plane, v_plane) = data[luma_size..].split_at(chroma_size);
            for y in 0..height {
                for x in 0..width {
                    let luma = data[y * decoded_width + x];
                    let c = (y / 2) * chroma_width + x / 2;
                    out.extend_from_slice(&yuv_to_rgba(luma, u_plane[c], v_plane[c]));
                }
            }
        }
        PixelFormat::NV12 => {
            let chroma_stride = decoded_width.div_ceil(2) * 2;
            let uv_plane = &data[decoded_width * decoded_height..];
            for y in 0..height {
                for x in 0..width {
                    let luma = data[y * decoded_width + x];
                    let c = (y / 2) * chroma_stride + (x / 2) * 2;
                    out.extend_from_slice(&yuv_to_rgba(luma, uv_plane[c], uv_plane[c + 1]));
                }
            }
        }
    }

    Some(out)
}

fn yuv_to_rgba(y: u8, u: u8, v: u8) -> [u8; 4] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
        255,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgba_crop() {
        // 3x2 解码尺寸，显示 2x1
        let data: Vec<u8> = (0..24).collect();
        let out = to_rgba(PixelFormat::RGBA, &data, 3, 2, 2, 1).unwrap();
        assert_eq!(out, (0..8).collect::<Vec<u8>>());
    }

    #[test]
    fn test_rgb_expands_alpha() {
        let out = to_rgba(PixelFormat::RGB, &[1, 2, 3, 4, 5, 6], 2, 1, 2, 1).unwrap();
        assert_eq!(out, vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn test_yuv_black_and_white() {
        // 2x2：一个色度样本，中性色度
        let black = [16, 16, 16, 16, 128, 128];
        let out = to_rgba(PixelFormat::YUV420P, &black, 2, 2, 2, 2).unwrap();
        assert_eq!(&out[..4], &[0, 0, 0, 255]);

        let white = [235, 235, 235, 235, 128, 128];
        let out = to_rgba(PixelFormat::NV12, &white, 2, 2, 2, 2).unwrap();
        assert_eq!(&out[..4], &[255, 255, 255, 255]);
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(to_rgba(PixelFormat::RGBA, &[0; 15], 2, 2, 2, 2).is_none());
    }
}
