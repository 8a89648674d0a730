//! Pixel conversion into what turbojpeg takes directly
//!
//! Packed 4:2:2 goes to planar I420 so the compressor can skip its own
//! color conversion; RGB565 is expanded to RGB24.

/// Component order of a packed 4:2:2 macropixel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packed422 {
    /// Y0 U Y1 V
    Yuyv,
    /// Y0 V Y1 U
    Yvyu,
    /// U Y0 V Y1
    Uyvy,
}

impl Packed422 {
    /// Offsets of (Y0, U, Y1, V) inside a 4-byte macropixel
    #[inline]
    fn offsets(&self) -> (usize, usize, usize, usize) {
        match self {
            Packed422::Yuyv => (0, 1, 2, 3),
            Packed422::Yvyu => (0, 3, 2, 1),
            Packed422::Uyvy => (1, 0, 3, 2),
        }
    }
}

/// Size of an I420 image with odd dimensions rounded up for chroma
pub fn i420_size(width: usize, height: usize) -> usize {
    let chroma = width.div_ceil(2) * height.div_ceil(2);
    width * height + 2 * chroma
}

/// Convert packed 4:2:2 rows of `stride` bytes into I420
///
/// Chroma of two consecutive rows is averaged. `width` must be even, which
/// V4L2 guarantees for packed 4:2:2 formats.
pub fn packed422_to_i420(
    src: &[u8],
    stride: usize,
    width: usize,
    height: usize,
    order: Packed422,
    dst: &mut Vec<u8>,
) {
    let (oy0, ou, oy1, ov) = order.offsets();
    let cw = width.div_ceil(2);
    let ch = height.div_ceil(2);
    dst.resize(i420_size(width, height), 0);
    let (y_plane, chroma) = dst.split_at_mut(width * height);
    let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

    for row in 0..height {
        let line = &src[row * stride..row * stride + width * 2];
        let y_line = &mut y_plane[row * width..(row + 1) * width];
        for (px, mp) in line.chunks_exact(4).enumerate() {
            y_line[px * 2] = mp[oy0];
            y_line[px * 2 + 1] = mp[oy1];
        }
    }

    for crow in 0..ch {
        let top = crow * 2;
        let bottom = (top + 1).min(height - 1);
        let a = &src[top * stride..top * stride + width * 2];
        let b = &src[bottom * stride..bottom * stride + width * 2];
        let u_line = &mut u_plane[crow * cw..(crow + 1) * cw];
        let v_line = &mut v_plane[crow * cw..(crow + 1) * cw];
        for (cx, (ma, mb)) in a.chunks_exact(4).zip(b.chunks_exact(4)).enumerate() {
            u_line[cx] = ((ma[ou] as u16 + mb[ou] as u16 + 1) / 2) as u8;
            v_line[cx] = ((ma[ov] as u16 + mb[ov] as u16 + 1) / 2) as u8;
        }
    }
}

/// Expand little-endian RGB565 rows into tightly packed RGB24
pub fn rgb565_to_rgb24(src: &[u8], stride: usize, width: usize, height: usize, dst: &mut Vec<u8>) {
    dst.resize(width * height * 3, 0);
    for row in 0..height {
        let line = &src[row * stride..row * stride + width * 2];
        let out = &mut dst[row * width * 3..(row + 1) * width * 3];
        for (px, rgb) in line.chunks_exact(2).zip(out.chunks_exact_mut(3)) {
            let p = u16::from_le_bytes([px[0], px[1]]);
            let r = ((p >> 11) & 0x1f) as u8;
            let g = ((p >> 5) & 0x3f) as u8;
            let b = (p & 0x1f) as u8;
            rgb[0] = (r << 3) | (r >> 2);
            rgb[1] = (g << 2) | (g >> 4);
            rgb[2] = (b << 3) | (b >> 2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i420_size() {
        assert_eq!(i420_size(4, 2), 8 + 2 * 2);
        assert_eq!(i420_size(4, 3), 12 + 2 * 4);
    }

    #[test]
    fn test_yuyv_planes() {
        // 4x2, two macropixels per row, padded stride of 10
        let src = [
            10, 100, 20, 200, 30, 110, 40, 210, 0, 0, //
            50, 120, 60, 220, 70, 130, 80, 230, 0, 0,
        ];
        let mut dst = Vec::new();
        packed422_to_i420(&src, 10, 4, 2, Packed422::Yuyv, &mut dst);
        assert_eq!(&dst[..8], &[10, 20, 30, 40, 50, 60, 70, 80]);
        assert_eq!(&dst[8..10], &[110, 120]);
        assert_eq!(&dst[10..12], &[210, 220]);
    }

    #[test]
    fn test_orders_agree() {
        let yuyv = [16u8, 90, 17, 240];
        let yvyu = [16u8, 240, 17, 90];
        let uyvy = [90u8, 16, 240, 17];
        let mut a = Vec::new();
        let mut b = Vec::new();
        let mut c = Vec::new();
        packed422_to_i420(&yuyv, 4, 2, 1, Packed422::Yuyv, &mut a);
        packed422_to_i420(&yvyu, 4, 2, 1, Packed422::Yvyu, &mut b);
        packed422_to_i420(&uyvy, 4, 2, 1, Packed422::Uyvy, &mut c);
        assert_eq!(a, vec![16, 17, 90, 240]);
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_rgb565() {
        let src = 0xF800u16.to_le_bytes().into_iter()
            .chain(0x07E0u16.to_le_bytes())
            .chain(0x001Fu16.to_le_bytes())
            .chain(0xFFFFu16.to_le_bytes())
            .collect::<Vec<_>>();
        let mut dst = Vec::new();
        rgb565_to_rgb24(&src, 8, 4, 1, &mut dst);
        assert_eq!(
            dst,
            vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255]
        );
    }
}
