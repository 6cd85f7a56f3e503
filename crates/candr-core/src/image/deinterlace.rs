//! Scanline de-interlacing.
//!
//! Devices transmit color bytes, gray bytes and duplex sides in a
//! handful of scrambled orders. Each function here untangles one
//! scheme for one scanline (or block) and nothing else, so every
//! scheme is testable against a synthetic line.

use super::{ColorInterlace, DuplexInterlace, GrayInterlace};

/// De-interlace one gray scanline of `bpl` bytes.
pub fn gray_line(buf: &[u8], scheme: GrayInterlace) -> Vec<u8> {
    let bpl = buf.len();
    let mut line = Vec::with_capacity(bpl);

    match scheme {
        GrayInterlace::None => line.extend_from_slice(buf),

        // line arrives back-to-front
        GrayInterlace::Reversed => {
            line.extend(buf.iter().rev());
        }

        // three read heads, one byte each per group of three; heads
        // cover unequal spans and the tail 1/12 of the line is padding
        GrayInterlace::ThreeHead => {
            let mut j = bpl as isize - 1;
            while j >= 0 {
                line.push(buf[j as usize]);
                j -= 3;
            }
            let mut j = (bpl * 3 / 4) as isize - 3;
            while j >= 0 {
                line.push(buf[j as usize]);
                j -= 3;
            }
            let mut j = bpl as isize - 2;
            while j >= 0 {
                line.push(buf[j as usize]);
                j -= 3;
            }
            line.resize(bpl, 0);
        }
    }

    line
}

/// De-interlace one color scanline of `pwidth` pixels into rgb order.
pub fn color_line(buf: &[u8], pwidth: usize, scheme: ColorInterlace) -> Vec<u8> {
    let bpl = buf.len();
    let mut line = Vec::with_capacity(bpl);

    match scheme {
        ColorInterlace::Rgb => line.extend_from_slice(buf),

        ColorInterlace::Bgr => {
            for j in 0..pwidth {
                line.push(buf[j * 3 + 2]);
                line.push(buf[j * 3 + 1]);
                line.push(buf[j * 3]);
            }
        }

        ColorInterlace::Gbr => {
            for j in 0..pwidth {
                line.push(buf[j * 3 + 2]);
                line.push(buf[j * 3]);
                line.push(buf[j * 3 + 1]);
            }
        }

        ColorInterlace::Brg => {
            for j in 0..pwidth {
                line.push(buf[j * 3 + 1]);
                line.push(buf[j * 3 + 2]);
                line.push(buf[j * 3]);
            }
        }

        // all red, all green, all blue
        ColorInterlace::Planar => {
            for j in 0..pwidth {
                line.push(buf[j]);
                line.push(buf[pwidth + j]);
                line.push(buf[2 * pwidth + j]);
            }
        }

        // planes with their pixels back-to-front
        ColorInterlace::PlanarReversed => {
            for j in (0..pwidth).rev() {
                line.push(buf[j]);
                line.push(buf[pwidth + j]);
                line.push(buf[2 * pwidth + j]);
            }
        }

        // planes from three read heads, each plane in three-head
        // order; tail 1/12 is padding
        ColorInterlace::ThreeHead => {
            let t = bpl / 3;
            let f = bpl / 4;

            let mut j = t as isize - 1;
            while j >= 0 {
                line.push(buf[j as usize]);
                line.push(buf[t + j as usize]);
                line.push(buf[2 * t + j as usize]);
                j -= 3;
            }
            let mut j = f as isize - 3;
            while j >= 0 {
                line.push(buf[j as usize]);
                line.push(buf[t + j as usize]);
                line.push(buf[2 * t + j as usize]);
                j -= 3;
            }
            let mut j = t as isize - 2;
            while j >= 0 {
                line.push(buf[j as usize]);
                line.push(buf[t + j as usize]);
                line.push(buf[2 * t + j as usize]);
                j -= 3;
            }
            line.resize(bpl, 0);
        }
    }

    line
}

/// Split a duplex block into its two simplex streams.
///
/// The block must align to a double-wide line boundary. For the
/// three-head scheme this is only a partial descramble; the per-side
/// three-head color/gray pass finishes the job.
pub fn split_duplex(buf: &[u8], bpl: usize, scheme: DuplexInterlace) -> (Vec<u8>, Vec<u8>) {
    let mut front = Vec::with_capacity(buf.len() / 2);
    let mut back = Vec::with_capacity(buf.len() / 2);
    let dbpl = 2 * bpl;

    match scheme {
        DuplexInterlace::ThreeHead => {
            for chunk in buf.chunks_exact(dbpl) {
                for group in chunk.chunks_exact(6) {
                    front.push(group[2]);
                    front.push(group[4]);
                    front.push(group[5]);
                    back.push(group[3]);
                    back.push(group[0]);
                    back.push(group[1]);
                }
            }
        }

        // full line of front, then full line of back
        DuplexInterlace::LineAlternating => {
            for chunk in buf.chunks_exact(dbpl) {
                front.extend_from_slice(&chunk[..bpl]);
                back.extend_from_slice(&chunk[bpl..]);
            }
        }

        // alternating bytes
        DuplexInterlace::None | DuplexInterlace::ByteAlternating => {
            for pair in buf.chunks_exact(2) {
                front.push(pair[0]);
                back.push(pair[1]);
            }
        }
    }

    (front, back)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gray_reversed_roundtrip() {
        let logical: Vec<u8> = (0..24).collect();
        let scrambled: Vec<u8> = logical.iter().rev().cloned().collect();
        assert_eq!(gray_line(&scrambled, GrayInterlace::Reversed), logical);
    }

    #[test]
    fn test_gray_three_head() {
        // bpl 12: heads deliver positions 11,8,5,2 then 6,3,0 then
        // 10,7,4,1, and one pad byte closes the line
        let buf: Vec<u8> = (0..12).collect();
        let line = gray_line(&buf, GrayInterlace::ThreeHead);
        assert_eq!(line, vec![11, 8, 5, 2, 6, 3, 0, 10, 7, 4, 1, 0]);
        assert_eq!(line.len(), buf.len());
    }

    fn scramble_color(rgb: &[u8], pwidth: usize, scheme: ColorInterlace) -> Vec<u8> {
        let mut out = vec![0u8; rgb.len()];
        for j in 0..pwidth {
            let (r, g, b) = (rgb[j * 3], rgb[j * 3 + 1], rgb[j * 3 + 2]);
            match scheme {
                ColorInterlace::Rgb => {
                    out[j * 3] = r;
                    out[j * 3 + 1] = g;
                    out[j * 3 + 2] = b;
                }
                ColorInterlace::Bgr => {
                    out[j * 3] = b;
                    out[j * 3 + 1] = g;
                    out[j * 3 + 2] = r;
                }
                ColorInterlace::Gbr => {
                    out[j * 3] = g;
                    out[j * 3 + 1] = b;
                    out[j * 3 + 2] = r;
                }
                ColorInterlace::Brg => {
                    out[j * 3] = b;
                    out[j * 3 + 1] = r;
                    out[j * 3 + 2] = g;
                }
                ColorInterlace::Planar => {
                    out[j] = r;
                    out[pwidth + j] = g;
                    out[2 * pwidth + j] = b;
                }
                ColorInterlace::PlanarReversed => {
                    let rj = pwidth - 1 - j;
                    out[rj] = r;
                    out[pwidth + rj] = g;
                    out[2 * pwidth + rj] = b;
                }
                ColorInterlace::ThreeHead => unreachable!(),
            }
        }
        out
    }

    #[test]
    fn test_color_swizzles_roundtrip() {
        let pwidth = 8;
        let rgb: Vec<u8> = (0..pwidth as u8 * 3).collect();
        for scheme in [
            ColorInterlace::Rgb,
            ColorInterlace::Bgr,
            ColorInterlace::Gbr,
            ColorInterlace::Brg,
            ColorInterlace::Planar,
            ColorInterlace::PlanarReversed,
        ] {
            let scrambled = scramble_color(&rgb, pwidth, scheme);
            assert_eq!(
                color_line(&scrambled, pwidth, scheme),
                rgb,
                "{scheme:?}"
            );
        }
    }

    #[test]
    fn test_color_three_head() {
        // bpl 36: t=12, f=9. plane offsets 0/12/24, head order as in
        // the gray case, one pad pixel
        let buf: Vec<u8> = (0..36).collect();
        let line = color_line(&buf, 12, ColorInterlace::ThreeHead);
        let mut expect = Vec::new();
        for j in [11, 8, 5, 2, 6, 3, 0, 10, 7, 4, 1] {
            expect.extend_from_slice(&[j, 12 + j, 24 + j]);
        }
        expect.extend_from_slice(&[0, 0, 0]);
        assert_eq!(line, expect);
    }

    #[test]
    fn test_duplex_byte_alternating_roundtrip() {
        let front: Vec<u8> = (0..16).collect();
        let back: Vec<u8> = (100..116).collect();
        let mut stream = Vec::new();
        for i in 0..16 {
            stream.push(front[i]);
            stream.push(back[i]);
        }
        let (f, b) = split_duplex(&stream, 8, DuplexInterlace::ByteAlternating);
        assert_eq!(f, front);
        assert_eq!(b, back);
    }

    #[test]
    fn test_duplex_line_alternating_roundtrip() {
        let bpl = 8;
        let front: Vec<u8> = (0..16).collect();
        let back: Vec<u8> = (100..116).collect();
        let mut stream = Vec::new();
        for l in 0..2 {
            stream.extend_from_slice(&front[l * bpl..(l + 1) * bpl]);
            stream.extend_from_slice(&back[l * bpl..(l + 1) * bpl]);
        }
        let (f, b) = split_duplex(&stream, bpl, DuplexInterlace::LineAlternating);
        assert_eq!(f, front);
        assert_eq!(b, back);
    }

    #[test]
    fn test_duplex_three_head_roundtrip() {
        let bpl = 6;
        let front: Vec<u8> = (0..12).collect();
        let back: Vec<u8> = (100..112).collect();
        // forward scramble per six-byte group:
        // dev = [back0+1, back0+2, front0, back0, front1, front2]
        let mut stream = Vec::new();
        for g in 0..4 {
            let f = &front[g * 3..g * 3 + 3];
            let b = &back[g * 3..g * 3 + 3];
            stream.extend_from_slice(&[b[1], b[2], f[0], b[0], f[1], f[2]]);
        }
        let (f, b) = split_duplex(&stream, bpl, DuplexInterlace::ThreeHead);
        assert_eq!(f, front);
        assert_eq!(b, back);
    }
}
