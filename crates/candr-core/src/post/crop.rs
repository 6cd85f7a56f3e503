//! Automatic crop.
//!
//! Uses the transition arrays from all four borders to find where the
//! paper actually is, then copies that region forward and shrinks the
//! page bookkeeping. The image is not rotated here.

use tracing::debug;

use super::PageGeometry;
use super::transitions::{transitions_x, transitions_y};
use crate::image::Mode;

/// Crop the page in place. Returns true when a valid rectangle was
/// found and the geometry was rewritten.
pub fn crop(data: &mut [u8], g: &mut PageGeometry) -> bool {
    let width = g.width;
    let height = g.height;
    let bpl = g.bpl;

    let top_buf = transitions_y(data, g, true);
    let bot_buf = transitions_y(data, g, false);
    let left_buf = transitions_x(data, g, true);
    let right_buf = transitions_x(data, g, false);

    let top = 0usize;
    let mut bot: i32 = 0;
    let mut left: i32 = width as i32;
    let mut right: i32 = 0;

    // walk the column lists from both ends; a column shows paper when
    // the bottom-up transition sits below the top-down one, and a
    // short run of such columns fixes the bound
    let mut count = 0;
    for i in 0..width {
        if bot_buf[i] > top_buf[i] {
            if left > i as i32 {
                left = i as i32;
            }
            count += 1;
            if count > 3 {
                break;
            }
        } else {
            count = 0;
            left = width as i32;
        }
    }

    let mut count = 0;
    for i in (0..width).rev() {
        if bot_buf[i] > top_buf[i] {
            if right < i as i32 {
                right = i as i32;
            }
            count += 1;
            if count > 3 {
                break;
            }
        } else {
            count = 0;
            right = -1;
        }
    }

    // bottom bound from the row lists
    let mut count = 0;
    for i in (0..height).rev() {
        if right_buf[i] > left_buf[i] {
            if bot < i as i32 {
                bot = i as i32;
            }
            count += 1;
            if count > 3 {
                break;
            }
        } else {
            count = 0;
            bot = -1;
        }
    }

    debug!(top, bot, left, right, "crop bounds");

    if left >= right || top as i32 >= bot {
        debug!("no usable crop rectangle");
        return false;
    }

    let (mut left, right, bot) = (left as usize, right as usize, bot as usize);

    // convert the bounds to bytes and the new line layout
    let (pixels, bytes, left_bytes) = match g.mode {
        Mode::Color => {
            let pixels = right - left;
            (pixels, pixels * 3, left * 3)
        }
        Mode::Gray => (right - left, right - left, left),
        Mode::Lineart | Mode::Halftone => {
            left /= 8;
            let right = (right + 7) / 8;
            let bytes = right - left;
            (bytes * 8, bytes, left)
        }
    };

    debug!(pixels, bytes, "crop layout");

    // copy the region forward row by row
    let mut write = 0;
    for i in top..bot {
        let src = i * bpl + left_bytes;
        data.copy_within(src..src + bytes, write);
        write += bytes;
    }

    g.width = pixels;
    g.height = bot - top;
    g.bpl = bytes;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with_rect(
        width: usize,
        height: usize,
        rect: (usize, usize, usize, usize),
    ) -> (Vec<u8>, PageGeometry) {
        let g = PageGeometry {
            width,
            height,
            bpl: width,
            mode: Mode::Gray,
            dpi_x: 100,
            dpi_y: 100,
        };
        let mut data = vec![0xee; width * height];
        let (x0, y0, x1, y1) = rect;
        for y in y0..y1 {
            for x in x0..x1 {
                data[y * width + x] = 0x20;
            }
        }
        (data, g)
    }

    #[test]
    fn test_crop_recovers_bounding_box() {
        let (mut data, mut g) = page_with_rect(200, 150, (40, 20, 160, 100));
        assert!(crop(&mut data, &mut g));

        // bounds land within a window length of the true rectangle
        assert!((g.width as i32 - 120).abs() <= 10, "width {}", g.width);
        assert!((g.height as i32 - 100).abs() <= 10, "height {}", g.height);
        assert_eq!(g.bpl, g.width);

        // the cropped region is dominated by page pixels in its lower
        // portion (rows above the original y0 stay background)
        let dark = data[..g.total_bytes()].iter().filter(|&&p| p < 0x80).count();
        assert!(dark >= 120 * 80 * 9 / 10);
    }

    #[test]
    fn test_crop_rejects_blank_page() {
        let (mut data, mut g) = page_with_rect(200, 150, (0, 0, 0, 0));
        let before = g;
        assert!(!crop(&mut data, &mut g));
        assert_eq!(g, before);
    }

    #[test]
    fn test_crop_color_page() {
        let width = 120;
        let height = 90;
        let mut g = PageGeometry {
            width,
            height,
            bpl: width * 3,
            mode: Mode::Color,
            dpi_x: 100,
            dpi_y: 100,
        };
        let mut data = vec![0xee; g.total_bytes()];
        for y in 10..70 {
            for x in 30..90 {
                for k in 0..3 {
                    data[y * g.bpl + x * 3 + k] = 0x20;
                }
            }
        }

        assert!(crop(&mut data, &mut g));
        assert!((g.width as i32 - 60).abs() <= 10);
        assert_eq!(g.bpl, g.width * 3);
        assert!((g.height as i32 - 70).abs() <= 10);
    }
}
