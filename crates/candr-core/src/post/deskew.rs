//! Software deskew.
//!
//! Finds the paper's top edge with an iteratively refined Hough-style
//! histogram over (slope, offset) bins, locates the left edge with a
//! perpendicular sweep, derives a rotation center from the two, and
//! resamples the page by inverse rotation. Bails out quietly when no
//! convincing edge exists; a blank page is not an error.

use tracing::debug;

use super::PageGeometry;
use super::transitions::transitions_y;
use crate::image::Mode;

/// Histogram granularity per pass.
const SLOPE_BINS: usize = 11;
const OFFSET_BINS: usize = 11;
/// Refinement passes.
const MAX_PASSES: u32 = 7;

/// Best line found by one histogram pass.
struct HoughLine {
    slope: f64,
    offset: i32,
    density: i32,
}

/// Bin transition pairs into (slope, offset) cells, weight cells
/// toward small absolute slope and offset, and return the densest.
fn hough_line(
    width: usize,
    buff: &[i32],
    min_slope: f64,
    max_slope: f64,
    min_offset: i32,
    max_offset: i32,
) -> HoughLine {
    let h_width = (width / 2) as f64;

    let abs_max_slope = max_slope.abs().max(min_slope.abs());
    let abs_max_offset = (max_offset.abs().max(min_offset.abs())).max(1);

    let mut slope_center = [0f64; SLOPE_BINS];
    let mut slope_scale = [0i32; SLOPE_BINS];
    for (j, (center, scale)) in slope_center.iter_mut().zip(slope_scale.iter_mut()).enumerate()
    {
        *center = ((j as f64) * (max_slope - min_slope) / SLOPE_BINS as f64
            + min_slope
            + (j as f64 + 1.0) * (max_slope - min_slope) / SLOPE_BINS as f64
            + min_slope)
            / 2.0;
        // scale into an inverted 100-1 range: near zero scores high
        *scale = 101 - (center.abs() * 100.0 / abs_max_slope) as i32;
    }

    let mut offset_center = [0f64; OFFSET_BINS];
    let mut offset_scale = [0i32; OFFSET_BINS];
    for (j, (center, scale)) in
        offset_center.iter_mut().zip(offset_scale.iter_mut()).enumerate()
    {
        *center = ((j as f64) / OFFSET_BINS as f64 * (max_offset - min_offset) as f64
            + min_offset as f64
            + (j as f64 + 1.0) / OFFSET_BINS as f64 * (max_offset - min_offset) as f64
            + min_offset as f64)
            / 2.0;
        *scale = 101 - (center.abs() * 100.0 / abs_max_offset as f64) as i32;
    }

    let mut bins = [[0i32; OFFSET_BINS]; SLOPE_BINS];

    for i in 0..width {
        for j in i + 1..width.min(i + width / 3) {
            let rise = (buff[j] - buff[i]) as f64;
            let run = (j - i) as f64;
            let slope = rise / run;
            if slope >= max_slope || slope < min_slope {
                continue;
            }

            // offset at the center of the width, not the y intercept
            let offset = (slope * h_width + buff[i] as f64 - slope * i as f64) as i32;
            if offset >= max_offset || offset < min_offset {
                continue;
            }

            let s_index =
                ((slope - min_slope) * SLOPE_BINS as f64 / (max_slope - min_slope)) as usize;
            if s_index >= SLOPE_BINS {
                continue;
            }
            let o_index = ((offset - min_offset) as usize * OFFSET_BINS)
                / (max_offset - min_offset).max(1) as usize;
            if o_index >= OFFSET_BINS {
                continue;
            }

            bins[s_index][o_index] += 1;
        }
    }

    let mut max_density = 1;
    for row in &bins {
        for &d in row {
            if d > max_density {
                max_density = d;
            }
        }
    }

    let mut best = HoughLine { slope: 0.0, offset: 0, density: 0 };
    for i in 0..SLOPE_BINS {
        for j in 0..OFFSET_BINS {
            let scaled = bins[i][j] * slope_scale[i] * offset_scale[j] / max_density;
            if scaled > best.density {
                best.density = scaled;
                best.slope = slope_center[i];
                best.offset = offset_center[j] as i32;
            }
        }
    }
    best
}

/// Iteratively refine the (slope, offset) search around the densest
/// bin, jittering bin boundaries each pass to avoid quantization
/// splits. Returns (slope, x intercept, y intercept), all zero when
/// no edge is convincing.
fn edge_iterate(width: usize, resolution: u32, buff: &[i32]) -> (f64, i32, i32) {
    let mut min_slope = -1.0f64;
    let mut max_slope = 1.0f64;
    let mut min_offset = -(resolution as i32) / 6;
    let mut max_offset = resolution as i32 / 6;

    let mut top = HoughLine { slope: 0.0, offset: 0, density: 0 };

    for pass in 0..MAX_PASSES {
        let s_step = (max_slope - min_slope) / SLOPE_BINS as f64;
        let o_step = (max_offset - min_offset) / OFFSET_BINS as i32;

        top = HoughLine { slope: 0.0, offset: 0, density: 0 };

        // four jittered boundary trials, highest density wins
        for i in 0..2 {
            let s_step2 = s_step * i as f64 / 2.0;
            for j in 0..2 {
                let o_step2 = o_step * j / 2;
                let found = hough_line(
                    width,
                    buff,
                    min_slope + s_step2,
                    max_slope + s_step2,
                    min_offset + o_step2,
                    max_offset + o_step2,
                );
                if found.density > top.density {
                    top = found;
                }
            }
        }

        debug!(
            pass,
            slope = top.slope,
            offset = top.offset,
            density = top.density,
            "edge refinement"
        );

        // nothing promising on the first pass means no visible edge;
        // give up instead of fixating on a small pointless feature
        if pass == 0 && top.density < width as i32 / 5 {
            debug!(density = top.density, width, "no convincing edge");
            return (0.0, 0, 0);
        }

        let mut go = false;
        if s_step >= 0.0001 {
            min_slope = top.slope - s_step;
            max_slope = top.slope + s_step;
            go = true;
        }
        if o_step != 0 {
            min_offset = top.offset - o_step;
            max_offset = top.offset + o_step;
            go = true;
        }
        if !go {
            break;
        }
    }

    if top.slope != 0.0 {
        let y_inter = top.offset - (top.slope * width as f64 / 2.0) as i32;
        let x_inter = (y_inter as f64 / -top.slope) as i32;
        (top.slope, x_inter, y_inter)
    } else {
        (0.0, 0, 0)
    }
}

/// Sweep a line of the given slope across the page and return the
/// (x, y) intercept of the left-most edge point, using both the top
/// and bottom transition arrays.
fn edge_slope(
    width: usize,
    height: usize,
    top: &[i32],
    bot: &[i32],
    slope: f64,
) -> (i32, i32) {
    let scan = |buff: &[i32], valid: &dyn Fn(i32) -> bool| -> (i32, i32) {
        let mut x_inter = width as i32;
        let mut y_inter = 0;
        let mut count = 0;

        for (i, &v) in buff.iter().enumerate() {
            if valid(v) {
                let yi = (v as f64 - slope * i as f64) as i32;
                let xi = (yi as f64 / -slope) as i32;
                if x_inter > xi {
                    x_inter = xi;
                    y_inter = yi;
                }
                count += 1;
                if count > 5 {
                    break;
                }
            } else {
                x_inter = width as i32;
                y_inter = 0;
                count = 0;
            }
        }
        (x_inter, y_inter)
    };

    let h = height as i32;
    let (top_x, top_y) = scan(top, &|v| v < h);
    let (bot_x, bot_y) = scan(bot, &|v| v > -1);

    if bot_x < top_x { (bot_x, bot_y) } else { (top_x, top_y) }
}

/// Rotate the page by `slope` around (`center_x`, `center_y`),
/// filling exposed regions with the background color (binary pages
/// use whichever polarity the background maps to).
fn rotate_on_center(
    data: &mut [u8],
    g: &PageGeometry,
    center_x: i32,
    center_y: i32,
    slope: f64,
    bg_color: u8,
    threshold: u8,
) {
    let slope_rad = -slope.atan();
    let (sin, cos) = slope_rad.sin_cos();

    let bpl = g.bpl;
    let pwidth = g.width as i32;
    let height = g.height as i32;
    let total = g.total_bytes();

    match g.mode {
        Mode::Color | Mode::Gray => {
            let depth = g.depth();
            let mut out = vec![bg_color; total];

            for i in 0..height {
                let shift_y = (center_y - i) as f64;
                for j in 0..pwidth {
                    let shift_x = (center_x - j) as f64;

                    let source_x = center_x - (shift_x * cos + shift_y * sin) as i32;
                    if source_x < 0 || source_x >= pwidth {
                        continue;
                    }
                    let source_y = center_y + (-shift_y * cos + shift_x * sin) as i32;
                    if source_y < 0 || source_y >= height {
                        continue;
                    }

                    for k in 0..depth {
                        out[i as usize * bpl + j as usize * depth + k] =
                            data[source_y as usize * bpl + source_x as usize * depth + k];
                    }
                }
            }
            data[..total].copy_from_slice(&out);
        }

        Mode::Lineart | Mode::Halftone => {
            let fill = if bg_color < threshold { 0xff } else { 0x00 };
            let mut out = vec![fill; total];

            for i in 0..height {
                let shift_y = (center_y - i) as f64;
                for j in 0..pwidth {
                    let shift_x = (center_x - j) as f64;

                    let source_x = center_x - (shift_x * cos + shift_y * sin) as i32;
                    if source_x < 0 || source_x >= pwidth {
                        continue;
                    }
                    let source_y = center_y + (-shift_y * cos + shift_x * sin) as i32;
                    if source_y < 0 || source_y >= height {
                        continue;
                    }

                    let bit = (data[source_y as usize * bpl + source_x as usize / 8]
                        >> (7 - (source_x as usize % 8)))
                        & 1;
                    let cell = &mut out[i as usize * bpl + j as usize / 8];
                    *cell &= !(1 << (7 - (j as usize % 8)));
                    *cell |= bit << (7 - (j as usize % 8));
                }
            }
            data[..total].copy_from_slice(&out);
        }
    }
}

/// Detect the page angle and straighten the buffer in place.
///
/// `bg_color` must already be tone-curve mapped. A page with no
/// detectable edge or a negligible angle is left untouched.
pub fn deskew(data: &mut [u8], g: &PageGeometry, bg_color: u8, threshold: u8) {
    let top_buf = transitions_y(data, g, true);
    let bot_buf = transitions_y(data, g, false);

    let (t_slope, t_x_inter, _t_y_inter) = edge_iterate(g.width, g.dpi_y, &top_buf);
    debug!(slope = t_slope, x = t_x_inter, "top edge");

    // slope too shallow to matter, and we must not divide by it
    if t_slope.abs() < 0.0001 {
        debug!("skew negligible, leaving page alone");
        return;
    }

    // left edge is perpendicular to the top
    let l_slope = -1.0 / t_slope;
    let (l_x_inter, l_y_inter) = edge_slope(g.width, g.height, &top_buf, &bot_buf, l_slope);
    debug!(slope = l_slope, x = l_x_inter, y = l_y_inter, "left edge");

    // rotation center from the half-angle lines of the two edges
    let t_slope_half = (t_slope.atan() / 2.0).tan();
    let t_offset_half = l_y_inter;

    let l_slope_half = ((l_slope.atan()
        + if l_slope < 0.0 {
            -std::f64::consts::FRAC_PI_2
        } else {
            std::f64::consts::FRAC_PI_2
        })
        / 2.0)
        .tan();
    let l_offset_half = -l_slope_half * t_x_inter as f64;

    let rotate_x =
        ((l_offset_half - t_offset_half as f64) / (t_slope_half - l_slope_half)) as i32;
    let rotate_y = (t_slope_half * rotate_x as f64) as i32 + t_offset_half;
    debug!(x = rotate_x, y = rotate_y, "rotation center");

    rotate_on_center(data, g, rotate_x, rotate_y, t_slope, bg_color, threshold);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Gray page holding a 260x120 rectangle rotated by `angle_deg`
    /// around its top-left corner at (6, 6).
    fn rotated_page(
        width: usize,
        height: usize,
        angle_deg: f64,
    ) -> (Vec<u8>, PageGeometry) {
        let g = PageGeometry {
            width,
            height,
            bpl: width,
            mode: Mode::Gray,
            dpi_x: 100,
            dpi_y: 100,
        };
        let rad = angle_deg.to_radians();
        let (sin, cos) = rad.sin_cos();
        let mut data = vec![0xee; width * height];
        for y in 0..height {
            for x in 0..width {
                // rotate back into page space and test the rectangle
                let dx = x as f64 - 6.0;
                let dy = y as f64 - 6.0;
                let u = dx * cos + dy * sin;
                let v = -dx * sin + dy * cos;
                if (0.0..260.0).contains(&u) && (0.0..120.0).contains(&v) {
                    data[y * width + x] = 0x20;
                }
            }
        }
        (data, g)
    }

    /// Least-squares slope of the detected top edge, ignoring columns
    /// with no transition.
    fn top_edge_slope(data: &[u8], g: &PageGeometry) -> f64 {
        let top = transitions_y(data, g, true);
        let pts: Vec<(f64, f64)> = top
            .iter()
            .enumerate()
            .filter(|&(_, &y)| y < g.height as i32)
            .map(|(x, &y)| (x as f64, y as f64))
            .collect();
        let n = pts.len() as f64;
        let sx: f64 = pts.iter().map(|p| p.0).sum();
        let sy: f64 = pts.iter().map(|p| p.1).sum();
        let sxx: f64 = pts.iter().map(|p| p.0 * p.0).sum();
        let sxy: f64 = pts.iter().map(|p| p.0 * p.1).sum();
        (n * sxy - sx * sy) / (n * sxx - sx * sx)
    }

    #[test]
    fn test_deskew_straightens_three_degrees() {
        let (mut data, g) = rotated_page(300, 200, 3.0);

        let before = top_edge_slope(&data, &g);
        assert!(before.abs() > 2.0f64.to_radians().tan());

        deskew(&mut data, &g, 0xee, 90);

        let after = top_edge_slope(&data, &g);
        assert!(
            after.abs() < 1.0f64.to_radians().tan(),
            "residual slope {after}"
        );
    }

    #[test]
    fn test_deskew_moves_content_toward_origin() {
        let (mut data, g) = rotated_page(300, 200, 3.0);
        deskew(&mut data, &g, 0xee, 90);

        // first row and column containing page pixels
        let first_row = (0..g.height)
            .find(|&y| (0..g.width).any(|x| data[y * g.width + x] < 0x80))
            .unwrap();
        let first_col = (0..g.width)
            .find(|&x| (0..g.height).any(|y| data[y * g.width + x] < 0x80))
            .unwrap();

        assert!(first_row <= 12, "first content row {first_row}");
        assert!(first_col <= 12, "first content column {first_col}");
    }

    #[test]
    fn test_deskew_leaves_straight_page_alone() {
        let (mut data, g) = rotated_page(300, 200, 0.0);
        let before = data.clone();
        deskew(&mut data, &g, 0xee, 90);
        assert_eq!(data, before);
    }

    #[test]
    fn test_deskew_ignores_blank_page() {
        let g = PageGeometry {
            width: 300,
            height: 200,
            bpl: 300,
            mode: Mode::Gray,
            dpi_x: 100,
            dpi_y: 100,
        };
        let mut data = vec![0xee; g.total_bytes()];
        let before = data.clone();
        deskew(&mut data, &g, 0xee, 90);
        assert_eq!(data, before);
    }
}
