//! SET WINDOW descriptor block.
//!
//! One 0x2c-byte descriptor programs resolution, geometry, tonal
//! settings and compression for one side of the scan. Geometry fields
//! are expressed in 1/1200-inch units regardless of resolution.

use super::bytes::{put_bits, put_n};
use super::cdb::WINDOW_DESC_LEN;

/// Image composition codes (descriptor byte 0x19).
pub const COMP_LINEART: u8 = 0;
pub const COMP_HALFTONE: u8 = 1;
pub const COMP_GRAY: u8 = 2;
pub const COMP_COLOR: u8 = 3;

/// Compression type codes (descriptor byte 0x20).
pub const CMP_NONE: u8 = 0;
pub const CMP_MH: u8 = 1;
pub const CMP_MR: u8 = 2;
pub const CMP_MMR: u8 = 3;
pub const CMP_JPEG: u8 = 0x80;

/// One window descriptor, serialized at fixed offsets.
#[derive(Debug, Clone, Default)]
pub struct WindowDescriptor {
    /// Window id: front or back.
    pub wid: u8,
    /// X/Y resolution in dpi.
    pub x_res: u32,
    pub y_res: u32,
    /// Upper-left corner, 1/1200 inch.
    pub ul_x: u32,
    pub ul_y: u32,
    /// Extent, 1/1200 inch.
    pub width: u32,
    pub length: u32,
    /// Tonal settings already shifted into hardware range (0-255).
    pub brightness: u8,
    pub threshold: u8,
    pub contrast: u8,
    /// Image composition code.
    pub composition: u8,
    /// Bits per pixel as the device counts them (1, 8).
    pub bits_per_pixel: u8,
    /// Reverse image flag (photometric inversion).
    pub rif: bool,
    /// RGB byte-order code, model specific.
    pub rgb_order: u8,
    /// Padding type.
    pub padding: u8,
    /// Compression type and argument.
    pub compress_type: u8,
    pub compress_arg: u8,
    /// Vendor-specific byte at 0x2a; meaning unknown, value per model.
    pub vendor_byte: u8,
}

impl WindowDescriptor {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut desc = vec![0u8; WINDOW_DESC_LEN];
        desc[0x00] = self.wid;
        put_n(&mut desc, 0x02, 2, self.x_res);
        put_n(&mut desc, 0x04, 2, self.y_res);
        put_n(&mut desc, 0x06, 4, self.ul_x);
        put_n(&mut desc, 0x0a, 4, self.ul_y);
        put_n(&mut desc, 0x0e, 4, self.width);
        put_n(&mut desc, 0x12, 4, self.length);
        desc[0x16] = self.brightness;
        desc[0x17] = self.threshold;
        desc[0x18] = self.contrast;
        desc[0x19] = self.composition;
        desc[0x1a] = self.bits_per_pixel;
        put_bits(&mut desc[0x1d], 1, 7, self.rif as u8);
        put_bits(&mut desc[0x1d], 7, 4, self.rgb_order);
        put_bits(&mut desc[0x1d], 7, 0, self.padding);
        desc[0x20] = self.compress_type;
        desc[0x21] = self.compress_arg;
        desc[0x2a] = self.vendor_byte;
        desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::bytes::get_n;
    use crate::protocol::cdb::WID_BACK;

    #[test]
    fn test_descriptor_layout() {
        let desc = WindowDescriptor {
            wid: WID_BACK,
            x_res: 300,
            y_res: 600,
            ul_x: 0x123,
            ul_y: 0x456,
            width: 8.5f64 as u32 * 1200,
            length: 14 * 1200,
            brightness: 128,
            threshold: 0x55,
            contrast: 200,
            composition: COMP_COLOR,
            bits_per_pixel: 8,
            rif: true,
            rgb_order: 1,
            padding: 0,
            compress_type: CMP_JPEG,
            compress_arg: 4,
            vendor_byte: 0x80,
        };
        let b = desc.to_bytes();
        assert_eq!(b.len(), WINDOW_DESC_LEN);
        assert_eq!(b[0], 0x01);
        assert_eq!(get_n(&b, 0x02, 2), 300);
        assert_eq!(get_n(&b, 0x04, 2), 600);
        assert_eq!(get_n(&b, 0x0e, 4), 8 * 1200);
        assert_eq!(get_n(&b, 0x12, 4), 14 * 1200);
        assert_eq!(b[0x16], 128);
        assert_eq!(b[0x19], COMP_COLOR);
        assert_eq!(b[0x1d], 0b1001_0000);
        assert_eq!(b[0x20], CMP_JPEG);
        assert_eq!(b[0x21], 4);
        assert_eq!(b[0x2a], 0x80);
    }

    #[test]
    fn test_default_descriptor_is_zeroed() {
        let b = WindowDescriptor::default().to_bytes();
        assert!(b.iter().all(|&x| x == 0));
    }
}
