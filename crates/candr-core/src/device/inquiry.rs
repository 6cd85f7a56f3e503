//! INQUIRY and vital-product-data parsing.
//!
//! The standard page identifies the device and gates attach on the
//! supported vendor and model families. VPD page 0xf0, when offered,
//! fills in resolution lists, window extents and mode capabilities.

use tracing::{debug, info, warn};

use super::DeviceModel;
use crate::error::ScanError;
use crate::protocol::bytes::{get_bits, get_n};

/// Peripheral device type reported by scanners.
const PERIPH_DEVTYPE_SCANNER: u8 = 0x06;

/// Identity strings pulled from the standard INQUIRY page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub vendor: String,
    pub model: String,
    pub version: String,
}

fn fixed_string(data: &[u8], off: usize, len: usize) -> String {
    let raw = &data[off..off + len];
    let text: String = raw.iter().map(|&b| b as char).collect();
    text.trim_end_matches([' ', '\0']).to_string()
}

/// Parse the standard INQUIRY page and verify this is a scanner from
/// a supported product family.
pub fn parse_identity(data: &[u8]) -> Result<Identity, ScanError> {
    if data.len() < 0x24 {
        return Err(ScanError::Io("short INQUIRY response".into()));
    }

    let devtype = get_bits(data[0], 0x1f, 0);
    if devtype != PERIPH_DEVTYPE_SCANNER {
        warn!(devtype, "device is not a scanner");
        return Err(ScanError::Unsupported("not a scanner".into()));
    }

    let identity = Identity {
        vendor: fixed_string(data, 0x08, 8),
        model: fixed_string(data, 0x10, 16),
        version: fixed_string(data, 0x20, 4),
    };

    verify_family(&identity)?;

    info!(
        vendor = %identity.vendor,
        model = %identity.model,
        version = %identity.version,
        "identified scanner"
    );

    Ok(identity)
}

/// Gate on the vendor and model families this driver knows.
pub fn verify_family(identity: &Identity) -> Result<(), ScanError> {
    if identity.vendor != "CANON" {
        return Err(ScanError::Unsupported(format!(
            "vendor '{}' not supported",
            identity.vendor
        )));
    }
    if !identity.model.starts_with("DR")
        && !identity.model.starts_with("CR")
        && !identity.model.starts_with("P-")
    {
        return Err(ScanError::Unsupported(format!(
            "model '{}' is not a DR, CR or P- series scanner",
            identity.model
        )));
    }
    Ok(())
}

/// Apply VPD page 0xf0 capability data to the model record.
pub fn parse_vpd(model: &mut DeviceModel, data: &[u8]) {
    if data.len() < 0x1d {
        warn!(len = data.len(), "device offered no usable VPD page");
        return;
    }

    model.basic_x_res = get_n(data, 0x05, 2);
    model.basic_y_res = get_n(data, 0x07, 2);
    model.step_x_res = get_bits(data[0x09], 1, 0) != 0;
    model.step_y_res = get_bits(data[0x09], 1, 4) != 0;
    model.max_x_res = get_n(data, 0x0a, 2);
    model.max_y_res = get_n(data, 0x0c, 2);
    model.min_x_res = get_n(data, 0x0e, 2);
    model.min_y_res = get_n(data, 0x10, 2);

    // two bytes of per-resolution flags, msb first
    for (i, bit) in (0..8).rev().enumerate() {
        model.std_res_x[i] = get_bits(data[0x12], 1, bit as u8) != 0;
        model.std_res_x[8 + i] = get_bits(data[0x13], 1, bit as u8) != 0;
    }
    model.std_res_y = model.std_res_x;

    // extents are reported in basic-resolution units
    if model.basic_x_res != 0 {
        model.max_x = get_n(data, 0x14, 4) * 1200 / model.basic_x_res;
    }
    if model.basic_y_res != 0 {
        model.max_y = get_n(data, 0x18, 4) * 1200 / model.basic_y_res;
    }

    model.can_gray = get_bits(data[0x1c], 1, 3) != 0;
    model.can_halftone = get_bits(data[0x1c], 1, 2) != 0;
    model.can_mono = get_bits(data[0x1c], 1, 1) != 0;
    model.can_overflow = get_bits(data[0x1c], 1, 0) != 0;

    debug!(
        basic_x = model.basic_x_res,
        basic_y = model.basic_y_res,
        max_x = model.max_x,
        max_y = model.max_y,
        gray = model.can_gray,
        halftone = model.can_halftone,
        mono = model.can_mono,
        "parsed VPD capabilities"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Connection;

    fn inquiry_block(devtype: u8, vendor: &str, model: &str, version: &str) -> Vec<u8> {
        let mut b = vec![0u8; 0x30];
        b[0] = devtype;
        b[0x08..0x08 + vendor.len()].copy_from_slice(vendor.as_bytes());
        for i in vendor.len()..8 {
            b[0x08 + i] = b' ';
        }
        b[0x10..0x10 + model.len()].copy_from_slice(model.as_bytes());
        for i in model.len()..16 {
            b[0x10 + i] = b' ';
        }
        b[0x20..0x20 + version.len()].copy_from_slice(version.as_bytes());
        b
    }

    #[test]
    fn test_parse_identity() {
        let b = inquiry_block(0x06, "CANON", "DR-2510C", "1.06");
        let id = parse_identity(&b).unwrap();
        assert_eq!(id.vendor, "CANON");
        assert_eq!(id.model, "DR-2510C");
        assert_eq!(id.version, "1.06");
    }

    #[test]
    fn test_rejects_non_scanner() {
        let b = inquiry_block(0x00, "CANON", "DR-2510C", "1.06");
        assert!(matches!(
            parse_identity(&b),
            Err(ScanError::Unsupported(_))
        ));
    }

    #[test]
    fn test_rejects_foreign_vendor_and_family() {
        let b = inquiry_block(0x06, "FUJITSU", "fi-6130", "1.00");
        assert!(matches!(parse_identity(&b), Err(ScanError::Unsupported(_))));

        let b = inquiry_block(0x06, "CANON", "LIDE 110", "1.00");
        assert!(matches!(parse_identity(&b), Err(ScanError::Unsupported(_))));

        for model in ["DR-9080C", "CR-190i", "P-215"] {
            let b = inquiry_block(0x06, "CANON", model, "1.00");
            assert!(parse_identity(&b).is_ok(), "{model}");
        }
    }

    #[test]
    fn test_parse_vpd() {
        let mut vpd = vec![0u8; 0x1e];
        vpd[0x05..0x07].copy_from_slice(&300u16.to_be_bytes());
        vpd[0x07..0x09].copy_from_slice(&300u16.to_be_bytes());
        vpd[0x0a..0x0c].copy_from_slice(&600u16.to_be_bytes());
        vpd[0x0c..0x0e].copy_from_slice(&600u16.to_be_bytes());
        vpd[0x0e..0x10].copy_from_slice(&100u16.to_be_bytes());
        vpd[0x10..0x12].copy_from_slice(&100u16.to_be_bytes());
        vpd[0x12] = 0b0010_0101; // 100, 180, 200 dpi
        vpd[0x13] = 0b0100_0100; // 300, 600 dpi
        // 8.5 x 14 inches in basic (300 dpi) units
        vpd[0x14..0x18].copy_from_slice(&2550u32.to_be_bytes());
        vpd[0x18..0x1c].copy_from_slice(&4200u32.to_be_bytes());
        vpd[0x1c] = 0b0000_1010; // gray + mono

        let mut m = DeviceModel::new(
            "CANON".into(),
            "DR-X".into(),
            "1.0".into(),
            Connection::Usb,
        );
        parse_vpd(&mut m, &vpd);

        assert_eq!(m.basic_x_res, 300);
        assert_eq!(m.max_x_res, 600);
        assert_eq!(m.min_x_res, 100);
        assert!(m.std_res_x[2]); // 100
        assert!(m.std_res_x[6]); // 180
        assert!(m.std_res_x[7]); // 200
        assert!(m.std_res_x[9]); // 300
        assert!(m.std_res_x[13]); // 600
        assert!(!m.std_res_x[15]); // 1200
        assert_eq!(m.max_x, 2550 * 1200 / 300);
        assert_eq!(m.max_y, 4200 * 1200 / 300);
        assert!(m.can_gray);
        assert!(m.can_mono);
        assert!(!m.can_halftone);
    }
}
