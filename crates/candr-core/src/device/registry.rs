//! Attach/detach registry.
//!
//! Owns every attached device record in one map; there is no static
//! state. Attach interrogates the device through a borrowed channel,
//! resolves the quirk table, applies config overrides last, and
//! freezes the result.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::inquiry::{self, Identity};
use super::{Connection, DeviceModel, quirks};
use crate::config::DriverConfig;
use crate::error::ScanError;
use crate::protocol::cdb;
use crate::transport::{Channel, Command};

/// One attached device.
#[derive(Debug, Clone)]
pub struct Device {
    /// Transport address the device was attached under.
    pub name: String,
    pub model: DeviceModel,
}

/// Registry of attached devices, keyed by transport address.
#[derive(Default)]
pub struct Registry {
    devices: BTreeMap<String, Device>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrogate and register the device reachable through
    /// `channel`. Re-attaching an existing name is a no-op.
    pub fn attach(
        &mut self,
        name: &str,
        connection: Connection,
        channel: &mut Channel,
        config: &DriverConfig,
    ) -> Result<&Device, ScanError> {
        if self.devices.contains_key(name) {
            debug!(name, "already attached");
            return Ok(&self.devices[name]);
        }

        let model = interrogate(connection, channel, config)?;

        info!(name, model = %model.model, "attached scanner");
        self.devices.insert(name.to_string(), Device { name: name.to_string(), model });
        Ok(&self.devices[name])
    }

    pub fn detach(&mut self, name: &str) -> Option<Device> {
        let dev = self.devices.remove(name);
        if dev.is_some() {
            info!(name, "detached scanner");
        }
        dev
    }

    pub fn get(&self, name: &str) -> Option<&Device> {
        self.devices.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }
}

/// Build the immutable model record: probe, identify, read VPD,
/// apply the quirk table, then let the config have the last word.
fn interrogate(
    connection: Connection,
    channel: &mut Channel,
    config: &DriverConfig,
) -> Result<DeviceModel, ScanError> {
    channel.wait_ready()?;

    // identity from the device unless config supplies all of it
    let identity = if config.overrides_identity() {
        let identity = Identity {
            vendor: config.vendor.clone().unwrap_or_default(),
            model: config.model.clone().unwrap_or_default(),
            version: config.version.clone().unwrap_or_default(),
        };
        inquiry::verify_family(&identity)?;
        identity
    } else {
        let cdb = cdb::inquiry(false, 0, cdb::INQUIRY_STD_LEN as u8);
        let resp = channel.execute(Command::with_in(&cdb, cdb::INQUIRY_STD_LEN))?;
        let mut identity = inquiry::parse_identity(&resp.data)?;

        // individual overrides still win
        if let Some(v) = &config.vendor {
            identity.vendor = v.clone();
        }
        if let Some(m) = &config.model {
            identity.model = m.clone();
        }
        if let Some(v) = &config.version {
            identity.version = v.clone();
        }
        identity
    };

    let mut model = DeviceModel::new(identity.vendor, identity.model, identity.version, connection);

    // capability page; short responses are fine, refusal is not
    let cdb = cdb::inquiry(true, cdb::INQUIRY_VPD_PAGE, cdb::INQUIRY_VPD_LEN as u8);
    let resp = channel.execute(Command::with_in(&cdb, cdb::INQUIRY_VPD_LEN))?;
    inquiry::parse_vpd(&mut model, &resp.data);

    quirks::apply(&mut model);

    // config overrides come last
    model.buffer_size = config.buffer_size;
    model.duplex_offset = config.duplex_offset;

    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockBlock;

    fn inquiry_std(model: &str) -> Vec<u8> {
        let mut b = vec![0u8; cdb::INQUIRY_STD_LEN];
        b[0] = 0x06;
        b[0x08..0x0d].copy_from_slice(b"CANON");
        for i in 5..8 {
            b[0x08 + i] = b' ';
        }
        b[0x10..0x10 + model.len()].copy_from_slice(model.as_bytes());
        for i in model.len()..16 {
            b[0x10 + i] = b' ';
        }
        b[0x20..0x24].copy_from_slice(b"1.00");
        b
    }

    fn vpd_page() -> Vec<u8> {
        let mut b = vec![0u8; cdb::INQUIRY_VPD_LEN];
        b[0x05..0x07].copy_from_slice(&300u16.to_be_bytes());
        b[0x07..0x09].copy_from_slice(&300u16.to_be_bytes());
        b[0x13] = 0b0100_0100; // 300 + 600 dpi
        b[0x14..0x18].copy_from_slice(&2550u32.to_be_bytes());
        b[0x18..0x1c].copy_from_slice(&4200u32.to_be_bytes());
        b[0x1c] = 0b0000_1000; // gray
        b
    }

    fn scripted_channel(model: &str) -> Channel {
        let mock = MockBlock::new();
        mock.queue_ok(); // TEST UNIT READY
        mock.queue_data(inquiry_std(model));
        mock.queue_data(vpd_page());
        Channel::block(Box::new(mock))
    }

    #[test]
    fn test_attach_builds_model() {
        let mut reg = Registry::new();
        let mut ch = scripted_channel("DR-2510C");
        let config = DriverConfig { duplex_offset: 400, ..Default::default() };

        let dev = reg.attach("usb:001:002", Connection::Usb, &mut ch, &config).unwrap();
        assert_eq!(dev.model.model, "DR-2510C");
        assert!(dev.model.fixed_width); // quirk applied
        assert!(dev.model.can_gray); // vpd applied
        assert_eq!(dev.model.duplex_offset, 400); // config applied
        assert_eq!(reg.list().count(), 1);
    }

    #[test]
    fn test_attach_rejects_unknown_vendor() {
        let mock = MockBlock::new();
        mock.queue_ok();
        let mut bad = inquiry_std("DR-2510C");
        bad[0x08..0x10].copy_from_slice(b"EPSON   ");
        mock.queue_data(bad);
        let mut ch = Channel::block(Box::new(mock));

        let mut reg = Registry::new();
        let err = reg
            .attach("usb:001:002", Connection::Usb, &mut ch, &DriverConfig::default())
            .unwrap_err();
        assert!(matches!(err, ScanError::Unsupported(_)));
        assert_eq!(reg.list().count(), 0);
    }

    #[test]
    fn test_identity_override_skips_inquiry() {
        let mock = MockBlock::new();
        let handle = mock.handle();
        mock.queue_ok(); // TEST UNIT READY
        mock.queue_data(vpd_page()); // straight to VPD
        let mut ch = Channel::block(Box::new(mock));

        let config = DriverConfig {
            vendor: Some("CANON".into()),
            model: Some("DR-2050C".into()),
            version: Some("1.00".into()),
            ..Default::default()
        };
        let mut reg = Registry::new();
        let dev = reg.attach("scsi:/dev/sg3", Connection::Scsi, &mut ch, &config).unwrap();
        assert_eq!(dev.model.model, "DR-2050C");
        assert!(dev.model.need_fcal_buffer);

        // no standard INQUIRY was issued
        let cdbs = handle.cdbs();
        assert!(!cdbs.iter().any(|c| c[0] == cdb::INQUIRY && c[1] & 1 == 0));
    }

    #[test]
    fn test_detach() {
        let mut reg = Registry::new();
        let mut ch = scripted_channel("DR-6080C");
        reg.attach("usb:1", Connection::Usb, &mut ch, &DriverConfig::default()).unwrap();
        assert!(reg.detach("usb:1").is_some());
        assert!(reg.detach("usb:1").is_none());
        assert_eq!(reg.list().count(), 0);
    }
}
