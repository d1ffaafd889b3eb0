//! Local service configuration.

/// Everything the embedding application has to say about the local service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// EEBUS vendor code of the device brand.
    pub vendor_code: String,
    /// Device brand name.
    pub brand: String,
    /// Device model name.
    pub model: String,
    /// Serial number, unique per vendor.
    pub serial_number: String,
    /// The EEBUS device type announced to peers, e.g.
    /// `EnergyManagementSystem`.
    pub device_type: String,
    /// The port the SHIP endpoint listens on.
    pub port: u16,
    /// Trust every incoming pairing request without an operator decision.
    /// Only sensible during commissioning.
    pub register_auto_accept: bool,
}

impl ServiceConfig {
    pub fn new(
        vendor_code: &str,
        brand: &str,
        model: &str,
        serial_number: &str,
        device_type: &str,
        port: u16,
    ) -> Result<Self, InvalidServiceConfig> {
        for (field, value) in [
            ("vendor code", vendor_code),
            ("brand", brand),
            ("model", model),
            ("serial number", serial_number),
            ("device type", device_type),
        ] {
            if value.trim().is_empty() {
                return Err(InvalidServiceConfig(field));
            }
        }

        Ok(Self {
            vendor_code: vendor_code.to_owned(),
            brand: brand.to_owned(),
            model: model.to_owned(),
            serial_number: serial_number.to_owned(),
            device_type: device_type.to_owned(),
            port,
            register_auto_accept: false,
        })
    }

    /// The opaque ShipID we present during access methods. Stable per
    /// device, derived from brand, model and serial.
    pub fn ship_id(&self) -> String {
        format!("{}-{}-{}", self.brand, self.model, self.serial_number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("service configuration field must not be empty: {0}")]
pub struct InvalidServiceConfig(pub &'static str);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fields_are_rejected() {
        assert_eq!(
            ServiceConfig::new("Vendor", " ", "HEMS", "898237", "EnergyManagementSystem", 4711),
            Err(InvalidServiceConfig("brand"))
        );
    }

    #[test]
    fn ship_id_is_derived_from_identity() {
        let config =
            ServiceConfig::new("Vendor", "Demo", "HEMS", "898237", "EnergyManagementSystem", 4711)
                .unwrap();
        assert_eq!(config.ship_id(), "Demo-HEMS-898237");
    }
}
