//! Appliance codecs keyed by family code.
//!
//! Each codec implements [`DeviceKind`] from `midea-session`: it builds the
//! status queries and set commands of its family and maps reply bodies to
//! named attributes. [`create_device`] picks the codec for a family code.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod a1;

use midea_session::{DeviceKind, MessageSerial};
use std::sync::Arc;
use tracing::warn;

// Re-export main types
pub use a1::{A1Dehumidifier, A1GeneralBody};

/// Family codes with a codec
pub const SUPPORTED_TYPES: &[u8] = &[a1::DEVICE_TYPE];

/// Whether a codec exists for `device_type`
pub fn is_supported(device_type: u8) -> bool {
    SUPPORTED_TYPES.contains(&device_type)
}

/// Codec for `device_type`, sharing the session's message serial.
///
/// An invalid `customize` string is logged and the defaults are kept.
pub fn create_device(
    device_type: u8,
    serial: Arc<MessageSerial>,
    customize: Option<&str>,
) -> Option<Box<dyn DeviceKind>> {
    match device_type {
        a1::DEVICE_TYPE => {
            let mut device = A1Dehumidifier::new(serial);
            if let Some(customize) = customize {
                if let Err(e) = device.set_customize(customize) {
                    warn!("Set customize error - {}: {}", customize, e);
                }
            }
            Some(Box::new(device))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        let serial = Arc::new(MessageSerial::new());
        let device = create_device(0xA1, serial.clone(), None).unwrap();
        assert_eq!(device.device_type(), 0xA1);
        assert!(is_supported(0xA1));

        assert!(create_device(0xAC, serial.clone(), None).is_none());
        assert!(!is_supported(0xAC));

        // bad customization falls back to the defaults
        let device = create_device(0xA1, serial, Some("{")).unwrap();
        assert_eq!(
            device.initial_attributes()["fan_speed"],
            midea_session::AttributeValue::Text("Medium".into())
        );
    }

    #[test]
    fn test_codecs_share_serial() {
        let serial = Arc::new(MessageSerial::new());
        let first = create_device(0xA1, serial.clone(), None).unwrap();
        let second = create_device(0xA1, serial.clone(), None).unwrap();

        first.build_query(0);
        second.build_query(0);
        assert_eq!(serial.next(), 3);
    }
}
