//! Device records and device-type classification.

use std::fmt;

/// A Zigbee coprocessor device as reported by enumeration.
///
/// Produced by the platform; consumed read-only.
#[derive(Debug, Clone, Default)]
pub struct Device {
    /// Human readable product name, e.g. "ConBee II".
    pub name: String,
    /// USB serial number, empty when unknown.
    pub serial: String,
    /// Raw device path, e.g. `/dev/ttyACM0`.
    pub path: String,
    /// Stable path that survives re-enumeration, e.g.
    /// `/dev/serial/by-id/...`, or empty.
    pub stable_path: String,
}

/// Known device families, keyed to their reset strategy and bootloader
/// dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    /// Unrecognized device path.
    Unknown,
    /// RaspBee (GPIO reset, V1 bootloader).
    RaspBee1,
    /// RaspBee II (GPIO reset, V3 bootloader).
    RaspBee2,
    /// ConBee (FTDI bitbang reset, V1 bootloader).
    ConBee1,
    /// ConBee II (watchdog reset, V3 bootloader).
    ConBee2,
}

/// Ordered path-substring match table; first match wins.
const PATH_PATTERNS: &[(&str, DeviceType)] = &[
    ("ttyACM", DeviceType::ConBee2),
    ("ConBee_II", DeviceType::ConBee2),
    ("cu.usbmodemDE", DeviceType::ConBee2),
    ("ttyUSB", DeviceType::ConBee1),
    ("usb-FTDI", DeviceType::ConBee1),
    ("cu.usbserial", DeviceType::ConBee1),
    ("ttyAMA", DeviceType::RaspBee1),
    ("ttyS", DeviceType::RaspBee1),
    ("/serial", DeviceType::RaspBee1),
];

impl DeviceType {
    /// Classify a device path.
    ///
    /// A serial-attached RaspBee cannot be told apart from a RaspBee II by
    /// its path alone; the firmware image's platform byte refines the
    /// result later (see [`DeviceType::promote`]).
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        if path.is_empty() {
            return Self::Unknown;
        }

        for (pattern, device) in PATH_PATTERNS {
            if path.contains(pattern) {
                return *device;
            }
        }

        Self::Unknown
    }

    /// Promote RaspBee to RaspBee II when the firmware image targets the
    /// R21 platform. All other combinations are unchanged.
    #[must_use]
    pub fn promote(self, fw_is_r21: bool) -> Self {
        if self == Self::RaspBee1 && fw_is_r21 {
            Self::RaspBee2
        } else {
            self
        }
    }

    /// Get a human-readable name for the device type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::RaspBee1 => "RaspBee",
            Self::RaspBee2 => "RaspBee II",
            Self::ConBee1 => "ConBee",
            Self::ConBee2 => "ConBee II",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
