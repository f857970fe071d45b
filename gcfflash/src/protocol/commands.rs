//! Application-protocol commands understood by running deCONZ firmware.
//!
//! These frames share the flagged transport with the V3 bootloader but
//! carry no `0x81` magic; the first byte is the command code. All of them
//! fit the write-parameter / read-parameter shape:
//!
//! ```text
//! +---------+-----+--------+------------+----------------+
//! | command | seq | status | length(LE) | payload ...    |
//! +---------+-----+--------+------------+----------------+
//! ```

/// Write-parameter command code.
pub const CMD_WRITE_PARAMETER: u8 = 0x0B;

/// Device-state command code.
pub const CMD_DEVICE_STATE: u8 = 0x07;

/// Read-firmware-version command code.
pub const CMD_READ_FW_VERSION: u8 = 0x0D;

/// Parameter id of the watchdog timeout.
pub const PARAM_WATCHDOG_TTL: u8 = 0x26;

/// Write-parameter frame setting the watchdog timeout to 2 seconds.
///
/// Running firmware acknowledges the write and reboots into its bootloader
/// once the watchdog expires.
pub fn write_watchdog_ttl() -> [u8; 12] {
    [
        CMD_WRITE_PARAMETER,
        0x03, // seq
        0x00, // status
        0x0C, 0x00, // frame length (12)
        0x05, 0x00, // buffer length (5)
        PARAM_WATCHDOG_TTL,
        0x02, 0x00, 0x00, 0x00, // TTL seconds (u32 LE)
    ]
}

/// Read-firmware-version request.
pub fn read_firmware_version() -> [u8; 9] {
    [
        CMD_READ_FW_VERSION,
        0x05, // seq
        0x00, // status
        0x09, 0x00, // frame length (9)
        0x00, 0x00, 0x00, 0x00,
    ]
}

/// Device-state request, used as a keep-alive in the connect task.
pub fn device_state() -> [u8; 8] {
    [
        CMD_DEVICE_STATE,
        0x02, // seq
        0x00, // status
        0x08, 0x00, // frame length (8)
        0x00, 0x00, 0x00,
    ]
}
