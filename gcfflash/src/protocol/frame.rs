//! Byte-stuffed serial framing shared by the application protocol and the
//! V3 bootloader.
//!
//! ## Frame Format
//!
//! ```text
//! +------+----------------------+------------+------+
//! | 0xC0 |   stuffed payload    | CRC16 (LE) | 0xC0 |
//! +------+----------------------+------------+------+
//! ```
//!
//! The checksum is the two's complement of the 16-bit byte sum of the
//! unstuffed payload, so the receiver's recomputed sum plus the stored
//! checksum cancels to zero. Flag and escape bytes inside payload or
//! checksum are stuffed: `0xC0` becomes `0xDB 0xDC`, `0xDB` becomes
//! `0xDB 0xDD`.

use log::trace;

use crate::protocol::crc::frame_crc;

/// Frame delimiter.
pub const END: u8 = 0xC0;

/// Escape introducer.
pub const ESC: u8 = 0xDB;

/// Escaped form of [`END`].
pub const ESC_END: u8 = 0xDC;

/// Escaped form of [`ESC`].
pub const ESC_ESC: u8 = 0xDD;

/// Largest accepted unstuffed frame (payload + checksum). Legal packets in
/// both protocols stay well below this.
const MAX_FRAME_SIZE: usize = 4096;

fn put_stuffed(out: &mut Vec<u8>, byte: u8) {
    match byte {
        END => {
            out.push(ESC);
            out.push(ESC_END);
        },
        ESC => {
            out.push(ESC);
            out.push(ESC_ESC);
        },
        _ => out.push(byte),
    }
}

/// Encode `payload` into a complete flagged frame ready for the transport.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 6);

    out.push(END);
    for &byte in payload {
        put_stuffed(&mut out, byte);
    }

    let crc = frame_crc(payload);
    put_stuffed(&mut out, (crc & 0xFF) as u8);
    put_stuffed(&mut out, (crc >> 8) as u8);
    out.push(END);

    out
}

/// Streaming frame receiver.
///
/// Feed arbitrary chunks of transport bytes; every completed, checksum-valid
/// frame is handed to the upcall exactly once. Malformed frames (bad
/// checksum, short frames, invalid escapes, oversize) are dropped silently
/// and the decoder resynchronizes on the next flag byte.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
    escaped: bool,
    /// Frame poisoned by an invalid escape or overflow; discard at next flag.
    poisoned: bool,
}

impl Decoder {
    /// Create a decoder in its initial state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume `data`, invoking `on_packet` for each completed frame payload
    /// (checksum stripped).
    pub fn feed<F>(&mut self, data: &[u8], mut on_packet: F)
    where
        F: FnMut(&[u8]),
    {
        for &byte in data {
            if byte == END {
                self.end_of_frame(&mut on_packet);
                continue;
            }

            if self.escaped {
                self.escaped = false;
                match byte {
                    ESC_END => self.push(END),
                    ESC_ESC => self.push(ESC),
                    other => {
                        trace!("frame: invalid escape 0x{other:02X}");
                        self.poisoned = true;
                    },
                }
            } else if byte == ESC {
                self.escaped = true;
            } else {
                self.push(byte);
            }
        }
    }

    fn push(&mut self, byte: u8) {
        if self.buf.len() >= MAX_FRAME_SIZE {
            trace!("frame: oversize, dropping");
            self.poisoned = true;
            self.buf.clear();
        } else {
            self.buf.push(byte);
        }
    }

    fn end_of_frame<F>(&mut self, on_packet: &mut F)
    where
        F: FnMut(&[u8]),
    {
        let poisoned = self.poisoned || self.escaped;
        self.poisoned = false;
        self.escaped = false;

        if poisoned {
            self.buf.clear();
            return;
        }

        // Empty frames are separators between back-to-back frames.
        if self.buf.is_empty() {
            return;
        }

        if self.buf.len() < 3 {
            trace!("frame: underrun ({} bytes)", self.buf.len());
            self.buf.clear();
            return;
        }

        let payload_len = self.buf.len() - 2;
        let stored =
            u16::from(self.buf[payload_len]) | (u16::from(self.buf[payload_len + 1]) << 8);

        if stored == frame_crc(&self.buf[..payload_len]) {
            on_packet(&self.buf[..payload_len]);
        } else {
            trace!("frame: checksum mismatch, {} bytes dropped", self.buf.len());
        }

        self.buf.clear();
    }
}
