//! # gcfflash
//!
//! Firmware update engine for dresden elektronik Zigbee coprocessors
//! (ConBee USB dongles and RaspBee serial-attached radios).
//!
//! The crate drives a device from its running application firmware into a
//! bootloader, negotiates one of two bootloader dialects, uploads a GCF
//! firmware image and verifies completion — all over a single serial
//! transport, with retries bounded by a wall-clock deadline.
//!
//! ## Architecture
//!
//! ```text
//! +-------------------+        events         +-------------------+
//! |      Engine       | <-------------------- |     Platform      |
//! |  (state machine)  | --------------------> | (serial, timer,   |
//! |                   |     side effects      |  resets, files)   |
//! +-------------------+                       +-------------------+
//! ```
//!
//! The engine is strictly single-threaded and event-driven; all I/O and
//! timing sits behind the [`platform::Platform`] trait. The default
//! `native` feature provides a `serialport`-backed implementation and the
//! blocking event loop.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gcfflash::{Engine, Job, NativePlatform, run};
//!
//! let job = Job {
//!     firmware: Some("deCONZ_ConBeeII_0x26720700.bin.GCF".into()),
//!     device: Some("/dev/ttyACM0".into()),
//!     ..Job::default()
//! };
//!
//! let mut engine = Engine::new(job);
//! let mut platform = NativePlatform::new();
//! std::process::exit(run(&mut engine, &mut platform));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod engine;
pub mod error;
pub mod image;
pub mod platform;
pub mod protocol;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use platform::{NativePlatform, run};
pub use {
    device::{Device, DeviceType},
    engine::{Engine, Event, Job, State, Task},
    error::{Error, Result},
    image::GcfFile,
    platform::Platform,
};
