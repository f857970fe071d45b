//! Firmware image formats.

pub mod gcf;

pub use gcf::GcfFile;
