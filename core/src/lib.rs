#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_lossless,
    clippy::cast_possible_truncation,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::too_many_lines
)]

pub mod dfu;
pub mod firmware;
pub mod flasher;
pub mod keygen;
pub mod leqi;
pub mod link;
pub mod utils;

pub use flasher::{Callbacks, CancelToken, Error, Flasher, Options};

/// Controller family a firmware image is meant for, detected from the image
/// contents alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirmwareKind {
    /// Brightway controllers, flashed over the ASCII-command DFU protocol.
    Dfu,
    /// Leqi controllers, flashed over the `5A 12` binary packet protocol.
    Leqi,
    /// Ninebot images are recognized (version info only); no flasher driver
    /// exists for them.
    Ninebot,
    Unknown,
}

impl FirmwareKind {
    pub const fn name(self) -> &'static str {
        match self {
            FirmwareKind::Dfu => "Brightway (DFU)",
            FirmwareKind::Leqi => "Leqi",
            FirmwareKind::Ninebot => "Ninebot",
            FirmwareKind::Unknown => "Unknown",
        }
    }
}
