//! Dispatching a firmware image to the right driver, and the surface the
//! host application talks to.

use crate::{
    dfu::Dfu,
    firmware::{self, FirmwareInfo, IngestError},
    leqi::Leqi,
    link::{
        sim::{DfuDeviceSim, LeqiDeviceSim},
        ByteLink, Clock, LinkError, SerialLink, SystemClock, BAUD_RATE,
    },
    FirmwareKind,
};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("no flasher available for {} firmware", .0.name())]
    UnsupportedFirmware(FirmwareKind),
    #[error("invalid or unsupported firmware file")]
    InvalidFirmware,
    #[error("BLE key does not match; wrong UID or wrong firmware for this device")]
    AuthMismatch,
    #[error("device reported a CRC failure")]
    CrcFail,
    #[error(
        "no valid ACK after {} retries; check the serial adapter and make sure \
         the firmware file is valid for this device",
        crate::dfu::MAX_REPEATS
    )]
    NoAck,
    #[error("firmware verification failed")]
    VerifyFailed,
    #[error("firmware activation failed")]
    ActivateFailed,
    #[error("controller rejected the update start command")]
    StartRejected,
    #[error("{count} chunks had invalid or missing responses")]
    ChunkRejected { count: usize },
    #[error(
        "no valid response to the end command after {} attempts",
        crate::leqi::MAX_END_ATTEMPTS
    )]
    EndFailed,
    #[error("max retries reached; check your connection")]
    ConnectionFailed,
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag, checked by the drivers at every state
/// transition and retry.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Host-supplied event sinks. All three are best-effort and must not panic;
/// the drivers call them from whatever thread `run()` is blocked on.
#[derive(Default)]
pub struct Callbacks {
    log: Option<Box<dyn Fn(&str) + Send>>,
    status: Option<Box<dyn Fn(&str) + Send>>,
    progress: Option<Box<dyn Fn(u8) + Send>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_log(mut self, f: impl Fn(&str) + Send + 'static) -> Self {
        self.log = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_status(mut self, f: impl Fn(&str) + Send + 'static) -> Self {
        self.status = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_progress(mut self, f: impl Fn(u8) + Send + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub(crate) fn log(&self, message: &str) {
        if let Some(f) = &self.log {
            f(message);
        }
    }

    pub(crate) fn status(&self, message: &str) {
        if let Some(f) = &self.status {
            f(message);
        }
    }

    pub(crate) fn progress(&self, percent: u8) {
        if let Some(f) = &self.progress {
            f(percent);
        }
    }
}

/// Everything a driver needs besides the image and the link.
pub struct Options {
    pub port: String,
    pub simulation: bool,
    pub debug: bool,
    pub callbacks: Callbacks,
    pub cancel: CancelToken,
    #[cfg(feature = "log")]
    pub logger: slog::Logger,
}

impl Options {
    pub fn new(port: impl Into<String>) -> Self {
        Options {
            port: port.into(),
            simulation: false,
            debug: false,
            callbacks: Callbacks::new(),
            cancel: CancelToken::new(),
            #[cfg(feature = "log")]
            logger: slog::Logger::root(slog::Discard, slog::o!()),
        }
    }
}

enum Driver {
    Dfu(Dfu),
    Leqi(Leqi),
}

/// A loaded firmware image bound to the driver that knows how to flash it.
pub struct Flasher {
    driver: Driver,
    port: String,
    simulation: bool,
}

impl std::fmt::Debug for Flasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flasher")
            .field("port", &self.port)
            .field("simulation", &self.simulation)
            .finish_non_exhaustive()
    }
}

/// Ingests the file at `path`, classifies it, and constructs the matching
/// driver.
pub fn create(path: &Path, options: Options) -> Result<Flasher, Error> {
    let fw = firmware::ingest_file(path)?;
    create_from_image(&fw, options)
}

/// As [`create`], for an already-ingested image.
pub fn create_from_image(fw: &Arc<[u8]>, options: Options) -> Result<Flasher, Error> {
    let port = options.port.clone();
    let simulation = options.simulation;
    let driver = match firmware::classify(fw) {
        FirmwareKind::Dfu => Driver::Dfu(Dfu::new(fw.clone(), options)?),
        FirmwareKind::Leqi => Driver::Leqi(Leqi::new(fw.clone(), options)?),
        kind => return Err(Error::UnsupportedFirmware(kind)),
    };
    Ok(Flasher {
        driver,
        port,
        simulation,
    })
}

impl Flasher {
    pub fn kind(&self) -> FirmwareKind {
        match &self.driver {
            Driver::Dfu(_) => FirmwareKind::Dfu,
            Driver::Leqi(_) => FirmwareKind::Leqi,
        }
    }

    pub fn info(&self) -> FirmwareInfo {
        firmware::info(self.firmware())
    }

    pub fn firmware(&self) -> &Arc<[u8]> {
        match &self.driver {
            Driver::Dfu(dfu) => dfu.firmware(),
            Driver::Leqi(leqi) => leqi.firmware(),
        }
    }

    /// Flashes the image. The serial port (or simulator) is acquired on
    /// entry and released on every exit path.
    pub fn run(&mut self) -> Result<(), Error> {
        let mut clock = SystemClock;
        if self.simulation {
            match &mut self.driver {
                Driver::Dfu(dfu) => {
                    let mut link = DfuDeviceSim::new(dfu.firmware());
                    dfu.run(&mut link, &mut clock)
                }
                Driver::Leqi(leqi) => {
                    let mut link = LeqiDeviceSim::new();
                    leqi.run(&mut link, &mut clock)
                }
            }
        } else {
            let mut link = SerialLink::open(&self.port, BAUD_RATE)?;
            self.run_with(&mut link, &mut clock)
        }
    }

    /// Flashes the image over a caller-supplied link.
    pub fn run_with(
        &mut self,
        link: &mut dyn ByteLink,
        clock: &mut dyn Clock,
    ) -> Result<(), Error> {
        match &mut self.driver {
            Driver::Dfu(dfu) => dfu.run(link, clock),
            Driver::Leqi(leqi) => leqi.run(link, clock),
        }
    }

    /// Verifies the device is reachable without flashing anything.
    pub fn test_connection(&mut self) -> Result<(), Error> {
        let mut clock = SystemClock;
        if self.simulation {
            match &mut self.driver {
                Driver::Dfu(dfu) => {
                    let mut link = DfuDeviceSim::new(dfu.firmware());
                    dfu.test_connection(&mut link, &mut clock)
                }
                Driver::Leqi(leqi) => leqi.test_connection(),
            }
        } else {
            match &mut self.driver {
                Driver::Dfu(dfu) => {
                    let mut link = SerialLink::open(&self.port, BAUD_RATE)?;
                    dfu.test_connection(&mut link, &mut clock)
                }
                Driver::Leqi(leqi) => {
                    // Opening the port is the whole test for Leqi controllers.
                    let _link = SerialLink::open(&self.port, BAUD_RATE)?;
                    leqi.test_connection()
                }
            }
        }
    }
}
