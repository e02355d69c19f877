//! Leqi flasher driver.
//!
//! Pure binary protocol at 19200 8N1: every request is a `5A 12` framed
//! packet with an XMODEM CRC16 trailer, every response starts with `5A 21`.
//! The transfer is three phases: a start command carrying the derived
//! firmware size, offset-addressed 128-byte data writes, and a finalize
//! command retried on a short timeout.

use crate::{
    firmware,
    flasher::{Error, Options},
    link::{ByteLink, Clock},
    utils::{crc16_xmodem, hex_upper},
    Callbacks, CancelToken, FirmwareKind,
};
use std::{sync::Arc, time::Duration};

pub const CHUNK_SIZE: usize = 128;
/// Finalize attempts before the update is declared failed.
pub const MAX_END_ATTEMPTS: usize = 10;

const REQUEST_HEADER: [u8; 2] = [0x5A, 0x12];
const RESPONSE_HEADER: u8 = 0x5A;
const RESPONSE_DEVICE: u8 = 0x21;

const CMD_START: u8 = 0x03;
const CMD_DATA: u8 = 0x04;
const CMD_END: u8 = 0x05;

const STATUS_OK: u8 = 0x01;

const READ_TIMEOUT: Duration = Duration::from_millis(2000);
const END_READ_TIMEOUT: Duration = Duration::from_millis(400);
/// Pause after each write before looking for the response.
const RESPONSE_DELAY: Duration = Duration::from_millis(50);
const CHUNK_DELAY: Duration = Duration::from_millis(44);
const END_BACKOFF: Duration = Duration::from_millis(60);
/// Controller settle time between the last chunk and the end command.
const SETTLE_DELAY: Duration = Duration::from_millis(690);

/// Minimum length of the `0xAA` padding run that marks the end of the live
/// image.
const PADDING_RUN_THRESHOLD: usize = 500;

pub struct Leqi {
    fw: Arc<[u8]>,
    fw_size: usize,

    debug: bool,
    callbacks: Callbacks,
    cancel: CancelToken,
    #[cfg(feature = "log")]
    logger: slog::Logger,
}

/// Derives the transfer size: the end of the longest `0xAA` run longer than
/// [`PADDING_RUN_THRESHOLD`], rounded up to a whole chunk. Images without
/// such a run are sent whole.
pub fn derive_fw_size(fw: &[u8]) -> usize {
    let mut best_len = 0;
    let mut best_end = 0;

    let mut i = 0;
    while i < fw.len() {
        if fw[i] == 0xAA {
            let start = i;
            while i < fw.len() && fw[i] == 0xAA {
                i += 1;
            }
            let len = i - start;
            if len > best_len && len > PADDING_RUN_THRESHOLD {
                best_len = len;
                best_end = i;
            }
        } else {
            i += 1;
        }
    }

    if best_end > 0 {
        best_end.div_ceil(CHUNK_SIZE) * CHUNK_SIZE
    } else {
        fw.len()
    }
}

impl Leqi {
    pub fn new(fw: Arc<[u8]>, options: Options) -> Result<Self, Error> {
        if firmware::classify(&fw) != FirmwareKind::Leqi {
            return Err(Error::UnsupportedFirmware(firmware::classify(&fw)));
        }
        let fw_size = derive_fw_size(&fw);

        let leqi = Leqi {
            fw_size,
            debug: options.debug,
            callbacks: options.callbacks,
            cancel: options.cancel,
            #[cfg(feature = "log")]
            logger: options.logger.new(slog::o!("flasher" => "leqi")),
            fw,
        };
        leqi.callbacks
            .log(&format!("Loaded Leqi firmware: {} bytes", leqi.fw.len()));
        leqi.callbacks.log(&format!(
            "Firmware size (AA padding end): 0x{:X} ({} bytes)",
            leqi.fw_size, leqi.fw_size
        ));
        Ok(leqi)
    }

    pub fn firmware(&self) -> &Arc<[u8]> {
        &self.fw
    }

    pub fn fw_size(&self) -> usize {
        self.fw_size
    }

    pub fn run(&mut self, link: &mut dyn ByteLink, clock: &mut dyn Clock) -> Result<(), Error> {
        self.callbacks
            .status("Sending firmware update start command...");
        self.send_start(link, clock)?;

        self.callbacks.status("Sending firmware data...");
        self.send_data(link, clock)?;

        self.callbacks.status("Finalizing firmware update...");
        self.send_end(link, clock)?;

        self.callbacks.log("Leqi firmware update completed");
        self.callbacks.progress(100);
        Ok(())
    }

    /// The Leqi bootloader answers no probe command; reaching it at all (the
    /// caller opened the port) is the whole connection test.
    pub fn test_connection(&mut self) -> Result<(), Error> {
        self.callbacks.log("Serial port opened successfully");
        self.callbacks.progress(100);
        Ok(())
    }

    fn debug_log(&self, message: &str) {
        if self.debug {
            self.callbacks.log(&format!("(DEBUG) {message}"));
        }
    }

    fn send_start(&mut self, link: &mut dyn ByteLink, clock: &mut dyn Clock) -> Result<(), Error> {
        let mut body = vec![0x31, 0x00];
        body.extend_from_slice(&(self.fw_size as u16).to_le_bytes());
        body.extend_from_slice(&[0x00, 0x00]);
        let packet = frame(CMD_START, &body);

        let response = self.send_and_receive(link, clock, &packet, "Start", READ_TIMEOUT)?;
        if !response_matches(response.as_deref(), CMD_START) {
            return Err(Error::StartRejected);
        }
        self.callbacks.log("Start command acknowledged");
        self.callbacks.progress(5);
        Ok(())
    }

    fn send_data(&mut self, link: &mut dyn ByteLink, clock: &mut dyn Clock) -> Result<(), Error> {
        let total_chunks = self.fw_size.div_ceil(CHUNK_SIZE);
        let mut failed_chunks = 0;

        for k in 0..total_chunks {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let offset = k * CHUNK_SIZE;
            let mut body = Vec::with_capacity(4 + CHUNK_SIZE);
            body.extend_from_slice(&(offset as u32).to_le_bytes());
            let end = (offset + CHUNK_SIZE).min(self.fw_size).min(self.fw.len());
            if offset < end {
                body.extend_from_slice(&self.fw[offset..end]);
            }
            body.resize(4 + CHUNK_SIZE, 0xFF);
            let packet = frame(CMD_DATA, &body);

            let description = format!("Chunk {} @ 0x{offset:04X}", k + 1);
            let response =
                self.send_and_receive(link, clock, &packet, &description, READ_TIMEOUT)?;
            match response.as_deref() {
                None => {
                    self.callbacks
                        .log(&format!("WARNING: No response for chunk {}", k + 1));
                    failed_chunks += 1;
                }
                Some(response) if !response_matches(Some(response), CMD_DATA) => {
                    self.callbacks.log(&format!(
                        "WARNING: Invalid response format for chunk {}",
                        k + 1
                    ));
                    failed_chunks += 1;
                }
                Some(response) if response[4] != STATUS_OK => {
                    self.callbacks.log(&format!(
                        "ERROR: Chunk {} rejected (status=0x{:02X})",
                        k + 1,
                        response[4]
                    ));
                    failed_chunks += 1;
                }
                Some(_) => {}
            }

            let percent = 5 + (85 * k + total_chunks / 2) / total_chunks;
            self.callbacks.progress(percent as u8);
            if (k + 1) % 10 == 0 {
                self.callbacks.log(&format!(
                    "Progress: {}/{} chunks ({percent}%)",
                    k + 1,
                    total_chunks
                ));
            }

            clock.sleep(CHUNK_DELAY);
        }

        if failed_chunks > 0 {
            return Err(Error::ChunkRejected {
                count: failed_chunks,
            });
        }
        self.callbacks
            .log(&format!("Sent {total_chunks} chunks successfully"));

        clock.sleep(SETTLE_DELAY);
        Ok(())
    }

    fn send_end(&mut self, link: &mut dyn ByteLink, clock: &mut dyn Clock) -> Result<(), Error> {
        let packet = frame(CMD_END, &[]);

        for attempt in 1..=MAX_END_ATTEMPTS {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if attempt > 1 {
                self.callbacks
                    .log(&format!("Retry {attempt}/{MAX_END_ATTEMPTS}..."));
                clock.sleep(END_BACKOFF);
            }

            let description = format!("End (attempt {attempt})");
            let response =
                self.send_and_receive(link, clock, &packet, &description, END_READ_TIMEOUT)?;
            if response_matches(response.as_deref(), CMD_END) {
                self.callbacks.log("End command acknowledged");
                return Ok(());
            }
        }
        Err(Error::EndFailed)
    }

    fn send_and_receive(
        &mut self,
        link: &mut dyn ByteLink,
        clock: &mut dyn Clock,
        packet: &[u8],
        description: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, Error> {
        link.drain_input()?;
        link.write(packet)?;
        link.flush()?;
        self.debug_log(&format!("TX [{description}]: {}", hex_upper(packet)));
        #[cfg(feature = "log")]
        slog::trace!(self.logger, "tx"; "frame" => description, "bytes" => hex_upper(packet));

        clock.sleep(RESPONSE_DELAY);

        let response = read_response(link, clock, timeout)?;
        match &response {
            Some(bytes) => {
                self.debug_log(&format!("RX: {} ({} bytes)", hex_upper(bytes), bytes.len()));
                #[cfg(feature = "log")]
                slog::trace!(self.logger, "rx"; "bytes" => hex_upper(bytes));
            }
            None => self.debug_log("RX: <timeout>"),
        }
        Ok(response)
    }
}

/// Builds a request packet: `5A 12 <cmd> <len> <body> <crc16_be>`, CRC over
/// everything before it.
fn frame(cmd: u8, body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(body.len() + 6);
    packet.extend_from_slice(&REQUEST_HEADER);
    packet.push(cmd);
    packet.push(body.len() as u8);
    packet.extend_from_slice(body);
    let crc = crc16_xmodem(&packet);
    packet.extend_from_slice(&crc.to_be_bytes());
    packet
}

/// Structural response check: device header, command echo. The response CRC
/// is tolerated unverified, like the controllers themselves do.
fn response_matches(response: Option<&[u8]>, cmd: u8) -> bool {
    match response {
        Some(response) => {
            response.len() >= 5 && response[1] == RESPONSE_DEVICE && response[2] == cmd
        }
        None => false,
    }
}

/// Scans for the `0x5A` response header, discarding inter-frame noise, then
/// collects up to the 7-byte response within the deadline.
fn read_response(
    link: &mut dyn ByteLink,
    clock: &mut dyn Clock,
    timeout: Duration,
) -> Result<Option<Vec<u8>>, Error> {
    let deadline = clock.now() + timeout;

    loop {
        let now = clock.now();
        if now >= deadline {
            return Ok(None);
        }
        let byte = link.read_exact(1, deadline - now)?;
        match byte.first() {
            None => return Ok(None),
            Some(&RESPONSE_HEADER) => break,
            Some(_) => {}
        }
    }

    let mut response = vec![RESPONSE_HEADER];
    while response.len() < 7 {
        let now = clock.now();
        if now >= deadline {
            break;
        }
        let chunk = link.read_exact(7 - response.len(), deadline - now)?;
        if chunk.is_empty() {
            break;
        }
        response.extend_from_slice(&chunk);
    }
    Ok(Some(response))
}
