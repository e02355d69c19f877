//! Brightway DFU flasher driver.
//!
//! The protocol is a mixed ASCII/binary command stream at 19200 8N1: after a
//! binary UID handshake, the host authenticates with a per-UID
//! challenge/response (signed with tables read out of the firmware image
//! itself), then streams the image in 2048-byte packets of sixteen CRC16
//! framed 128-byte chunks, accounting for every packet with a cumulative
//! CRC32, and finally verifies and activates the new image.

use crate::{
    firmware::SigningOffsets,
    flasher::{Error, Options},
    keygen::{self, Tables},
    link::{ByteLink, Clock},
    utils::{crc16_xmodem, hex_upper, Crc32},
    Callbacks, CancelToken,
};
use std::{sync::Arc, time::Duration};

pub const PACKET_SIZE: usize = 0x800;
pub const CHUNK_SIZE: usize = 0x80;
pub const CHUNKS_PER_PACKET: usize = PACKET_SIZE / CHUNK_SIZE;
/// Attempts per chunk (and per connection-test state) before giving up.
pub const MAX_REPEATS: usize = 20;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

const CMD_GET_UID: [u8; 4] = [0x53, 0x2A, 0x7D, 0xAC];
const UID_FRAME_START: u8 = 0x64;
const UID_FRAME_END: u8 = 0x9B;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Uid,
    VerInit,
    Init,
    BleRand,
    McuRand,
    McuKey,
    NvmWrite,
    SendFw,
    WrInfo,
    DfuVerify,
    DfuActive,
    VerDone,
    Done,
}

pub struct Dfu {
    fw: Arc<[u8]>,
    tables: Tables,

    state: State,
    prev_state: State,
    uid: [u8; 16],
    ble_rand: [u8; 16],
    mcu_rand: [u8; 16],
    n_packets_sent: usize,
    total_packets: usize,
    /// Running CRC32 over every (padded) packet committed so far, reported
    /// with each `wr_info`.
    sent_crc: Crc32,

    debug: bool,
    callbacks: Callbacks,
    cancel: CancelToken,
    #[cfg(feature = "log")]
    logger: slog::Logger,
}

impl Dfu {
    /// Binds the driver to an ingested image. Fails with
    /// [`Error::InvalidFirmware`] when the signing patterns are missing,
    /// ambiguous, or the signing tables fall outside the image.
    pub fn new(fw: Arc<[u8]>, options: Options) -> Result<Self, Error> {
        let offsets = SigningOffsets::find(&fw).ok_or(Error::InvalidFirmware)?;
        let tables = Tables::extract(&fw, offsets.base).ok_or(Error::InvalidFirmware)?;
        let total_packets = fw.len().div_ceil(PACKET_SIZE);

        Ok(Dfu {
            tables,
            state: State::Uid,
            prev_state: State::Uid,
            uid: [0; 16],
            // Client-chosen challenge, fixed to 01 02 .. 10.
            ble_rand: core::array::from_fn(|i| i as u8 + 1),
            mcu_rand: [0; 16],
            n_packets_sent: 0,
            total_packets,
            sent_crc: Crc32::new(),
            debug: options.debug,
            callbacks: options.callbacks,
            cancel: options.cancel,
            #[cfg(feature = "log")]
            logger: options.logger.new(slog::o!("flasher" => "dfu")),
            fw,
        })
    }

    pub fn firmware(&self) -> &Arc<[u8]> {
        &self.fw
    }

    /// Runs the whole flash to completion. The DFU protocol is purely
    /// request/response paced by read timeouts, so the clock goes unused
    /// here; it's part of the driver surface shared with the Leqi side.
    pub fn run(&mut self, link: &mut dyn ByteLink, _clock: &mut dyn Clock) -> Result<(), Error> {
        while self.state != State::Done {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match self.state {
                State::Uid => {
                    self.emit_state("Fetching UID");
                    self.get_uid(link)?;
                }
                State::VerInit | State::VerDone => {
                    self.emit_state("Reading MCU version");
                    self.get_ver(link)?;
                }
                State::Init => {
                    self.emit_state("Sending 'rd_info'");
                    self.send_rd_info(link)?;
                }
                State::BleRand => {
                    self.emit_state("Sending BLE challenge");
                    self.send_ble_rand(link)?;
                }
                State::McuRand => {
                    self.emit_state("Requesting MCU challenge");
                    self.request_mcu_rand(link)?;
                }
                State::McuKey => {
                    self.emit_state("Answering MCU challenge");
                    self.send_mcu_key(link)?;
                }
                State::NvmWrite => {
                    self.emit_state("Selecting NVM write offset");
                    self.send_nvm_write(link)?;
                }
                State::SendFw => {
                    self.emit_state("Sending firmware packet");
                    self.send_fw_packet(link)?;
                }
                State::WrInfo => {
                    self.emit_state("Committing packet info");
                    self.send_wr_info(link)?;
                }
                State::DfuVerify => {
                    self.emit_state("Verifying update");
                    self.verify_dfu(link)?;
                }
                State::DfuActive => {
                    self.emit_state("Activating update");
                    self.activate_dfu(link)?;
                }
                State::Done => unreachable!(),
            }

            self.emit_progress();
        }
        self.emit_state("Update complete, enjoy!");
        Ok(())
    }

    /// Walks the first two protocol states to prove the device is there,
    /// without flashing anything.
    pub fn test_connection(
        &mut self,
        link: &mut dyn ByteLink,
        _clock: &mut dyn Clock,
    ) -> Result<(), Error> {
        let mut retries = 0;
        while self.state != State::Init {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if self.state != self.prev_state {
                retries = 0;
            }
            if retries == MAX_REPEATS {
                return Err(Error::ConnectionFailed);
            }

            match self.state {
                State::Uid => {
                    self.emit_state("Fetching UID");
                    self.get_uid(link)?;
                }
                State::VerInit => {
                    self.emit_state("Reading MCU version");
                    self.get_ver(link)?;
                }
                _ => unreachable!(),
            }
            retries += 1;
        }

        self.callbacks.log("Successfully established connection!");
        self.callbacks.progress(100);
        Ok(())
    }

    fn emit_state(&mut self, text: &str) {
        if self.prev_state != self.state {
            self.callbacks.status(text);
        }
        self.prev_state = self.state;
    }

    fn emit_progress(&self) {
        let percent = (self.n_packets_sent * 100 / self.total_packets).min(100);
        self.callbacks.progress(percent as u8);
    }

    fn debug_log(&self, message: &str) {
        if self.debug {
            self.callbacks.log(&format!("(DEBUG) {message}"));
        }
    }

    fn send(&self, link: &mut dyn ByteLink, bytes: &[u8]) -> Result<(), Error> {
        self.debug_log(&format!("Sending: {}", hex_upper(bytes)));
        #[cfg(feature = "log")]
        slog::trace!(self.logger, "tx"; "bytes" => hex_upper(bytes));
        link.write(bytes)?;
        link.flush()?;
        Ok(())
    }

    fn receive(
        &self,
        link: &mut dyn ByteLink,
        terminator: u8,
        max_bytes: usize,
    ) -> Result<Vec<u8>, Error> {
        let response = link.read_until(terminator, max_bytes, READ_TIMEOUT)?;
        self.debug_log(&format!("Got response: {}", hex_upper(&response)));
        #[cfg(feature = "log")]
        slog::trace!(self.logger, "rx"; "bytes" => hex_upper(&response));
        Ok(response)
    }

    fn get_uid(&mut self, link: &mut dyn ByteLink) -> Result<(), Error> {
        self.send(link, &CMD_GET_UID)?;
        let response = self.receive(link, UID_FRAME_END, 21)?;

        // Accept `64 2A 10 <uid:16> .. 9B`, tolerating leading noise.
        let Some(start) = response.iter().position(|&byte| byte == UID_FRAME_START) else {
            return Ok(());
        };
        let frame = &response[start..];
        if frame.last() == Some(&UID_FRAME_END)
            && frame.len() >= 19
            && frame[1] == CMD_GET_UID[1]
            && frame[2] == 0x10
        {
            self.uid.copy_from_slice(&frame[3..19]);
            self.callbacks
                .log(&format!("> Got UID: {}", String::from_utf8_lossy(&self.uid)));
            self.state = State::VerInit;
        }
        Ok(())
    }

    fn get_ver(&mut self, link: &mut dyn ByteLink) -> Result<(), Error> {
        self.send(link, b"down get_ver\r")?;
        let response = self.receive(link, b'\r', 64)?;
        if response.last() != Some(&b'\r') {
            return Ok(());
        }
        let version = String::from_utf8_lossy(&response[..response.len() - 1]).into_owned();
        match self.state {
            State::VerInit => {
                self.callbacks.log(&format!("> MCU Version (before): {version}"));
                self.state = State::Init;
            }
            State::VerDone => {
                self.callbacks.log(&format!("> MCU Version (after): {version}"));
                self.state = State::Done;
            }
            _ => {}
        }
        Ok(())
    }

    fn send_rd_info(&mut self, link: &mut dyn ByteLink) -> Result<(), Error> {
        self.send(link, b"down rd_info\r\x00\x00\x00")?;
        let response = self.receive(link, b'\r', 26)?;
        if response.starts_with(b"ok") {
            self.state = State::BleRand;
        }
        Ok(())
    }

    fn send_ble_rand(&mut self, link: &mut dyn ByteLink) -> Result<(), Error> {
        let expected = keygen::sign_rand(&self.uid, &self.ble_rand, &self.tables);

        let mut cmd = b"down ble_rand ".to_vec();
        cmd.extend_from_slice(&self.ble_rand);
        cmd.push(b'\r');
        self.send(link, &cmd)?;

        let response = link.read_exact(20, READ_TIMEOUT)?;
        self.debug_log(&format!("Got response: {}", hex_upper(&response)));
        if response.starts_with(b"ok") && response.len() >= 19 {
            let ble_key = &response[3..19];
            self.debug_log(&format!("BLE_KEY: {}", hex_upper(ble_key)));
            if ble_key != expected {
                return Err(Error::AuthMismatch);
            }
            self.state = State::McuRand;
        }
        Ok(())
    }

    fn request_mcu_rand(&mut self, link: &mut dyn ByteLink) -> Result<(), Error> {
        self.send(link, b"down mcu_rand\r")?;
        let response = link.read_exact(20, READ_TIMEOUT)?;
        self.debug_log(&format!("Got response: {}", hex_upper(&response)));
        if response.starts_with(b"ok") && response.len() >= 19 {
            self.mcu_rand.copy_from_slice(&response[3..19]);
            self.debug_log(&format!("MCU_RAND: {}", hex_upper(&self.mcu_rand)));
            self.state = State::McuKey;
        }
        Ok(())
    }

    fn send_mcu_key(&mut self, link: &mut dyn ByteLink) -> Result<(), Error> {
        let mcu_key = keygen::sign_rand(&self.uid, &self.mcu_rand, &self.tables);
        let mut cmd = b"down mcu_key ".to_vec();
        cmd.extend_from_slice(&mcu_key);
        cmd.push(b'\r');
        self.send(link, &cmd)?;

        let response = self.receive(link, b'\r', 16)?;
        if response == b"ok\r" {
            self.state = State::NvmWrite;
        }
        Ok(())
    }

    fn send_nvm_write(&mut self, link: &mut dyn ByteLink) -> Result<(), Error> {
        let offset = self.n_packets_sent * PACKET_SIZE;
        let cmd = format!("down nvm_write {offset:08X}\r");
        self.debug_log(cmd.trim_end());
        self.send(link, cmd.as_bytes())?;
        let response = self.receive(link, b'\r', 16)?;
        if contains_ack(&response) {
            self.state = State::SendFw;
        }
        Ok(())
    }

    /// The current packet as a view into the image: offset plus the
    /// right-pad-with-`0xFF` rule; chunks are materialized one frame at a
    /// time.
    fn packet_chunk(&self, chunk_index: usize) -> [u8; CHUNK_SIZE] {
        let mut chunk = [0xFF; CHUNK_SIZE];
        let start = self.n_packets_sent * PACKET_SIZE + chunk_index * CHUNK_SIZE;
        if start < self.fw.len() {
            let end = (start + CHUNK_SIZE).min(self.fw.len());
            chunk[..end - start].copy_from_slice(&self.fw[start..end]);
        }
        chunk
    }

    fn send_fw_packet(&mut self, link: &mut dyn ByteLink) -> Result<(), Error> {
        for n in 1..=CHUNKS_PER_PACKET {
            let chunk = self.packet_chunk(n - 1);
            let frame = chunk_frame(n, &chunk);

            let mut acked = false;
            for _ in 0..MAX_REPEATS {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                self.send(link, &frame)?;
                let response = self.receive(link, ACK, 16)?;
                match response.last() {
                    Some(&ACK) => {
                        acked = true;
                        break;
                    }
                    Some(&NAK) => return Err(Error::CrcFail),
                    _ => {}
                }
            }
            if !acked {
                return Err(Error::NoAck);
            }
        }

        // Packet terminator; the confirmation is best-effort.
        self.send(link, &[0x04, 0x04, 0x04])?;
        let _ = self.receive(link, ACK, 3)?;

        for n in 0..CHUNKS_PER_PACKET {
            self.sent_crc.update(&self.packet_chunk(n));
        }
        self.n_packets_sent += 1;
        self.state = State::WrInfo;
        Ok(())
    }

    fn send_wr_info(&mut self, link: &mut dyn ByteLink) -> Result<(), Error> {
        let crc = self.sent_crc.finish();
        let cmd = format!(
            "down wr_info {} {:08x} {}\r",
            self.n_packets_sent,
            crc,
            self.n_packets_sent * PACKET_SIZE
        );
        self.debug_log(cmd.trim_end());
        self.send(link, cmd.as_bytes())?;

        let response = self.receive(link, b'\r', 16)?;
        if contains_ack(&response) {
            self.state = if self.n_packets_sent < self.total_packets {
                State::NvmWrite
            } else {
                State::DfuVerify
            };
        }
        Ok(())
    }

    fn verify_dfu(&mut self, link: &mut dyn ByteLink) -> Result<(), Error> {
        self.send(link, b"down dfu_verify\r")?;
        let response = self.receive(link, b'\r', 16)?;
        if contains_ack(&response) {
            self.debug_log("Firmware update verified successfully");
            self.state = State::DfuActive;
        } else if contains_reject(&response) {
            return Err(Error::VerifyFailed);
        }
        Ok(())
    }

    fn activate_dfu(&mut self, link: &mut dyn ByteLink) -> Result<(), Error> {
        self.send(link, b"down dfu_active\r")?;
        let response = self.receive(link, b'\r', 16)?;
        if contains_ack(&response) {
            self.callbacks.log("> Firmware update completed successfully!");
            self.state = State::VerDone;
        } else if contains_reject(&response) {
            return Err(Error::ActivateFailed);
        }
        Ok(())
    }
}

/// Frames one 128-byte chunk: `01 <n> <0xFF - n> <data> <crc16_be>`, CRC
/// over the data alone. `n` counts from 1.
fn chunk_frame(n: usize, chunk: &[u8; CHUNK_SIZE]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(CHUNK_SIZE + 5);
    frame.push(0x01);
    frame.push(n as u8);
    frame.push(0xFF - n as u8);
    frame.extend_from_slice(chunk);
    frame.extend_from_slice(&crc16_xmodem(chunk).to_be_bytes());
    frame
}

fn contains_ack(response: &[u8]) -> bool {
    response.windows(2).any(|window| window == b"k\r")
}

fn contains_reject(response: &[u8]) -> bool {
    response.windows(2).any(|window| window == b"r\r")
}
