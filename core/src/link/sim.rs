//! Deterministic device simulators.
//!
//! Each simulator implements [`ByteLink`] and answers every request with the
//! canned response a healthy controller would give, so the full state
//! machines can be exercised without hardware. They are not device models:
//! just enough protocol to satisfy the parsers, plus a few failure knobs and
//! counters for the test suite.

use super::{ByteLink, LinkError};
use crate::{
    firmware::SigningOffsets,
    keygen::{self, Tables},
    utils::crc16_xmodem,
};
use std::{collections::VecDeque, sync::Arc, time::Duration};

/// UID reported by the simulated Brightway controller.
pub const SIM_UID: &[u8; 16] = b"foobarfoobar1337";
/// Challenge the simulated controller hands out; fixed for determinism.
pub const SIM_MCU_RAND: [u8; 16] = [
    0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, 0xA8, 0xA9, 0xAA, 0xAB, 0xAC, 0xAD, 0xAE,
    0xAF,
];

/// Simulated Brightway (DFU) controller.
pub struct DfuDeviceSim {
    tables: Option<Tables>,
    rx: VecDeque<u8>,
    ble_key_override: Option<[u8; 16]>,
    nak_chunks: bool,
    chunks_seen: usize,
    packets_seen: usize,
}

impl DfuDeviceSim {
    /// The simulator signs challenges with the same tables the driver reads
    /// from `fw`, so any valid image authenticates against it.
    pub fn new(fw: &Arc<[u8]>) -> Self {
        let tables = SigningOffsets::find(fw)
            .and_then(|offsets| Tables::extract(fw, offsets.base));
        DfuDeviceSim {
            tables,
            rx: VecDeque::new(),
            ble_key_override: None,
            nak_chunks: false,
            chunks_seen: 0,
            packets_seen: 0,
        }
    }

    /// Makes the device answer the BLE challenge with a fixed wrong key.
    pub fn with_ble_key(mut self, key: [u8; 16]) -> Self {
        self.ble_key_override = Some(key);
        self
    }

    /// Makes the device NAK every firmware chunk.
    pub fn with_chunk_nak(mut self) -> Self {
        self.nak_chunks = true;
        self
    }

    pub fn chunks_seen(&self) -> usize {
        self.chunks_seen
    }

    /// Number of `04 04 04` packet terminators received.
    pub fn packets_seen(&self) -> usize {
        self.packets_seen
    }

    fn ble_key(&self, rand: &[u8; 16]) -> [u8; 16] {
        if let Some(key) = self.ble_key_override {
            return key;
        }
        match &self.tables {
            Some(tables) => keygen::sign_rand(SIM_UID, rand, tables),
            None => [0; 16],
        }
    }

    fn respond(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    fn handle_command(&mut self, bytes: &[u8]) {
        if bytes == [0x53, 0x2A, 0x7D, 0xAC] {
            let mut frame = vec![0x64, 0x2A, 0x10];
            frame.extend_from_slice(SIM_UID);
            frame.extend_from_slice(&[0x10, 0x9B]);
            self.respond(&frame);
        } else if bytes == b"down get_ver\r" {
            self.respond(b"0010\r");
        } else if let Some(rand) = bytes
            .strip_prefix(b"down ble_rand ")
            .and_then(|rest| rest.strip_suffix(b"\r"))
            .and_then(|rand| <&[u8; 16]>::try_from(rand).ok())
        {
            let key = self.ble_key(rand);
            let mut reply = b"ok ".to_vec();
            reply.extend_from_slice(&key);
            reply.push(b'\r');
            self.respond(&reply);
        } else if bytes == b"down mcu_rand\r" {
            let mut reply = b"ok ".to_vec();
            reply.extend_from_slice(&SIM_MCU_RAND);
            reply.push(b'\r');
            self.respond(&reply);
        } else if bytes.first() == Some(&0x01) && bytes.len() == 0x85 {
            // Firmware chunk: ACK or NAK.
            self.chunks_seen += 1;
            self.respond(if self.nak_chunks { &[0x15] } else { &[0x06] });
        } else if bytes == [0x04, 0x04, 0x04] {
            self.packets_seen += 1;
            self.respond(&[0x06]);
        } else if bytes.starts_with(b"down ") {
            // rd_info, mcu_key, nvm_write, wr_info, dfu_verify, dfu_active.
            self.respond(b"ok\r");
        }
    }
}

impl ByteLink for DfuDeviceSim {
    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.handle_command(bytes);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    fn read_until(
        &mut self,
        terminator: u8,
        max_bytes: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, LinkError> {
        let mut out = Vec::new();
        while out.len() < max_bytes {
            match self.rx.pop_front() {
                None => break,
                Some(byte) => {
                    out.push(byte);
                    if byte == terminator {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    fn read_exact(&mut self, max_bytes: usize, _timeout: Duration) -> Result<Vec<u8>, LinkError> {
        let take = max_bytes.min(self.rx.len());
        Ok(self.rx.drain(..take).collect())
    }

    fn input_available(&mut self) -> Result<usize, LinkError> {
        Ok(self.rx.len())
    }

    fn drain_input(&mut self) -> Result<(), LinkError> {
        self.rx.clear();
        Ok(())
    }
}

/// Simulated Leqi controller.
pub struct LeqiDeviceSim {
    rx: VecDeque<u8>,
    reject_data: bool,
    silent_end_attempts: usize,
    start_frames: usize,
    data_frames: usize,
    end_frames: usize,
}

impl LeqiDeviceSim {
    pub fn new() -> Self {
        LeqiDeviceSim {
            rx: VecDeque::new(),
            reject_data: false,
            silent_end_attempts: 0,
            start_frames: 0,
            data_frames: 0,
            end_frames: 0,
        }
    }

    /// Makes the device report a non-OK status for every data chunk.
    pub fn with_rejected_data(mut self) -> Self {
        self.reject_data = true;
        self
    }

    /// Makes the device ignore the first `count` end commands.
    pub fn with_silent_end_attempts(mut self, count: usize) -> Self {
        self.silent_end_attempts = count;
        self
    }

    pub fn start_frames(&self) -> usize {
        self.start_frames
    }

    pub fn data_frames(&self) -> usize {
        self.data_frames
    }

    pub fn end_frames(&self) -> usize {
        self.end_frames
    }

    fn respond(&mut self, cmd: u8, status: u8) {
        let mut frame = vec![0x5A, 0x21, cmd, 0x01, status];
        let crc = crc16_xmodem(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
        self.rx.extend(frame);
    }
}

impl Default for LeqiDeviceSim {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteLink for LeqiDeviceSim {
    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if bytes.len() < 4 || bytes[..2] != [0x5A, 0x12] {
            return Ok(());
        }
        match bytes[2] {
            0x03 => {
                self.start_frames += 1;
                self.respond(0x03, 0x01);
            }
            0x04 => {
                self.data_frames += 1;
                let status = if self.reject_data { 0x02 } else { 0x01 };
                self.respond(0x04, status);
            }
            0x05 => {
                self.end_frames += 1;
                if self.end_frames > self.silent_end_attempts {
                    self.respond(0x05, 0x01);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    fn read_until(
        &mut self,
        terminator: u8,
        max_bytes: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, LinkError> {
        let mut out = Vec::new();
        while out.len() < max_bytes {
            match self.rx.pop_front() {
                None => break,
                Some(byte) => {
                    out.push(byte);
                    if byte == terminator {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    fn read_exact(&mut self, max_bytes: usize, _timeout: Duration) -> Result<Vec<u8>, LinkError> {
        let take = max_bytes.min(self.rx.len());
        Ok(self.rx.drain(..take).collect())
    }

    fn input_available(&mut self) -> Result<usize, LinkError> {
        Ok(self.rx.len())
    }

    fn drain_input(&mut self) -> Result<(), LinkError> {
        self.rx.clear();
        Ok(())
    }
}
