//! [`ByteLink`] over a real serial port.

use super::{ByteLink, LinkError};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::{
    io::{self, Read, Write},
    time::{Duration, Instant},
};

pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    /// Opens `port` at `baud`, 8N1, no flow control.
    pub fn open(port: &str, baud: u32) -> Result<Self, LinkError> {
        let port = serialport::new(port, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|source| LinkError::Open {
                port: port.to_owned(),
                source,
            })?;
        Ok(SerialLink { port })
    }

    fn read_byte(&mut self, remaining: Duration) -> Result<Option<u8>, LinkError> {
        self.port.set_timeout(remaining)?;
        let mut byte = [0];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl ByteLink for SerialLink {
    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.port.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LinkError> {
        self.port.flush()?;
        Ok(())
    }

    fn read_until(
        &mut self,
        terminator: u8,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, LinkError> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        while out.len() < max_bytes {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.read_byte(deadline - now)? {
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

    fn read_exact(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        while out.len() < max_bytes {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.read_byte(deadline - now)? {
                None => break,
                Some(byte) => out.push(byte),
            }
        }
        Ok(out)
    }

    fn input_available(&mut self) -> Result<usize, LinkError> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn drain_input(&mut self) -> Result<(), LinkError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
