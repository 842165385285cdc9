// Copyright (C) 2026 The hplink authors
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::io;
use std::time::Duration;

use serialport::{DataBits, Parity, SerialPort as SerialPortTrait, StopBits};

// ============================================================================
// SerialPort Trait
// ============================================================================

/// The transport collaborator: everything the protocol engines need from a
/// serial link. Reads are always bounded by a timeout and never block
/// indefinitely; writes are flushed before returning.
pub trait SerialPort: Send {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`. A timeout
    /// surfaces as `ErrorKind::TimedOut`.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

/// Read a single byte. Returns `Ok(None)` on timeout so that blank reads
/// (which the protocol counts) are distinct from transport failures.
pub fn read_byte(port: &mut dyn SerialPort, timeout: Duration) -> io::Result<Option<u8>> {
    let mut buf = [0u8; 1];
    match port.read_timeout(&mut buf, timeout) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(buf[0])),
        Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
        Err(e) => Err(e),
    }
}

/// Fill `buf` completely, allowing `timeout` per read. Returns the number
/// of bytes actually read, which is short of `buf.len()` if the peer went
/// quiet before the buffer filled.
pub fn read_exact_timeout(
    port: &mut dyn SerialPort,
    buf: &mut [u8],
    timeout: Duration,
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match port.read_timeout(&mut buf[filled..], timeout) {
            Ok(0) => return Ok(filled),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(filled),
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Serial link configuration. The calculator link is always 8 data bits and
/// 1 stop bit; only speed, parity and timeouts vary.
#[derive(Debug, Clone, Copy)]
pub struct PortConfig {
    pub baud_rate: u32,
    pub parity: Parity,
    pub write_timeout: Duration,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            baud_rate: 9600,
            parity: Parity::None,
            write_timeout: Duration::from_secs(3),
        }
    }
}

/// Real serial port wrapping the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(port_name: &str, config: PortConfig) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(config.parity)
            .stop_bits(StopBits::One)
            .timeout(config.write_timeout)
            .open()?;

        Ok(RealSerialPort { port })
    }
}

impl SerialPort for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.port
            .set_timeout(timeout)
            .map_err(io::Error::other)?;
        self.port.read(buf)
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub struct MockSerialPort {
    // Data to return on reads (None = timeout)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
        }
    }

    /// Script a run of real bytes (frames, reply packets and the like).
    pub fn push_bytes(responses: &mut Vec<Option<u8>>, bytes: &[u8]) {
        responses.extend(bytes.iter().map(|&b| Some(b)));
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        // Out of responses = timeout
        if self.read_pos >= self.read_buffer.len() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock timeout"));
        }

        // A scripted None = timeout
        if self.read_buffer[self.read_pos].is_none() {
            self.read_pos += 1;
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock timeout"));
        }

        let mut bytes_read = 0;
        while bytes_read < buf.len() && self.read_pos < self.read_buffer.len() {
            match self.read_buffer[self.read_pos] {
                Some(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                    self.read_pos += 1;
                }
                None => break, // stop at the timeout marker
            }
        }

        Ok(bytes_read)
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockSerialPort dropped with {} unconsumed responses",
            self.read_buffer.len() - self.read_pos,
        );

        assert_eq!(
            &self.write_log, &self.expected_writes,
            "MockSerialPort write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}
