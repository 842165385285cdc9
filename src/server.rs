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

//! Client for the calculator's XModem server: single-byte command verbs,
//! command-packet replies, and hand-off into the bulk transfer engines for
//! put and get. One [`ServerLink`] per connected session; all operations
//! share the port and run strictly one at a time.

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use log::{debug, info};
use thiserror::Error;

use crate::packet::{self, FrameError};
use crate::protocol::*;
use crate::receiver::{ReceiveFsm, run_receive};
use crate::sender::{SendFsm, run_send};
use crate::serial::{SerialPort, read_byte, read_exact_timeout};
use crate::session::{
    CancelFlag, EventSink, SessionError, SessionOptions, expected_packets,
};

/// Stray bytes from an interrupted transfer are cleared with this short
/// bound before each verb.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// The server needs a moment to walk its directory before the listing
/// reply starts; reading sooner yields a partial header.
const LIST_SETTLE: Duration = Duration::from_millis(300);

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("calculator did not reply")]
    Timeout,

    #[error("malformed reply: {0}")]
    BadReply(String),

    #[error("malformed directory listing")]
    MalformedListing,

    #[error(transparent)]
    Transfer(#[from] SessionError),
}

/// One entry of the remote directory listing.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteVariable {
    pub name: String,
    /// Object prolog address, identifying the type
    pub prolog: u16,
    /// Object size in bytes; half-byte sizes are real, objects are nibble
    /// streams
    pub size: f64,
    pub crc: u16,
}

/// A connected calculator server on the other end of `serial`.
pub struct ServerLink<'a> {
    serial: &'a mut dyn SerialPort,
    opts: SessionOptions,
}

impl<'a> ServerLink<'a> {
    pub fn new(serial: &'a mut dyn SerialPort, opts: SessionOptions) -> ServerLink<'a> {
        ServerLink { serial, opts }
    }

    /// Clear stray bytes left over from an interrupted exchange. Each one
    /// is ACKed so a server stuck waiting for a reply gets unstuck.
    fn drain(&mut self) -> Result<(), ControlError> {
        while let Some(b) = read_byte(self.serial, DRAIN_TIMEOUT)? {
            debug!("drained stray byte {b:#04x}");
            self.serial.write_all(&[ACK])?;
        }
        Ok(())
    }

    fn send_verb(&mut self, verb: u8) -> Result<(), ControlError> {
        self.drain()?;
        debug!("sending verb {:?}", char::from(verb));
        self.serial.write_all(&[verb])?;
        Ok(())
    }

    /// Send a command packet and wait for the server's ACK, resending on
    /// NAK. Blank reads and resends share the retry budget.
    fn send_command(&mut self, body: &[u8]) -> Result<(), ControlError> {
        let frame = packet::encode_command_packet(body);
        self.serial.write_all(&frame)?;
        let mut tries = 0;
        loop {
            match read_byte(self.serial, self.opts.timeout)? {
                Some(ACK) => return Ok(()),
                Some(NAK) => {
                    tries += 1;
                    if tries >= self.opts.retry_limit {
                        return Err(ControlError::Timeout);
                    }
                    self.serial.write_all(&frame)?;
                }
                Some(other) => debug!("ignoring stray byte {other:#04x} awaiting command ACK"),
                None => {
                    tries += 1;
                    if tries >= self.opts.retry_limit {
                        return Err(ControlError::Timeout);
                    }
                }
            }
        }
    }

    /// Read one command-packet reply. The packet is ACKed only when its
    /// checksum verifies; a silent non-ACK is what tells the server to
    /// resend.
    fn read_reply(&mut self) -> Result<Vec<u8>, ControlError> {
        let mut header = [0u8; 2];
        if read_exact_timeout(self.serial, &mut header, self.opts.timeout)? < header.len() {
            return Err(ControlError::Timeout);
        }
        let len = usize::from(header[0]) << 8 | usize::from(header[1]);

        let mut rest = vec![0u8; len + 1];
        if read_exact_timeout(self.serial, &mut rest, self.opts.timeout)? < rest.len() {
            return Err(ControlError::Timeout);
        }

        let mut frame = Vec::with_capacity(len + 3);
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&rest);
        let body = packet::decode_command_packet(&frame)?.to_vec();
        self.serial.write_all(&[ACK])?;
        Ok(body)
    }

    /// Free memory on the calculator, in bytes.
    pub fn memory(&mut self) -> Result<u64, ControlError> {
        self.send_verb(CMD_MEMORY)?;
        let body = self.read_reply()?;
        let text = std::str::from_utf8(&body)
            .map_err(|_| ControlError::BadReply("memory reply is not ASCII".into()))?;
        text.trim()
            .parse()
            .map_err(|_| ControlError::BadReply(format!("memory reply {:?} is not a number", text)))
    }

    /// Variables in the server's current remote directory.
    pub fn listing(&mut self) -> Result<Vec<RemoteVariable>, ControlError> {
        self.send_verb(CMD_LIST)?;
        thread::sleep(LIST_SETTLE);
        let body = self.read_reply()?;
        parse_listing(&body)
    }

    /// Free memory plus a fresh directory listing, the state a browser
    /// needs after any mutating operation.
    pub fn refresh(&mut self) -> Result<(u64, Vec<RemoteVariable>), ControlError> {
        let memory = self.memory()?;
        let vars = self.listing()?;
        Ok((memory, vars))
    }

    /// The server's version banner.
    pub fn version(&mut self) -> Result<String, ControlError> {
        self.send_verb(CMD_VERSION)?;
        let body = self.read_reply()?;
        String::from_utf8(body)
            .map_err(|_| ControlError::BadReply("version reply is not ASCII".into()))
    }

    /// Hand an expression to the calculator for evaluation. No reply; the
    /// server ACKs the command packet and that is the whole exchange.
    pub fn eval(&mut self, expr: &str) -> Result<(), ControlError> {
        info!("eval: {expr}");
        self.send_verb(CMD_EVAL)?;
        self.send_command(expr.as_bytes())
    }

    /// Change the remote directory by evaluating its name.
    pub fn chdir(&mut self, dir: &str) -> Result<(), ControlError> {
        self.eval(dir)
    }

    pub fn home(&mut self) -> Result<(), ControlError> {
        self.eval("HOME")
    }

    pub fn updir(&mut self) -> Result<(), ControlError> {
        self.eval("UPDIR")
    }

    /// End server mode on the calculator. Fire and forget.
    pub fn quit(&mut self) -> Result<(), ControlError> {
        self.send_verb(CMD_QUIT)
    }

    /// Store `source` as variable `name` on the calculator. `size` is the
    /// source length in bytes, used to pace the progress events.
    pub fn put(
        &mut self,
        name: &str,
        source: &mut dyn Read,
        size: u64,
        events: EventSink<'_>,
        cancel: CancelFlag,
    ) -> Result<(), ControlError> {
        info!("put {name} ({size} bytes)");
        self.send_verb(CMD_PUT)?;
        self.send_command(name.as_bytes())?;
        let fsm = SendFsm::new(
            &mut *self.serial,
            source,
            expected_packets(size),
            self.opts,
            events,
            cancel,
        );
        run_send(fsm)?;
        Ok(())
    }

    /// Fetch variable `name` into `sink`. The data arrives zero padded to
    /// a whole block; the caller trims it against the listing size.
    pub fn get(
        &mut self,
        name: &str,
        sink: &mut dyn Write,
        events: EventSink<'_>,
        cancel: CancelFlag,
    ) -> Result<(), ControlError> {
        info!("get {name}");
        self.send_verb(CMD_GET)?;
        self.send_command(name.as_bytes())?;
        let fsm = ReceiveFsm::new(&mut *self.serial, sink, self.opts, events, cancel);
        run_receive(fsm)?;
        Ok(())
    }
}

/// Decode the packed listing body: per variable, a length-prefixed name,
/// then little-endian prolog (2 bytes), size in nibbles (3 bytes) and CRC
/// (2 bytes).
fn parse_listing(body: &[u8]) -> Result<Vec<RemoteVariable>, ControlError> {
    let mut vars = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let name_len = usize::from(rest[0]);
        let record_len = 1 + name_len + 7;
        if rest.len() < record_len {
            return Err(ControlError::MalformedListing);
        }
        // names use the calculator's 8-bit extended charset, not UTF-8;
        // each byte maps to one char
        let name: String = rest[1..1 + name_len].iter().map(|&b| char::from(b)).collect();
        let f = 1 + name_len;
        let prolog = u16::from_le_bytes([rest[f], rest[f + 1]]);
        let nibbles =
            u32::from(rest[f + 2]) | u32::from(rest[f + 3]) << 8 | u32::from(rest[f + 4]) << 16;
        let crc = u16::from_le_bytes([rest[f + 5], rest[f + 6]]);
        vars.push(RemoteVariable {
            name,
            prolog,
            size: f64::from(nibbles) / 2.0,
            crc,
        });
        rest = &rest[record_len..];
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockSerialPort;
    use crate::session::TransferEvent;
    use std::io::Cursor;

    fn reply(body: &[u8]) -> Vec<Option<u8>> {
        let mut responses = Vec::new();
        MockSerialPort::push_bytes(&mut responses, &packet::encode_command_packet(body));
        responses
    }

    #[test]
    fn test_memory_query() {
        // a blank for the drain, then the ASCII reply packet
        let mut responses = vec![None];
        responses.extend(reply(b"1234"));

        let expected_writes = vec![CMD_MEMORY, ACK];

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut link = ServerLink::new(&mut serial, SessionOptions::server());
        assert_eq!(link.memory().unwrap(), 1234);
    }

    #[test]
    fn test_memory_rejects_non_numeric_reply() {
        let mut responses = vec![None];
        responses.extend(reply(b"lots"));

        let expected_writes = vec![CMD_MEMORY, ACK];

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut link = ServerLink::new(&mut serial, SessionOptions::server());
        assert!(matches!(link.memory(), Err(ControlError::BadReply(_))));
    }

    #[test]
    fn test_bad_reply_checksum_is_not_acked() {
        let mut frame = packet::encode_command_packet(b"1234");
        let last = frame.len() - 1;
        frame[last] = frame[last].wrapping_add(1);

        let mut responses = vec![None];
        MockSerialPort::push_bytes(&mut responses, &frame);

        // the verb goes out but the corrupt reply must not be ACKed
        let expected_writes = vec![CMD_MEMORY];

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut link = ServerLink::new(&mut serial, SessionOptions::server());
        assert!(matches!(
            link.memory(),
            Err(ControlError::Frame(FrameError::CommandChecksum { .. }))
        ));
    }

    #[test]
    fn test_listing_single_record() {
        // "AB", prolog 0x2a2c, 20 nibbles, crc 0x1234
        let body = [
            0x02, b'A', b'B', 0x2c, 0x2a, 0x14, 0x00, 0x00, 0x34, 0x12,
        ];
        let mut responses = vec![None];
        responses.extend(reply(&body));

        let expected_writes = vec![CMD_LIST, ACK];

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut link = ServerLink::new(&mut serial, SessionOptions::server());
        let vars = link.listing().unwrap();
        assert_eq!(
            vars,
            vec![RemoteVariable {
                name: "AB".into(),
                prolog: 0x2a2c,
                size: 10.0,
                crc: 0x1234,
            }]
        );
    }

    #[test]
    fn test_listing_extended_charset_name() {
        // one-character name from the upper half of the HP charset
        let body = [0x01, 0x8d, 0x2c, 0x2a, 0x14, 0x00, 0x00, 0x34, 0x12];
        let mut responses = vec![None];
        responses.extend(reply(&body));

        let expected_writes = vec![CMD_LIST, ACK];

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut link = ServerLink::new(&mut serial, SessionOptions::server());
        let vars = link.listing().unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name, "\u{8d}");
        assert_eq!(vars[0].size, 10.0);
    }

    #[test]
    fn test_listing_empty_directory() {
        let mut responses = vec![None];
        responses.extend(reply(&[]));

        let expected_writes = vec![CMD_LIST, ACK];

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut link = ServerLink::new(&mut serial, SessionOptions::server());
        assert!(link.listing().unwrap().is_empty());
    }

    #[test]
    fn test_listing_truncated_record() {
        // name length claims 5 bytes but only 2 follow
        let body = [0x05, b'A', b'B'];
        let mut responses = vec![None];
        responses.extend(reply(&body));

        let expected_writes = vec![CMD_LIST, ACK];

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut link = ServerLink::new(&mut serial, SessionOptions::server());
        assert!(matches!(
            link.listing(),
            Err(ControlError::MalformedListing)
        ));
    }

    #[test]
    fn test_eval_sends_command_packet() {
        let responses = vec![None, Some(ACK)];

        let mut expected_writes = vec![CMD_EVAL];
        expected_writes.extend_from_slice(&packet::encode_command_packet(b"HOME"));

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut link = ServerLink::new(&mut serial, SessionOptions::server());
        link.home().unwrap();
    }

    #[test]
    fn test_drain_acks_stray_bytes() {
        // two leftovers on the line before the quit verb
        let responses = vec![Some(0x42), Some(0x43), None];
        let expected_writes = vec![ACK, ACK, CMD_QUIT];

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut link = ServerLink::new(&mut serial, SessionOptions::server());
        link.quit().unwrap();
    }

    #[test]
    fn test_version_query() {
        let mut responses = vec![None];
        responses.extend(reply(b"XModem Server 1.0"));

        let expected_writes = vec![CMD_VERSION, ACK];

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut link = ServerLink::new(&mut serial, SessionOptions::server());
        assert_eq!(link.version().unwrap(), "XModem Server 1.0");
    }

    #[test]
    fn test_put_runs_full_transfer() {
        let content = b"HELLO".to_vec();
        let mut block = content.clone();
        block.resize(BLOCK_LEN, 0);

        // drain blank, name-packet ACK, ready byte, data ACK
        let responses = vec![None, Some(ACK), Some(SERVER_READY), Some(ACK)];

        let mut expected_writes = vec![CMD_PUT];
        expected_writes.extend_from_slice(&packet::encode_command_packet(b"X"));
        expected_writes.extend_from_slice(&packet::encode_data_packet(1, &block).unwrap());
        expected_writes.push(EOT);

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut link = ServerLink::new(&mut serial, SessionOptions::server());

        let mut source = Cursor::new(content);
        let mut events = Vec::new();
        let mut sink = |ev| events.push(ev);
        link.put("X", &mut source, 5, &mut sink, CancelFlag::new())
            .unwrap();

        assert_eq!(events, vec![TransferEvent::Done { total: 1, success: 1 }]);
    }

    #[test]
    fn test_get_runs_full_transfer() {
        let mut block = b"WORLD".to_vec();
        block.resize(BLOCK_LEN, 0);

        let mut responses = vec![None, Some(ACK)];
        MockSerialPort::push_bytes(
            &mut responses,
            &packet::encode_data_packet(1, &block).unwrap(),
        );
        responses.push(Some(EOT));

        let mut expected_writes = vec![CMD_GET];
        expected_writes.extend_from_slice(&packet::encode_command_packet(b"X"));
        expected_writes.push(SERVER_READY);
        expected_writes.push(ACK);
        expected_writes.push(ACK);

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut link = ServerLink::new(&mut serial, SessionOptions::server());

        let mut output = Vec::new();
        let mut events = Vec::new();
        let mut sink = |ev| events.push(ev);
        link.get("X", &mut output, &mut sink, CancelFlag::new())
            .unwrap();

        assert_eq!(output, block);
        assert_eq!(
            events.last(),
            Some(&TransferEvent::Done { total: 1, success: 1 })
        );
    }
}
