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

//! The XModem-variant send engine: a stop-and-wait state machine that
//! frames blocks with [`crate::packet`], drives the transport, and retries
//! per the calculator's timing rules. Single-threaded and blocking;
//! cancellation is polled at the top of each state.

use std::collections::VecDeque;
use std::io::Read;
use std::marker::PhantomData;

use log::{debug, warn};

use crate::packet;
use crate::protocol::*;
use crate::serial::{SerialPort, read_byte};
use crate::session::{CancelFlag, EventSink, SessionError, SessionOptions, TransferEvent};

// ============================================================================
// States
// ============================================================================

/// Polling for the receiver's ready byte
pub struct AwaitReady;
/// Framing and writing the next block (or EOT at end of input)
pub struct SendBlock;
/// Waiting for ACK/NAK/CAN on the packet in flight
pub struct AwaitAck;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SendFsm<'a, State> {
    state: PhantomData<State>,
    serial: &'a mut dyn SerialPort,
    source: &'a mut dyn Read,
    opts: SessionOptions,
    events: EventSink<'a>,
    cancel: CancelFlag,
    /// Next packet sequence number; starts at 1, wraps at 255
    seq: u8,
    /// Framed bytes of the packet in flight, kept for resends
    packet: Vec<u8>,
    /// Zero-padded 128-byte tail blocks awaiting transmission
    queue: VecDeque<Vec<u8>>,
    eof: bool,
    blank_count: u32,
    retry: u32,
    total_packets: u64,
    success_count: u64,
    error_count: u64,
    expected_packets: u64,
    done_emitted: bool,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SendState<'a> {
    fn step(self: Box<Self>) -> Result<Box<dyn SendState<'a> + 'a>, SessionError>;
}

// ============================================================================
// Helpers
// ============================================================================

impl<'a, S> SendFsm<'a, S> {
    fn transition<T>(self) -> Box<SendFsm<'a, T>> {
        Box::new(SendFsm {
            state: PhantomData,
            serial: self.serial,
            source: self.source,
            opts: self.opts,
            events: self.events,
            cancel: self.cancel,
            seq: self.seq,
            packet: self.packet,
            queue: self.queue,
            eof: self.eof,
            blank_count: self.blank_count,
            retry: self.retry,
            total_packets: self.total_packets,
            success_count: self.success_count,
            error_count: self.error_count,
            expected_packets: self.expected_packets,
            done_emitted: self.done_emitted,
        })
    }

    /// Emit the terminal Failed event and hand back the error.
    fn fail(&mut self, err: SessionError) -> SessionError {
        (self.events)(TransferEvent::Failed {
            reason: err.to_string(),
        });
        err
    }

    fn io_error(&mut self, e: std::io::Error) -> SessionError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        self.fail(SessionError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name),
        )))
    }

    /// Cancellation path. The CAN burst must reach the calculator before it
    /// times out, so a failed write here is ignored.
    fn cancel_out(&mut self) -> SessionError {
        let _ = self.serial.write_all(&[CAN; CAN_BURST]);
        warn!("send cancelled, CAN burst emitted");
        (self.events)(TransferEvent::Cancelled);
        SessionError::Cancelled
    }

    /// Next payload to frame: 1024 bytes while the source can fill a large
    /// block, zero-padded 128-byte blocks for whatever is left.
    fn next_block(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        if let Some(block) = self.queue.pop_front() {
            return Ok(Some(block));
        }
        if self.eof {
            return Ok(None);
        }

        let mut buf = [0u8; BLOCK_LEN_1K];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.source.read(&mut buf[filled..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            Ok(None)
        } else if filled == BLOCK_LEN_1K {
            Ok(Some(buf.to_vec()))
        } else {
            for chunk in buf[..filled].chunks(BLOCK_LEN) {
                let mut block = chunk.to_vec();
                block.resize(BLOCK_LEN, 0);
                self.queue.push_back(block);
            }
            Ok(self.queue.pop_front())
        }
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl<'a> SendState<'a> for SendFsm<'a, AwaitReady> {
    fn step(self: Box<Self>) -> Result<Box<dyn SendState<'a> + 'a>, SessionError> {
        let mut fsm = *self;
        if fsm.cancel.is_cancelled() {
            return Err(fsm.cancel_out());
        }

        match read_byte(fsm.serial, fsm.opts.timeout) {
            Ok(Some(b)) if b == SERVER_READY || b == NAK || b == CRC_READY => {
                debug!("receiver ready ({b:#04x})");
                Ok(fsm.transition::<SendBlock>())
            }
            Ok(Some(CAN)) => Err(fsm.fail(SessionError::PeerCancelled)),
            Ok(Some(other)) => {
                debug!("ignoring stray byte {other:#04x} while waiting for receiver");
                Ok(Box::new(fsm))
            }
            Ok(None) => {
                fsm.blank_count += 1;
                if fsm.blank_count >= fsm.opts.retry_limit {
                    Err(fsm.fail(SessionError::Timeout))
                } else {
                    Ok(Box::new(fsm))
                }
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }
}

impl<'a> SendState<'a> for SendFsm<'a, SendBlock> {
    fn step(self: Box<Self>) -> Result<Box<dyn SendState<'a> + 'a>, SessionError> {
        let mut fsm = *self;
        if fsm.cancel.is_cancelled() {
            return Err(fsm.cancel_out());
        }

        let block = match fsm.next_block() {
            Ok(block) => block,
            Err(e) => return Err(fsm.io_error(e)),
        };

        match block {
            None => {
                if let Err(e) = fsm.serial.write_all(&[EOT]) {
                    return Err(fsm.io_error(e));
                }
                debug!("sent EOT after {} packets", fsm.success_count);
                if !fsm.done_emitted {
                    (fsm.events)(TransferEvent::Done {
                        total: fsm.total_packets,
                        success: fsm.success_count,
                    });
                }
                Err(SessionError::TransferComplete)
            }
            Some(block) => {
                fsm.packet = packet::encode_data_packet(fsm.seq, &block)?;
                let frame = std::mem::take(&mut fsm.packet);
                let written = fsm.serial.write_all(&frame);
                fsm.packet = frame;
                if let Err(e) = written {
                    return Err(fsm.io_error(e));
                }
                fsm.total_packets += 1;
                fsm.retry = 0;
                debug!("sent packet {} ({} byte block)", fsm.seq, block.len());
                Ok(fsm.transition::<AwaitAck>())
            }
        }
    }
}

impl<'a> SendState<'a> for SendFsm<'a, AwaitAck> {
    fn step(self: Box<Self>) -> Result<Box<dyn SendState<'a> + 'a>, SessionError> {
        let mut fsm = *self;
        if fsm.cancel.is_cancelled() {
            return Err(fsm.cancel_out());
        }

        match read_byte(fsm.serial, fsm.opts.timeout) {
            Ok(Some(ACK)) => {
                fsm.seq = fsm.seq.wrapping_add(1);
                fsm.retry = 0;
                fsm.success_count += 1;
                if fsm.success_count == fsm.expected_packets {
                    fsm.done_emitted = true;
                    (fsm.events)(TransferEvent::Done {
                        total: fsm.total_packets,
                        success: fsm.success_count,
                    });
                } else {
                    (fsm.events)(TransferEvent::Progress {
                        total: fsm.total_packets,
                        success: fsm.success_count,
                        errors: fsm.error_count,
                    });
                }
                Ok(fsm.transition::<SendBlock>())
            }
            Ok(Some(NAK)) => {
                fsm.error_count += 1;
                if fsm.retry >= fsm.opts.retry_limit {
                    Err(fsm.fail(SessionError::RetryExhausted))
                } else {
                    // resend without advancing the sequence number
                    fsm.retry += 1;
                    warn!("packet {} NAKed, resend {}", fsm.seq, fsm.retry);
                    let frame = std::mem::take(&mut fsm.packet);
                    let written = fsm.serial.write_all(&frame);
                    fsm.packet = frame;
                    if let Err(e) = written {
                        return Err(fsm.io_error(e));
                    }
                    Ok(Box::new(fsm))
                }
            }
            Ok(Some(CAN)) => Err(fsm.fail(SessionError::PeerCancelled)),
            Ok(Some(other)) => {
                debug!("ignoring stray byte {other:#04x} while waiting for ACK");
                Ok(Box::new(fsm))
            }
            Ok(None) => {
                // a quiet line counts against the retry budget but does not
                // trigger a resend; the receiver may still be checking the CRC
                fsm.error_count += 1;
                if fsm.retry >= fsm.opts.retry_limit {
                    Err(fsm.fail(SessionError::Timeout))
                } else {
                    fsm.retry += 1;
                    Ok(Box::new(fsm))
                }
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl<'a> SendFsm<'a, AwaitReady> {
    pub fn new(
        serial: &'a mut dyn SerialPort,
        source: &'a mut dyn Read,
        expected_packets: u64,
        opts: SessionOptions,
        events: EventSink<'a>,
        cancel: CancelFlag,
    ) -> Box<dyn SendState<'a> + 'a> {
        Box::new(SendFsm {
            state: PhantomData::<AwaitReady>,
            serial,
            source,
            opts,
            events,
            cancel,
            seq: 1,
            packet: Vec::new(),
            queue: VecDeque::new(),
            eof: false,
            blank_count: 0,
            retry: 0,
            total_packets: 0,
            success_count: 0,
            error_count: 0,
            expected_packets,
            done_emitted: false,
        })
    }
}

/// Drive a send session to its terminal state.
pub fn run_send<'a>(mut state: Box<dyn SendState<'a> + 'a>) -> Result<(), SessionError> {
    loop {
        match state.step() {
            Ok(next) => state = next,
            Err(SessionError::TransferComplete) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockSerialPort;
    use crate::session::expected_packets;
    use std::io::Cursor;

    fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        packet::encode_data_packet(seq, payload).unwrap()
    }

    fn padded(data: &[u8]) -> Vec<u8> {
        let mut block = data.to_vec();
        block.resize(BLOCK_LEN, 0);
        block
    }

    #[test]
    fn test_send_happy_path_three_packets() {
        let content: Vec<u8> = (0..300).map(|i| (i % 256) as u8).collect();

        let responses = vec![Some(SERVER_READY), Some(ACK), Some(ACK), Some(ACK)];

        let mut expected_writes = Vec::new();
        expected_writes.extend_from_slice(&frame(1, &padded(&content[0..128])));
        expected_writes.extend_from_slice(&frame(2, &padded(&content[128..256])));
        expected_writes.extend_from_slice(&frame(3, &padded(&content[256..300])));
        expected_writes.push(EOT);

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut source = Cursor::new(content.clone());
        let mut events = Vec::new();
        let mut sink = |ev| events.push(ev);

        let fsm = SendFsm::new(
            &mut serial,
            &mut source,
            expected_packets(300),
            SessionOptions::default(),
            &mut sink,
            CancelFlag::new(),
        );
        run_send(fsm).expect("transfer should succeed");

        assert_eq!(
            events,
            vec![
                TransferEvent::Progress { total: 1, success: 1, errors: 0 },
                TransferEvent::Progress { total: 2, success: 2, errors: 0 },
                TransferEvent::Done { total: 3, success: 3 },
            ]
        );
    }

    #[test]
    fn test_send_prefers_1k_blocks() {
        // 1500 bytes: one 1024-byte block, then four padded 128-byte blocks
        let content: Vec<u8> = (0..1500).map(|i| (i % 251) as u8).collect();

        let responses = vec![
            Some(SERVER_READY),
            Some(ACK),
            Some(ACK),
            Some(ACK),
            Some(ACK),
            Some(ACK),
        ];

        let mut expected_writes = Vec::new();
        expected_writes.extend_from_slice(&frame(1, &content[0..1024]));
        expected_writes.extend_from_slice(&frame(2, &padded(&content[1024..1152])));
        expected_writes.extend_from_slice(&frame(3, &padded(&content[1152..1280])));
        expected_writes.extend_from_slice(&frame(4, &padded(&content[1280..1408])));
        expected_writes.extend_from_slice(&frame(5, &padded(&content[1408..1500])));
        expected_writes.push(EOT);

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut source = Cursor::new(content.clone());
        let mut events = Vec::new();
        let mut sink = |ev| events.push(ev);

        let fsm = SendFsm::new(
            &mut serial,
            &mut source,
            expected_packets(1500),
            SessionOptions::default(),
            &mut sink,
            CancelFlag::new(),
        );
        run_send(fsm).expect("transfer should succeed");

        assert_eq!(
            events.last(),
            Some(&TransferEvent::Done { total: 5, success: 5 })
        );
    }

    #[test]
    fn test_send_empty_source() {
        let responses = vec![Some(SERVER_READY)];
        let expected_writes = vec![EOT];

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut source = Cursor::new(Vec::new());
        let mut events = Vec::new();
        let mut sink = |ev| events.push(ev);

        let fsm = SendFsm::new(
            &mut serial,
            &mut source,
            0,
            SessionOptions::default(),
            &mut sink,
            CancelFlag::new(),
        );
        run_send(fsm).expect("empty transfer should succeed");

        assert_eq!(events, vec![TransferEvent::Done { total: 0, success: 0 }]);
    }

    #[test]
    fn test_send_handshake_timeout() {
        let opts = SessionOptions {
            retry_limit: 3,
            ..SessionOptions::default()
        };
        // three blank reads exhaust the budget; nothing is ever written
        let responses = vec![None, None, None];

        let mut serial = MockSerialPort::new(responses, Vec::new());
        let mut source = Cursor::new(vec![0u8; 10]);
        let mut events = Vec::new();
        let mut sink = |ev| events.push(ev);

        let fsm = SendFsm::new(&mut serial, &mut source, 1, opts, &mut sink, CancelFlag::new());
        let err = run_send(fsm).unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
        assert!(matches!(events[..], [TransferEvent::Failed { .. }]));
    }

    #[test]
    fn test_send_retry_exhaustion_never_advances_seq() {
        let opts = SessionOptions {
            retry_limit: 3,
            ..SessionOptions::default()
        };
        let content = vec![0xa5u8; 10];

        // initial send plus exactly three resends, all of packet #1
        let responses = vec![
            Some(SERVER_READY),
            Some(NAK),
            Some(NAK),
            Some(NAK),
            Some(NAK),
        ];
        let packet1 = frame(1, &padded(&content));
        let mut expected_writes = Vec::new();
        for _ in 0..4 {
            expected_writes.extend_from_slice(&packet1);
        }

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut source = Cursor::new(content);
        let mut events = Vec::new();
        let mut sink = |ev| events.push(ev);

        let fsm = SendFsm::new(&mut serial, &mut source, 1, opts, &mut sink, CancelFlag::new());
        let err = run_send(fsm).unwrap_err();
        assert!(matches!(err, SessionError::RetryExhausted));
        assert!(matches!(events[..], [TransferEvent::Failed { .. }]));
    }

    #[test]
    fn test_send_peer_cancel() {
        let content = vec![0x11u8; 4];
        let responses = vec![Some(SERVER_READY), Some(CAN)];
        let expected_writes = frame(1, &padded(&content));

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut source = Cursor::new(content);
        let mut events = Vec::new();
        let mut sink = |ev| events.push(ev);

        let fsm = SendFsm::new(
            &mut serial,
            &mut source,
            1,
            SessionOptions::default(),
            &mut sink,
            CancelFlag::new(),
        );
        let err = run_send(fsm).unwrap_err();
        assert!(matches!(err, SessionError::PeerCancelled));
        assert!(matches!(events[..], [TransferEvent::Failed { .. }]));
    }

    #[test]
    fn test_cancel_mid_ack_wait_emits_can_burst() {
        let content = vec![0x22u8; 16];
        let responses = vec![Some(SERVER_READY)];

        let mut expected_writes = frame(1, &padded(&content));
        expected_writes.extend_from_slice(&[CAN, CAN, CAN]);

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut source = Cursor::new(content);
        let mut events = Vec::new();
        let mut sink = |ev| events.push(ev);
        let cancel = CancelFlag::new();

        let fsm = SendFsm::new(
            &mut serial,
            &mut source,
            1,
            SessionOptions::default(),
            &mut sink,
            cancel.clone(),
        );
        let fsm = fsm.step().expect("handshake"); // consumes the ready byte
        let fsm = fsm.step().expect("first packet"); // writes packet 1

        cancel.cancel();
        let err = fsm.step().err().unwrap();
        assert!(matches!(err, SessionError::Cancelled));
        assert_eq!(events, vec![TransferEvent::Cancelled]);
    }

    #[test]
    fn test_send_ignores_stray_ready_bytes() {
        let content = vec![0x33u8; 4];
        // garbage, then a blank, then the ready byte
        let responses = vec![Some(0x7f), None, Some(SERVER_READY), Some(ACK)];

        let mut expected_writes = frame(1, &padded(&content));
        expected_writes.push(EOT);

        let mut serial = MockSerialPort::new(responses, expected_writes);
        let mut source = Cursor::new(content);
        let mut events = Vec::new();
        let mut sink = |ev| events.push(ev);

        let fsm = SendFsm::new(
            &mut serial,
            &mut source,
            1,
            SessionOptions::default(),
            &mut sink,
            CancelFlag::new(),
        );
        run_send(fsm).expect("transfer should succeed");
        assert_eq!(events, vec![TransferEvent::Done { total: 1, success: 1 }]);
    }
}
