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

//! The receive side of the XModem variant. Mirrors the sender: announce
//! readiness, then ACK/NAK one packet at a time until EOT. Padding bytes
//! are passed through untouched; trimming to the object's true size is the
//! caller's business.

use std::io::Write;
use std::marker::PhantomData;

use log::{debug, warn};

use crate::packet::{self, FrameError};
use crate::protocol::*;
use crate::serial::{SerialPort, read_byte, read_exact_timeout};
use crate::session::{CancelFlag, EventSink, SessionError, SessionOptions, TransferEvent};

// ============================================================================
// States
// ============================================================================

/// Writing the ready byte that invites the peer to start
pub struct Announce;
/// Waiting for a frame header, EOT or CAN
pub struct AwaitBlock;
/// Reading the body of the frame whose header just arrived
pub struct ReadBlock;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiveFsm<'a, State> {
    state: PhantomData<State>,
    serial: &'a mut dyn SerialPort,
    sink: &'a mut dyn Write,
    opts: SessionOptions,
    events: EventSink<'a>,
    cancel: CancelFlag,
    /// Sequence number the next fresh packet must carry
    expected_seq: u8,
    /// Header byte of the frame being read, captured in AwaitBlock
    header: u8,
    blank_count: u32,
    retry: u32,
    total_packets: u64,
    success_count: u64,
    error_count: u64,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiveState<'a> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiveState<'a> + 'a>, SessionError>;
}

// ============================================================================
// Helpers
// ============================================================================

impl<'a, S> ReceiveFsm<'a, S> {
    fn transition<T>(self) -> Box<ReceiveFsm<'a, T>> {
        Box::new(ReceiveFsm {
            state: PhantomData,
            serial: self.serial,
            sink: self.sink,
            opts: self.opts,
            events: self.events,
            cancel: self.cancel,
            expected_seq: self.expected_seq,
            header: self.header,
            blank_count: self.blank_count,
            retry: self.retry,
            total_packets: self.total_packets,
            success_count: self.success_count,
            error_count: self.error_count,
        })
    }

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

    fn cancel_out(&mut self) -> SessionError {
        let _ = self.serial.write_all(&[CAN; CAN_BURST]);
        warn!("receive cancelled, CAN burst emitted");
        (self.events)(TransferEvent::Cancelled);
        SessionError::Cancelled
    }

    /// NAK the frame in flight and charge it to the retry budget.
    fn reject(&mut self, why: &FrameError) -> Result<(), SessionError> {
        warn!("rejecting packet: {why}");
        self.error_count += 1;
        if self.retry >= self.opts.retry_limit {
            return Err(self.fail(SessionError::RetryExhausted));
        }
        self.retry += 1;
        if let Err(e) = self.serial.write_all(&[NAK]) {
            return Err(self.io_error(e));
        }
        Ok(())
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl<'a> ReceiveState<'a> for ReceiveFsm<'a, Announce> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiveState<'a> + 'a>, SessionError> {
        let mut fsm = *self;
        if fsm.cancel.is_cancelled() {
            return Err(fsm.cancel_out());
        }

        if let Err(e) = fsm.serial.write_all(&[SERVER_READY]) {
            return Err(fsm.io_error(e));
        }
        debug!("announced ready, waiting for first packet");
        Ok(fsm.transition::<AwaitBlock>())
    }
}

impl<'a> ReceiveState<'a> for ReceiveFsm<'a, AwaitBlock> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiveState<'a> + 'a>, SessionError> {
        let mut fsm = *self;
        if fsm.cancel.is_cancelled() {
            return Err(fsm.cancel_out());
        }

        match read_byte(fsm.serial, fsm.opts.timeout) {
            Ok(Some(EOT)) => {
                if let Err(e) = fsm.serial.write_all(&[ACK]) {
                    return Err(fsm.io_error(e));
                }
                debug!("EOT after {} packets", fsm.success_count);
                (fsm.events)(TransferEvent::Done {
                    total: fsm.total_packets,
                    success: fsm.success_count,
                });
                Err(SessionError::TransferComplete)
            }
            Ok(Some(CAN)) => Err(fsm.fail(SessionError::PeerCancelled)),
            Ok(Some(header)) => match packet::block_len(header) {
                Ok(_) => {
                    fsm.header = header;
                    Ok(fsm.transition::<ReadBlock>())
                }
                Err(e) => {
                    fsm.reject(&e)?;
                    Ok(Box::new(fsm))
                }
            },
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

impl<'a> ReceiveState<'a> for ReceiveFsm<'a, ReadBlock> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiveState<'a> + 'a>, SessionError> {
        let mut fsm = *self;

        // seq, complement, payload, two CRC bytes
        let payload_len = packet::block_len(fsm.header)?;
        let mut rest = vec![0u8; payload_len + 4];
        let filled = match read_exact_timeout(fsm.serial, &mut rest, fsm.opts.timeout) {
            Ok(filled) => filled,
            Err(e) => return Err(fsm.io_error(e)),
        };
        if filled < rest.len() {
            fsm.reject(&FrameError::Truncated {
                want: payload_len + 5,
                got: filled + 1,
            })?;
            return Ok(fsm.transition::<AwaitBlock>());
        }

        let mut frame = Vec::with_capacity(rest.len() + 1);
        frame.push(fsm.header);
        frame.extend_from_slice(&rest);

        fsm.total_packets += 1;
        match packet::decode_data_packet(&frame) {
            Ok((seq, payload)) if seq == fsm.expected_seq => {
                if let Err(e) = fsm.sink.write_all(payload) {
                    return Err(fsm.io_error(e));
                }
                if let Err(e) = fsm.serial.write_all(&[ACK]) {
                    return Err(fsm.io_error(e));
                }
                fsm.expected_seq = fsm.expected_seq.wrapping_add(1);
                fsm.retry = 0;
                // the quiet-read budget is per packet, not per session
                fsm.blank_count = 0;
                fsm.success_count += 1;
                debug!("accepted packet {seq} ({} bytes)", payload.len());
                (fsm.events)(TransferEvent::Progress {
                    total: fsm.total_packets,
                    success: fsm.success_count,
                    errors: fsm.error_count,
                });
                Ok(fsm.transition::<AwaitBlock>())
            }
            Ok((seq, _)) if seq == fsm.expected_seq.wrapping_sub(1) => {
                // our ACK was lost and the peer resent; ACK again, discard
                debug!("duplicate packet {seq}, re-ACKing");
                if let Err(e) = fsm.serial.write_all(&[ACK]) {
                    return Err(fsm.io_error(e));
                }
                Ok(fsm.transition::<AwaitBlock>())
            }
            Ok((seq, _)) => {
                let err = FrameError::UnexpectedSeq {
                    got: seq,
                    want: fsm.expected_seq,
                };
                fsm.reject(&err)?;
                Ok(fsm.transition::<AwaitBlock>())
            }
            Err(e) => {
                fsm.reject(&e)?;
                Ok(fsm.transition::<AwaitBlock>())
            }
        }
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl<'a> ReceiveFsm<'a, Announce> {
    pub fn new(
        serial: &'a mut dyn SerialPort,
        sink: &'a mut dyn Write,
        opts: SessionOptions,
        events: EventSink<'a>,
        cancel: CancelFlag,
    ) -> Box<dyn ReceiveState<'a> + 'a> {
        Box::new(ReceiveFsm {
            state: PhantomData::<Announce>,
            serial,
            sink,
            opts,
            events,
            cancel,
            expected_seq: 1,
            header: 0,
            blank_count: 0,
            retry: 0,
            total_packets: 0,
            success_count: 0,
            error_count: 0,
        })
    }
}

/// Drive a receive session to its terminal state.
pub fn run_receive<'a>(mut state: Box<dyn ReceiveState<'a> + 'a>) -> Result<(), SessionError> {
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
