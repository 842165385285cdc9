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

//! Shared vocabulary for the transfer state machines: options, errors, the
//! progress event stream, and the cooperative cancellation flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::protocol::{BLOCK_LEN, BLOCK_LEN_1K};

/// Per-session tuning. Connected server transfers use a short timeout so
/// failures are noticed quickly; a calculator that is still being fiddled
/// with on the other end of the cable gets the longer one.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Bound on each transport read
    pub timeout: Duration,
    /// Blank reads tolerated while waiting for the peer, and resends
    /// tolerated per packet
    pub retry_limit: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            timeout: Duration::from_secs(3),
            retry_limit: 9,
        }
    }
}

impl SessionOptions {
    /// Short-timeout options for transfers to an already-connected server.
    pub fn server() -> Self {
        SessionOptions {
            timeout: Duration::from_millis(500),
            retry_limit: 9,
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] crate::packet::FrameError),

    /// The peer went quiet for longer than the retry budget allows.
    #[error("timed out waiting for the calculator")]
    Timeout,

    /// The peer kept rejecting the same packet.
    #[error("retry limit reached, giving up")]
    RetryExhausted,

    /// The peer sent CAN; no retry.
    #[error("transfer cancelled by the calculator")]
    PeerCancelled,

    /// Cancelled from our side via [`CancelFlag`].
    #[error("transfer cancelled")]
    Cancelled,

    /// Internal sentinel raised by terminal states to stop the step loop.
    /// The run helpers convert it to `Ok`; callers never see it.
    #[error("transfer complete")]
    TransferComplete,
}

/// One of four disjoint session outcomes, delivered through a single
/// callback. Exactly one terminal event (anything but `Progress`) is
/// emitted per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// A packet was ACKed; counts are cumulative for the session
    Progress {
        total: u64,
        success: u64,
        errors: u64,
    },
    /// All packets ACKed (send: replaces the final Progress; receive:
    /// emitted on EOT)
    Done { total: u64, success: u64 },
    /// Terminal failure, with a one-line diagnostic
    Failed { reason: String },
    /// Terminal, in response to [`CancelFlag::cancel`]
    Cancelled,
}

/// Callback receiving [`TransferEvent`]s. Runs on the session's own thread
/// in the middle of the transfer loop, so it must not block for long.
pub type EventSink<'a> = &'a mut dyn FnMut(TransferEvent);

/// Cooperative cancellation: observed at the top of each protocol loop,
/// never mid-read. Cancelling guarantees the CAN burst goes out before the
/// session terminates.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> CancelFlag {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Number of data packets a source of `size` bytes produces: 1024-byte
/// blocks while a full block remains, 128-byte blocks for the tail.
pub fn expected_packets(size: u64) -> u64 {
    let full = size / BLOCK_LEN_1K as u64;
    let rest = size % BLOCK_LEN_1K as u64;
    full + rest.div_ceil(BLOCK_LEN as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_packets() {
        assert_eq!(expected_packets(0), 0);
        assert_eq!(expected_packets(1), 1);
        assert_eq!(expected_packets(128), 1);
        assert_eq!(expected_packets(300), 3);
        assert_eq!(expected_packets(1024), 1);
        assert_eq!(expected_packets(1025), 2);
        assert_eq!(expected_packets(1500), 5);
        assert_eq!(expected_packets(2048 + 129), 4);
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
