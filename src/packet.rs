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

//! Pure encode/decode for the two wire formats: data packets (bulk
//! transfer) and command packets (control channel). Retry and timeout
//! policy live in the session layer, not here.
//!
//! Data packet: `[SOH|STX, seq, 0xFF-seq, payload, crc_hi, crc_lo]` with
//! the Saturn CRC over the payload only. Command packet:
//! `[len_hi, len_lo, body, sum(body) & 0xFF]`.

use thiserror::Error;

use crate::crc;
use crate::protocol::{BLOCK_LEN, BLOCK_LEN_1K, SOH, STX};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid block size {0}, must be 128 or 1024 bytes")]
    BadBlockSize(usize),

    #[error("unknown frame header byte {0:#04x}")]
    BadHeader(u8),

    #[error("frame truncated: got {got} bytes, wanted {want}")]
    Truncated { want: usize, got: usize },

    #[error("sequence complement mismatch: seq {seq}, complement {complement}")]
    SeqComplement { seq: u8, complement: u8 },

    #[error("unexpected sequence number {got}, wanted {want}")]
    UnexpectedSeq { got: u8, want: u8 },

    #[error("block CRC mismatch: computed {computed:#06x}, received {received:#06x}")]
    BlockCrc { computed: u16, received: u16 },

    #[error("command checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    CommandChecksum { computed: u8, received: u8 },
}

/// Frame one data packet. The payload length selects the header byte:
/// 128 bytes gets SOH, 1024 gets STX. Anything else is a caller bug.
pub fn encode_data_packet(seq: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let header = match payload.len() {
        BLOCK_LEN => SOH,
        BLOCK_LEN_1K => STX,
        n => return Err(FrameError::BadBlockSize(n)),
    };
    let crc = crc::checksum(payload);
    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.push(header);
    frame.push(seq);
    frame.push(0xff - seq);
    frame.extend_from_slice(payload);
    frame.push((crc >> 8) as u8);
    frame.push((crc & 0xff) as u8);
    Ok(frame)
}

/// Payload length implied by a data packet header byte.
pub fn block_len(header: u8) -> Result<usize, FrameError> {
    match header {
        SOH => Ok(BLOCK_LEN),
        STX => Ok(BLOCK_LEN_1K),
        other => Err(FrameError::BadHeader(other)),
    }
}

/// Parse and verify a complete data packet, returning `(seq, payload)`.
pub fn decode_data_packet(frame: &[u8]) -> Result<(u8, &[u8]), FrameError> {
    if frame.is_empty() {
        return Err(FrameError::Truncated { want: 5, got: 0 });
    }
    let payload_len = block_len(frame[0])?;
    let want = payload_len + 5;
    if frame.len() != want {
        return Err(FrameError::Truncated {
            want,
            got: frame.len(),
        });
    }
    let seq = frame[1];
    let complement = frame[2];
    if complement != 0xff - seq {
        return Err(FrameError::SeqComplement { seq, complement });
    }
    let payload = &frame[3..3 + payload_len];
    let received = u16::from(frame[want - 2]) << 8 | u16::from(frame[want - 1]);
    let computed = crc::checksum(payload);
    if computed != received {
        return Err(FrameError::BlockCrc { computed, received });
    }
    Ok((seq, payload))
}

/// Modulo-256 sum of the body, the command channel's checksum.
pub fn command_checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Frame one command packet: big-endian length, body, checksum.
pub fn encode_command_packet(body: &[u8]) -> Vec<u8> {
    debug_assert!(body.len() <= u16::MAX as usize);
    let len = body.len() as u16;
    let mut frame = Vec::with_capacity(body.len() + 3);
    frame.push((len >> 8) as u8);
    frame.push((len & 0xff) as u8);
    frame.extend_from_slice(body);
    frame.push(command_checksum(body));
    frame
}

/// Parse and verify a complete command packet, returning the body. A
/// checksum mismatch means the caller must not ACK the packet.
pub fn decode_command_packet(frame: &[u8]) -> Result<&[u8], FrameError> {
    if frame.len() < 3 {
        return Err(FrameError::Truncated {
            want: 3,
            got: frame.len(),
        });
    }
    let len = usize::from(frame[0]) << 8 | usize::from(frame[1]);
    let want = len + 3;
    if frame.len() != want {
        return Err(FrameError::Truncated {
            want,
            got: frame.len(),
        });
    }
    let body = &frame[2..2 + len];
    let received = frame[want - 1];
    let computed = command_checksum(body);
    if computed != received {
        return Err(FrameError::CommandChecksum { computed, received });
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_packet_layout() {
        let payload = [0u8; 128];
        let frame = encode_data_packet(1, &payload).unwrap();
        assert_eq!(frame.len(), 133);
        assert_eq!(frame[0], SOH);
        assert_eq!(frame[1], 1);
        assert_eq!(frame[2], 0xfe);
        // zero payload has a zero CRC
        assert_eq!(&frame[131..], &[0, 0]);
    }

    #[test]
    fn test_data_packet_round_trip_128() {
        let payload: Vec<u8> = (0..128).map(|i| (i * 3) as u8).collect();
        for seq in [0u8, 1, 127, 254, 255] {
            let frame = encode_data_packet(seq, &payload).unwrap();
            let (got_seq, got_payload) = decode_data_packet(&frame).unwrap();
            assert_eq!(got_seq, seq);
            assert_eq!(got_payload, &payload[..]);
        }
    }

    #[test]
    fn test_data_packet_round_trip_1k() {
        let payload: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        let frame = encode_data_packet(9, &payload).unwrap();
        assert_eq!(frame[0], STX);
        let (seq, got) = decode_data_packet(&frame).unwrap();
        assert_eq!(seq, 9);
        assert_eq!(got, &payload[..]);
    }

    #[test]
    fn test_data_packet_rejects_odd_sizes() {
        assert_eq!(
            encode_data_packet(1, &[0u8; 130]),
            Err(FrameError::BadBlockSize(130))
        );
    }

    #[test]
    fn test_data_packet_rejects_bad_complement() {
        let mut frame = encode_data_packet(5, &[0u8; 128]).unwrap();
        frame[2] = 0x42;
        assert!(matches!(
            decode_data_packet(&frame),
            Err(FrameError::SeqComplement { seq: 5, .. })
        ));
    }

    #[test]
    fn test_data_packet_rejects_corrupt_crc() {
        let payload: Vec<u8> = (0..128).map(|i| i as u8).collect();
        let mut frame = encode_data_packet(2, &payload).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(
            decode_data_packet(&frame),
            Err(FrameError::BlockCrc { .. })
        ));
    }

    #[test]
    fn test_data_packet_rejects_corrupt_payload() {
        let payload: Vec<u8> = (0..128).map(|i| i as u8).collect();
        let mut frame = encode_data_packet(2, &payload).unwrap();
        frame[40] ^= 0x80;
        assert!(matches!(
            decode_data_packet(&frame),
            Err(FrameError::BlockCrc { .. })
        ));
    }

    #[test]
    fn test_command_packet_layout() {
        let frame = encode_command_packet(b"HOME");
        // 'H' + 'O' + 'M' + 'E' = 0x48 + 0x4f + 0x4d + 0x45 = 0x129
        assert_eq!(frame, vec![0x00, 0x04, b'H', b'O', b'M', b'E', 0x29]);
    }

    #[test]
    fn test_command_packet_round_trip() {
        for len in [0usize, 1, 2, 127, 255] {
            let body: Vec<u8> = (0..len).map(|i| (i * 11) as u8).collect();
            let frame = encode_command_packet(&body);
            assert_eq!(decode_command_packet(&frame).unwrap(), &body[..]);
        }
    }

    #[test]
    fn test_command_packet_rejects_corrupt_checksum() {
        for len in [0usize, 1, 2, 127, 255] {
            let body: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let mut frame = encode_command_packet(&body);
            let last = frame.len() - 1;
            frame[last] = frame[last].wrapping_add(1);
            assert!(matches!(
                decode_command_packet(&frame),
                Err(FrameError::CommandChecksum { .. })
            ));
        }
    }

    #[test]
    fn test_command_packet_rejects_truncation() {
        let frame = encode_command_packet(b"MEMORY");
        assert!(matches!(
            decode_command_packet(&frame[..4]),
            Err(FrameError::Truncated { .. })
        ));
    }
}
