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

//! Wire constants for the HP XModem-variant protocol and the HP binary
//! object format. These byte values are fixed by the calculator firmware
//! and must not change.

/// Start of header - begins a 128-byte data packet
pub const SOH: u8 = 0x01;

/// Start of text - begins a 1024-byte data packet
pub const STX: u8 = 0x02;

/// End of transmission - sender signals no more packets
pub const EOT: u8 = 0x04;

/// Acknowledge - receiver accepts the last packet
pub const ACK: u8 = 0x06;

/// Negative acknowledge - receiver rejects the last packet, retransmit
pub const NAK: u8 = 0x15;

/// Cancel - either side aborts the transfer
pub const CAN: u8 = 0x18;

/// Number of consecutive CAN bytes emitted when a transfer is aborted.
/// The calculator must see the cancel burst before it times out, or its
/// firmware can be left in an unstable state.
pub const CAN_BURST: usize = 3;

/// Ready byte polled for before sending: the calculator emits 'D' when it
/// starts a native XModem receive.
pub const SERVER_READY: u8 = b'D';

/// Plain XModem receivers announce readiness with NAK or, in CRC mode, 'C'.
/// The transfer loop accepts either in place of [`SERVER_READY`].
pub const CRC_READY: u8 = b'C';

/// Small data packet payload size
pub const BLOCK_LEN: usize = 128;

/// Large data packet payload size, used while at least this much input remains
pub const BLOCK_LEN_1K: usize = 1024;

// Single-byte command verbs understood by the calculator's XModem server.

/// Query free memory; reply is a command packet with an ASCII decimal
pub const CMD_MEMORY: u8 = b'M';

/// List the current remote directory; reply is a packed binary listing
pub const CMD_LIST: u8 = b'L';

/// Evaluate an expression (chdir, HOME, UPDIR, arbitrary RPL)
pub const CMD_EVAL: u8 = b'E';

/// Store a variable: verb, name packet, then an XModem send
pub const CMD_PUT: u8 = b'P';

/// Fetch a variable: verb, name packet, then an XModem receive
pub const CMD_GET: u8 = b'G';

/// Terminate server mode on the calculator; no reply
pub const CMD_QUIT: u8 = b'Q';

/// Query the server version string
pub const CMD_VERSION: u8 = b'V';

/// Magic prefix identifying an HP binary object file. The full header is
/// "HPHP48-R" (or "HPHP49-..."), where R is the ROM revision character;
/// only these five bytes are checked.
pub const OBJECT_MAGIC: &[u8; 5] = b"HPHP4";

/// Bytes between the magic prefix and the ROM revision character ("8-", "9-")
pub const OBJECT_FILLER_LEN: usize = 2;

/// Text-mode transfer header prefix; a file starting with this is an HP
/// ASCII object rather than a binary one.
pub const ASCII_MAGIC: &[u8; 5] = b"%%HP:";
