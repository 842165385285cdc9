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

//! Scanner for HP binary object files: walks the nibble stream after the
//! "HPHP4n-R" header, determines object extent from the prolog, and folds
//! every object nibble into the Saturn CRC. No length prefix exists for
//! most types; extent is derived per type from the table in [`size_rule`].

use std::io::Read;

use log::{debug, trace};
use thiserror::Error;

use crate::bits::{BitAccumulator, BitError};
use crate::crc;
use crate::protocol::{ASCII_MAGIC, OBJECT_FILLER_LEN, OBJECT_MAGIC};

#[derive(Error, Debug)]
pub enum ScanError {
    /// Not an HP binary object. A normal outcome for arbitrary files, not
    /// a crash; callers fall through to other classifications.
    #[error("no HPHP4n- header found")]
    InvalidHeader,

    /// The leading prolog is not in the object type table. The reference
    /// tool silently stopped accumulating here; we surface it instead of
    /// fabricating a checksum over the header alone.
    #[error("unrecognized object prolog {0:#07x}")]
    UnknownProlog(u32),

    #[error(transparent)]
    Bits(#[from] BitError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How an object's nibble extent is determined once its prolog is known.
/// This table is the calculator's object ABI; the nibble counts for the
/// fixed types include the five prolog nibbles themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeRule {
    /// Total extent is a fixed nibble count (reals, complexes, binary
    /// integers, characters, XLIB names)
    Fixed(u64),
    /// A 20-bit nibble count follows the prolog and includes itself
    /// (arrays, strings, grobs, libraries, backups, code objects)
    LengthPrefixed,
    /// A 2-nibble character count follows; extent is `2 + 2n`
    /// (identifiers, local names, tags)
    AsciiCounted,
    /// Character count framed by identical leading and trailing counts;
    /// extent is `4 + 2n` (the global name following a directory prolog)
    ExtendedAsciiCounted,
    /// Directory: 8 prolog-area nibbles, then a 20-bit field, then the
    /// first entry's extended-ASCII name, then contained objects
    Directory,
}

/// Look up the size rule for a 20-bit prolog value.
pub fn size_rule(prolog: u32) -> Option<SizeRule> {
    use SizeRule::*;
    match prolog {
        // DOARRY, DOLNKARRY, DOCSTR, DOHSTR, DOGROB, DOLIB, DOBAK,
        // DOEXT0, DOCODE
        0x29e8 | 0x2a0a | 0x2a2c | 0x2a4e | 0x2b1e | 0x2b40 | 0x2b62 | 0x2b88 | 0x2dcc => {
            Some(LengthPrefixed)
        }
        // DOIDNT, DOLAM, DOTAG
        0x2e48 | 0x2e6d | 0x2afc => Some(AsciiCounted),
        // DORRP
        0x2a96 => Some(Directory),
        0x2911 => Some(Fixed(10)), // DOBINT
        0x2933 => Some(Fixed(21)), // DOREAL
        0x2955 => Some(Fixed(26)), // DOEREL
        0x2977 => Some(Fixed(37)), // DOCMP
        0x299d => Some(Fixed(47)), // DOECMP
        0x29bf => Some(Fixed(7)),  // DOCHAR
        0x2e92 => Some(Fixed(11)), // DOROMP
        _ => None,
    }
}

/// Result of scanning one object file. Produced exactly once per scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRecord {
    /// ROM revision character from the header ('A'..'R', 'X', ...)
    pub rom_revision: char,
    /// Saturn CRC over every consumed object nibble
    pub checksum: u16,
    /// Object size in bytes as the calculator reports it:
    /// `nibbles / 2 + 4.5 + filename_length`. The constant covers the
    /// on-calculator header and name bookkeeping and must match the
    /// reference tool exactly.
    pub byte_length: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the next 20-bit prolog
    Prolog,
    /// Waiting for a 20-bit length field
    LengthField,
    /// Waiting for a 2-nibble character count
    AsciiCount,
    /// Waiting for a framed character count
    ExtendedAsciiCount,
    /// Waiting for the directory's 20-bit field
    DirectoryField,
}

/// The nibble state machine. Fed one input byte at a time; each byte
/// contributes two nibbles through the bit accumulator.
pub struct ObjectScanner {
    bits: BitAccumulator,
    phase: Phase,
    /// Nibbles left to consume before the next structural field
    obj_len: u64,
    crc: u16,
    nibbles: u64,
}

impl ObjectScanner {
    pub fn new() -> ObjectScanner {
        ObjectScanner {
            bits: BitAccumulator::new(),
            phase: Phase::Prolog,
            obj_len: 0,
            crc: 0,
            nibbles: 0,
        }
    }

    /// Feed one input byte.
    pub fn step(&mut self, byte: u8) -> Result<(), ScanError> {
        self.bits.push(u64::from(byte), 8)?;

        if self.obj_len == 0 {
            match self.phase {
                Phase::Prolog if self.bits.size() >= 20 => {
                    let prolog = self.bits.peek(20) as u32;
                    trace!("prolog {prolog:#07x}");
                    // the prolog's own five nibbles are consumed (and
                    // checksummed) below, so every extent starts at 5
                    self.obj_len = 5;
                    match size_rule(prolog) {
                        Some(SizeRule::Fixed(total)) => self.obj_len = total,
                        Some(SizeRule::LengthPrefixed) => self.phase = Phase::LengthField,
                        Some(SizeRule::AsciiCounted) => self.phase = Phase::AsciiCount,
                        Some(SizeRule::ExtendedAsciiCounted) => {
                            self.phase = Phase::ExtendedAsciiCount
                        }
                        Some(SizeRule::Directory) => {
                            self.phase = Phase::DirectoryField;
                            self.obj_len = 8;
                        }
                        None => return Err(ScanError::UnknownProlog(prolog)),
                    }
                }
                Phase::LengthField if self.bits.size() >= 20 => {
                    // the field counts itself, so it is consumed as data
                    self.obj_len = self.bits.peek(20);
                    self.phase = Phase::Prolog;
                }
                Phase::AsciiCount if self.bits.size() >= 8 => {
                    self.obj_len = 2 + 2 * self.bits.peek(8);
                    self.phase = Phase::Prolog;
                }
                Phase::ExtendedAsciiCount if self.bits.size() >= 8 => {
                    // count, characters, then the identical trailing count
                    self.obj_len = 4 + 2 * self.bits.peek(8);
                    self.phase = Phase::Prolog;
                }
                Phase::DirectoryField if self.bits.size() >= 20 => {
                    self.obj_len = self.bits.peek(20);
                    // a global name tag follows the directory prolog
                    self.phase = Phase::ExtendedAsciiCount;
                }
                _ => {}
            }
        }

        while self.obj_len > 0 && self.bits.size() >= 4 {
            let nibble = self.bits.pop(4)? as u8;
            self.crc = crc::update(self.crc, nibble);
            self.obj_len -= 1;
            self.nibbles += 1;
        }

        Ok(())
    }

    fn finish(self, rom_revision: char, filename_len: usize) -> ObjectRecord {
        ObjectRecord {
            rom_revision,
            checksum: self.crc,
            byte_length: self.nibbles as f64 / 2.0 + 4.5 + filename_len as f64,
        }
    }
}

/// Scan a whole object stream. `filename` is the name the object is (or
/// will be) stored under; its length enters the reported byte size.
pub fn scan<R: Read>(mut reader: R, filename: &str) -> Result<ObjectRecord, ScanError> {
    let mut header = [0u8; 5 + OBJECT_FILLER_LEN + 1];
    reader
        .read_exact(&mut header)
        .map_err(|_| ScanError::InvalidHeader)?;
    if &header[..5] != OBJECT_MAGIC {
        return Err(ScanError::InvalidHeader);
    }
    let rom_revision = char::from(header[5 + OBJECT_FILLER_LEN]);

    let mut scanner = ObjectScanner::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for &byte in &buf[..n] {
            scanner.step(byte)?;
        }
    }

    let record = scanner.finish(rom_revision, filename.len());
    debug!(
        "scanned {filename}: rev {}, crc {:#06x}, {} bytes",
        record.rom_revision, record.checksum, record.byte_length
    );
    Ok(record)
}

/// Check for the "%%HP:" text-transfer header. Used as the fallback
/// classification when [`scan`] reports [`ScanError::InvalidHeader`].
pub fn is_ascii_object(leading: &[u8]) -> bool {
    leading.len() >= ASCII_MAGIC.len() && &leading[..ASCII_MAGIC.len()] == ASCII_MAGIC
}
