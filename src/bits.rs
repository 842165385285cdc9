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

//! A small bit queue used by the object scanner. Whole bytes are pushed
//! onto the high end and nibble-sized windows popped off the low end, which
//! is what puts a Saturn nibble stream back in its natural order.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BitError {
    /// More than 64 bits buffered. The scanner never legitimately gets
    /// close to this; it means the input is malformed.
    #[error("bit accumulator overflow")]
    Overflow,

    /// More bits requested than are buffered; a scanning logic error.
    #[error("bit accumulator underflow")]
    Underflow,
}

#[derive(Debug, Default)]
pub struct BitAccumulator {
    buf: u64,
    size: u32,
}

fn low_bits(count: u32) -> u64 {
    if count >= 64 {
        u64::MAX
    } else {
        (1u64 << count) - 1
    }
}

impl BitAccumulator {
    pub fn new() -> BitAccumulator {
        BitAccumulator { buf: 0, size: 0 }
    }

    /// Number of buffered bits.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Push the low `count` bits of `bits` onto the high end.
    pub fn push(&mut self, bits: u64, count: u32) -> Result<(), BitError> {
        if self.size + count > 64 {
            return Err(BitError::Overflow);
        }
        self.buf |= (bits & low_bits(count)) << self.size;
        self.size += count;
        Ok(())
    }

    /// Pop the low `count` bits.
    pub fn pop(&mut self, count: u32) -> Result<u64, BitError> {
        if count > self.size {
            return Err(BitError::Underflow);
        }
        let bits = self.buf & low_bits(count);
        self.buf >>= count;
        self.size -= count;
        Ok(bits)
    }

    /// Read the low `count` bits without consuming them. The caller is
    /// expected to have checked `size()` first.
    pub fn peek(&self, count: u32) -> u64 {
        self.buf & low_bits(count)
    }
}
