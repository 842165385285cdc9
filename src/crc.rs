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

//! The Saturn nibble CRC shared by the object scanner and the transfer
//! protocol. It is the calculator's own checksum: one polynomial fold per
//! nibble, with bytes contributing their low nibble first.

/// Fold one nibble into the running CRC.
///
/// Only the low four bits of `nibble` participate.
pub fn update(crc: u16, nibble: u8) -> u16 {
    (crc >> 4) ^ (((crc ^ u16::from(nibble)) & 0xf).wrapping_mul(0x1081))
}

/// CRC over a byte slice, folding the low nibble of each byte before the
/// high nibble. This is the packing order the calculator firmware uses for
/// transfer packets; getting it backwards produces plausible-looking but
/// wrong checksums.
pub fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(0, |crc, &byte| {
        let crc = update(crc, byte & 0xf);
        update(crc, byte >> 4)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_values() {
        assert_eq!(checksum(&[]), 0);
        // 0x33 unpacks to nibbles 3, 3:
        //   update(0, 3)      = 3 * 0x1081 = 0x3183
        //   update(0x3183, 3) = 0x0318 ^ 0 = 0x0318
        assert_eq!(update(0, 3), 0x3183);
        assert_eq!(update(0x3183, 3), 0x0318);
        assert_eq!(checksum(&[0x33]), 0x0318);
    }

    #[test]
    fn test_nibble_order_is_low_first() {
        // 0x32 unpacks to nibbles 2, 3 and must not collide with 0x33
        assert_eq!(checksum(&[0x32]), 0x1291);
        assert_ne!(checksum(&[0x32]), checksum(&[0x33]));
        assert_ne!(checksum(&[0x12]), checksum(&[0x21]));
    }

    #[test]
    fn test_deterministic() {
        let data: Vec<u8> = (0..=255).collect();
        assert_eq!(checksum(&data), checksum(&data));
    }

    #[test]
    fn test_single_bit_flip_changes_checksum() {
        let mut data: Vec<u8> = (0..128).map(|i| (i * 7) as u8).collect();
        let original = checksum(&data);
        for pos in [0usize, 17, 63, 127] {
            for bit in 0..8 {
                data[pos] ^= 1 << bit;
                assert_ne!(checksum(&data), original, "flip at {pos} bit {bit}");
                data[pos] ^= 1 << bit;
            }
        }
    }
}
