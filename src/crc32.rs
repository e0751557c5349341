/*
simgtrunc, to truncate trailing chunks off Android sparse images: crc32 module
Copyright (C) 2024-present Guoxin "7Ji" Pu

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as
published by the Free Software Foundation, either version 3 of the
License, or (at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

const SIZE_PIECE: usize = 0x10000;

/// CRC32 over the expanded image, holes and fills included
#[derive(Clone, Default)]
pub(crate) struct Crc32Hasher {
    hasher: crc32fast::Hasher,
}

impl Crc32Hasher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        self.hasher.update(data)
    }

    pub(crate) fn update_zeros(&mut self, len: u64) {
        self.update_repeated(&[0; 4], len)
    }

    pub(crate) fn update_fill(&mut self, value: u32, len: u64) {
        self.update_repeated(&value.to_le_bytes(), len)
    }

    fn update_repeated(&mut self, pattern: &[u8; 4], len: u64) {
        let piece: Vec<u8> = pattern.iter().copied().cycle()
            .take(SIZE_PIECE).collect();
        let mut remaining = len;
        while remaining > 0 {
            let size = remaining.min(SIZE_PIECE as u64) as usize;
            self.hasher.update(&piece[..size]);
            remaining -= size as u64;
        }
    }

    /// Checksum of everything so far, the hasher can keep going
    pub(crate) fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}
