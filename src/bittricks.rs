// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
bit packing.

Virtual tile addresses are Morton-interleaved (X in the even bits, Y in the odd bits), so
an aligned power-of-two square of tiles is a contiguous address range and the parent of a
tile one mip level coarser is found by shifting the address right by two.

Feedback texels pack (space, level, x, y) into one `u32`:

| bits   | field                                   |
|--------|-----------------------------------------|
| 0..12  | tile x, relative to the page's own level |
| 12..24 | tile y, relative to the page's own level |
| 24..28 | level + 1 (0 also decodes as level 0)    |
| 28..32 | space id                                 |
*/

/// Feedback texels with this value did not sample any virtual texture.
pub const EMPTY_FEEDBACK: u32 = 0xFFFF_FFFF;

const TILE_MASK: u32 = 0xFFF;

/// Spreads the low 16 bits of `x` into the even bits of the result.
pub const fn morton_code2(x: u32) -> u32 {
    let mut x = x & 0x0000_FFFF;
    x = (x ^ (x << 8)) & 0x00FF_00FF;
    x = (x ^ (x << 4)) & 0x0F0F_0F0F;
    x = (x ^ (x << 2)) & 0x3333_3333;
    x = (x ^ (x << 1)) & 0x5555_5555;
    x
}

/// Inverse of [`morton_code2`]: gathers the even bits of `x`.
pub const fn reverse_morton_code2(x: u32) -> u32 {
    let mut x = x & 0x5555_5555;
    x = (x ^ (x >> 1)) & 0x3333_3333;
    x = (x ^ (x >> 2)) & 0x0F0F_0F0F;
    x = (x ^ (x >> 4)) & 0x00FF_00FF;
    x = (x ^ (x >> 8)) & 0x0000_FFFF;
    x
}

/// Interleaves a tile coordinate into a Morton address.
pub const fn morton_address(x: u32, y: u32) -> u32 {
    morton_code2(x) | (morton_code2(y) << 1)
}

/// Splits a Morton address back into `(x, y)`.
pub const fn morton_xy(address: u32) -> (u32, u32) {
    (reverse_morton_code2(address), reverse_morton_code2(address >> 1))
}

/// A decoded feedback texel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecodedPage {
    pub space: u8,
    /// The raw level field; `0` and `1` both mean level 0.
    pub level_plus_one: u8,
    pub level: u8,
    /// Tile x shifted up to be relative to level 0.
    pub x: u32,
    /// Tile y shifted up to be relative to level 0.
    pub y: u32,
}

impl DecodedPage {
    /// The Morton address of this page, relative to level 0.
    pub const fn address(&self) -> u32 {
        morton_address(self.x, self.y)
    }
}

/**
Packs a page request.  `x` and `y` are relative to `level` (that is, already shifted down).
*/
pub const fn encode_page(space: u8, level: u8, x: u32, y: u32) -> u32 {
    (x & TILE_MASK)
        | ((y & TILE_MASK) << 12)
        | (((level as u32 + 1) & 0xF) << 24)
        | ((space as u32 & 0xF) << 28)
}

pub const fn decode_page(packed: u32) -> DecodedPage {
    let level_plus_one = ((packed >> 24) & 0xF) as u8;
    let level = if level_plus_one == 0 { 0 } else { level_plus_one - 1 };
    DecodedPage {
        space: (packed >> 28) as u8,
        level_plus_one,
        level,
        x: (packed & TILE_MASK) << level,
        y: ((packed >> 12) & TILE_MASK) << level,
    }
}

/// `ceil(log2(x))`, with `ceil_log2(0) == 0`.
pub const fn ceil_log2(x: u32) -> u32 {
    if x <= 1 { 0 } else { 32 - (x - 1).leading_zeros() }
}
