//! # Register Data Formats
//!
//! Multi-register scalars (32/64-bit integers, float, double) are carried as
//! consecutive big-endian 16-bit registers, but devices disagree on how the
//! value's bytes are laid out across them. With `A` as the most significant
//! byte, the four layouts for `0x12345678` are:
//!
//! | Format | Wire bytes            | Description                     |
//! |--------|-----------------------|---------------------------------|
//! | ABCD   | `12 34 56 78`         | big-endian                      |
//! | BADC   | `34 12 78 56`         | bytes swapped inside each word  |
//! | CDAB   | `56 78 12 34`         | words swapped (common in PLCs)  |
//! | DCBA   | `78 56 34 12`         | little-endian                   |
//!
//! For 64-bit values the same rules extend over four words (`CDAB` becomes
//! `GHEFCDAB`).
//!
//! The orthogonal *reverse* flag reverses the value's whole wire image. It
//! applies to 16-bit scalars (a byte swap) and, as a pre-step, to wider ones.
//! Every permutation here is an involution, so encoding applies the same two
//! steps in the opposite order.

use std::fmt;
use std::str::FromStr;

use crate::error::ModbusError;

/// Byte layout of multi-register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataFormat {
    #[default]
    ABCD,
    BADC,
    CDAB,
    DCBA,
}

impl DataFormat {
    pub const ALL: [DataFormat; 4] = [
        DataFormat::ABCD,
        DataFormat::BADC,
        DataFormat::CDAB,
        DataFormat::DCBA,
    ];

    /// Resolve a format name or one of its common aliases.
    ///
    /// Case, `-` and `_` are ignored: `"cd-ab"`, `"BIG_ENDIAN_SWAP"` and
    /// `"CDAB"` all name the same layout.
    pub fn from_name(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "ABCD" | "BE" | "BIGENDIAN" | "ABCDEFGH" => Some(Self::ABCD),
            "DCBA" | "LE" | "LITTLEENDIAN" | "HGFEDCBA" => Some(Self::DCBA),
            "CDAB" | "BIGENDIANSWAP" | "GHEFCDAB" => Some(Self::CDAB),
            "BADC" | "LITTLEENDIANSWAP" | "BADCFEHG" => Some(Self::BADC),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ABCD => "ABCD",
            Self::BADC => "BADC",
            Self::CDAB => "CDAB",
            Self::DCBA => "DCBA",
        }
    }

    /// Words appear in reverse order on the wire.
    #[inline]
    pub fn has_word_swap(&self) -> bool {
        matches!(self, Self::CDAB | Self::DCBA)
    }

    /// Bytes inside each word appear swapped on the wire.
    #[inline]
    pub fn has_byte_swap(&self) -> bool {
        matches!(self, Self::BADC | Self::DCBA)
    }

    /// Permute `bytes` between wire order and big-endian order.
    ///
    /// `bytes.len()` must be even. Applying twice is the identity.
    pub fn permute(&self, bytes: &mut [u8]) {
        if self.has_word_swap() {
            // full reversal then per-word swap leaves bytes inside words intact
            bytes.reverse();
            swap_word_bytes(bytes);
        }
        if self.has_byte_swap() {
            swap_word_bytes(bytes);
        }
    }
}

fn swap_word_bytes(bytes: &mut [u8]) {
    for word in bytes.chunks_exact_mut(2) {
        word.swap(0, 1);
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataFormat {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
            .ok_or_else(|| ModbusError::configuration(format!("unknown data format '{}'", s)))
    }
}

// ============================================================================
// Wire <-> big-endian reordering
// ============================================================================

/// Turn a value's wire image into big-endian bytes, in place.
///
/// 16-bit images only honour `reverse`; the data format is a multi-register
/// concept.
#[inline]
pub fn wire_to_big_endian(bytes: &mut [u8], format: DataFormat, reverse: bool) {
    if reverse {
        bytes.reverse();
    }
    if bytes.len() > 2 {
        format.permute(bytes);
    }
}

/// Turn big-endian bytes into the value's wire image, in place.
#[inline]
pub fn big_endian_to_wire(bytes: &mut [u8], format: DataFormat, reverse: bool) {
    if bytes.len() > 2 {
        format.permute(bytes);
    }
    if reverse {
        bytes.reverse();
    }
}
