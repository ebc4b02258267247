//! Bitfield with "have all" and "have none" sentinel states.
//!
//! A torrent with hundreds of thousands of pieces (or millions of blocks)
//! would need a multi-megabyte array just to say "I have nothing yet" or "I
//! have everything". The [`Bitfield`] only materializes its bits when the
//! set is partial, and keeps a cached popcount so that `count()`, `has_all()`
//! and `has_none()` are O(1).
//!
//! The serialization format is the same as the wire and resume format:
//! the high bit of each byte is the lowest index, and trailing bits beyond
//! `len()` are zero.
use std::{
    borrow::Cow,
    collections::TryReserveError,
    ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign},
};

use bitvec::prelude::*;

use crate::error::Error;

/// Raw storage of an explicit bitfield, where index = bit.
pub type Bits = BitVec<u8, Msb0>;

#[derive(Debug, Clone)]
enum Repr {
    None,
    All,
    Bits(Bits),
}

#[derive(Debug, Clone)]
pub struct Bitfield {
    bit_count: usize,
    true_count: usize,
    repr: Repr,
}

impl Default for Bitfield {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Number of bytes needed to store `bit_count` bits.
fn bytes_needed(bit_count: usize) -> usize {
    bit_count.div_ceil(8)
}

/// Mask of the bits of the last byte that are inside `bit_count`.
fn last_byte_mask(bit_count: usize) -> u8 {
    match bit_count % 8 {
        0 => 0xFF,
        rem => 0xFF << (8 - rem),
    }
}

/// Popcount of the bits `[begin, end)` of `bytes`.
///
/// Whole bytes are counted and the bits outside of the range on the first
/// and last byte are subtracted afterwards, so there is no shifting in the
/// loop. The loop keeps two accumulators over 64 bit words to avoid a
/// dependency chain between consecutive popcounts.
fn count_bytes(bytes: &[u8], begin: usize, end: usize) -> usize {
    debug_assert!(begin < end);
    debug_assert!(bytes_needed(end) <= bytes.len());

    let first = begin / 8;
    let last = (end - 1) / 8;
    let span = &bytes[first..=last];

    let mut words = span.chunks_exact(16);
    let (mut a, mut b) = (0usize, 0usize);
    for chunk in &mut words {
        let (lo, hi) = chunk.split_at(8);
        let lo = u64::from_ne_bytes(lo.try_into().unwrap_or_default());
        let hi = u64::from_ne_bytes(hi.try_into().unwrap_or_default());
        a += lo.count_ones() as usize;
        b += hi.count_ones() as usize;
    }
    for byte in words.remainder() {
        a += byte.count_ones() as usize;
    }

    // bits before `begin` on the first byte
    let head = !(0xFFu8 >> (begin % 8));
    // bits at or after `end` on the last byte
    let tail = !(0xFFu8 << (7 - (end - 1) % 8));

    a + b
        - (bytes[first] & head).count_ones() as usize
        - (bytes[last] & tail).count_ones() as usize
}

/// Explicit bits with every bit set to `value`, trailing bits cleared.
fn filled(bit_count: usize, value: bool) -> Bits {
    let n = bytes_needed(bit_count);
    let mut bytes = vec![if value { 0xFF } else { 0 }; n];
    if let Some(last) = bytes.last_mut() {
        *last &= last_byte_mask(bit_count);
    }
    let mut bits = Bits::from_vec(bytes);
    bits.truncate(bit_count);
    bits
}

fn try_alloc(n: usize) -> Result<Vec<u8>, TryReserveError> {
    let mut bytes = Vec::new();
    bytes.try_reserve_exact(n)?;
    bytes.resize(n, 0);
    Ok(bytes)
}

impl Bitfield {
    /// Create a bitfield of `bit_count` bits, all of them false.
    /// Nothing is allocated until the bitfield holds a partial set.
    pub fn new(bit_count: usize) -> Self {
        Self { bit_count, true_count: 0, repr: Repr::None }
    }

    /// Create a bitfield of `bit_count` bits, all of them true.
    pub fn new_all(bit_count: usize) -> Self {
        let mut bitfield = Self::new(bit_count);
        bitfield.set_has_all();
        bitfield
    }

    /// Create a bitfield of `bit_count` bits from the wire/resume format.
    pub fn from_raw(bit_count: usize, raw: &[u8]) -> Result<Self, Error> {
        let mut bitfield = Self::new(bit_count);
        bitfield.set_raw(raw)?;
        Ok(bitfield)
    }

    /// How many bits this bitfield holds, set or not.
    pub fn len(&self) -> usize {
        self.bit_count
    }

    pub fn is_empty(&self) -> bool {
        self.bit_count == 0
    }

    /// Return true if bit `i` is set, out of range bits are false.
    pub fn test(&self, i: usize) -> bool {
        if i >= self.bit_count {
            return false;
        }
        match &self.repr {
            Repr::None => false,
            Repr::All => true,
            Repr::Bits(bits) => bits[i],
        }
    }

    /// Set bit `i` to `value`. Out of range bits are ignored.
    pub fn set(&mut self, i: usize, value: bool) {
        if i >= self.bit_count || self.test(i) == value {
            return;
        }

        self.materialize().set(i, value);

        if value {
            self.true_count += 1;
        } else {
            self.true_count -= 1;
        }

        self.normalize();
    }

    pub fn unset(&mut self, i: usize) {
        self.set(i, false);
    }

    /// Set the bits `[begin, end)` to `value`, `end` is clamped to the
    /// length of the bitfield.
    pub fn set_span(&mut self, begin: usize, end: usize, value: bool) {
        let end = end.min(self.bit_count);
        if begin >= end {
            return;
        }

        let old = self.count_range(begin, end);
        let new = if value { end - begin } else { 0 };
        if old == new {
            return;
        }

        self.materialize()[begin..end].fill(value);

        self.true_count = self.true_count - old + new;
        self.normalize();
    }

    pub fn unset_span(&mut self, begin: usize, end: usize) {
        self.set_span(begin, end, false);
    }

    /// How many bits are set.
    pub fn count(&self) -> usize {
        self.true_count
    }

    /// How many bits are set in `[begin, end)`, `end` is clamped to the
    /// length of the bitfield.
    pub fn count_range(&self, begin: usize, end: usize) -> usize {
        let end = end.min(self.bit_count);
        if begin >= end {
            return 0;
        }
        match &self.repr {
            Repr::None => 0,
            Repr::All => end - begin,
            Repr::Bits(bits) => count_bytes(bits.as_raw_slice(), begin, end),
        }
    }

    pub fn has_all(&self) -> bool {
        matches!(self.repr, Repr::All)
    }

    pub fn has_none(&self) -> bool {
        matches!(self.repr, Repr::None)
    }

    pub fn set_has_all(&mut self) {
        self.repr = Repr::All;
        self.true_count = self.bit_count;
        self.normalize();
    }

    pub fn set_has_none(&mut self) {
        self.repr = Repr::None;
        self.true_count = 0;
    }

    /// Serialize into the wire/resume format, materializing the sentinel
    /// states.
    pub fn raw(&self) -> Vec<u8> {
        match &self.repr {
            Repr::None => vec![0; bytes_needed(self.bit_count)],
            Repr::All => filled(self.bit_count, true).into_vec(),
            Repr::Bits(bits) => bits.as_raw_slice().to_vec(),
        }
    }

    /// Load from the wire/resume format. Extra bytes and trailing bits
    /// beyond `len()` are ignored, missing bytes are read as zero.
    pub fn set_raw(&mut self, raw: &[u8]) -> Result<(), Error> {
        let n = bytes_needed(self.bit_count);
        let mut bytes = try_alloc(n).map_err(|_| Error::AllocationFailed(n))?;

        let copied = raw.len().min(n);
        bytes[..copied].copy_from_slice(&raw[..copied]);
        if let Some(last) = bytes.last_mut() {
            *last &= last_byte_mask(self.bit_count);
        }

        let true_count = bytes.iter().map(|b| b.count_ones() as usize).sum();
        let mut bits = Bits::from_vec(bytes);
        bits.truncate(self.bit_count);

        self.repr = Repr::Bits(bits);
        self.true_count = true_count;
        self.normalize();
        debug_assert!(self.is_valid());

        Ok(())
    }

    /// True if any bit is set in both bitfields.
    pub fn intersects(&self, other: &Bitfield) -> bool {
        if self.has_none() || other.has_none() {
            return false;
        }
        if self.has_all() {
            return other.count_range(0, self.bit_count) > 0;
        }
        if other.has_all() {
            return self.count_range(0, other.bit_count) > 0;
        }

        let (Repr::Bits(a), Repr::Bits(b)) = (&self.repr, &other.repr) else {
            return false;
        };

        a.as_raw_slice()
            .iter()
            .zip(b.as_raw_slice())
            .any(|(a, b)| a & b != 0)
    }

    /// Indices of the bits that are set, in ascending order.
    pub fn iter_ones(&self) -> Box<dyn Iterator<Item = usize> + '_> {
        match &self.repr {
            Repr::None => Box::new(std::iter::empty()),
            Repr::All => Box::new(0..self.bit_count),
            Repr::Bits(bits) => Box::new(bits.iter_ones()),
        }
    }

    /// Raw bytes without materializing anything for explicit bitfields.
    fn raw_cow(&self) -> Cow<'_, [u8]> {
        match &self.repr {
            Repr::Bits(bits) => Cow::Borrowed(bits.as_raw_slice()),
            _ => Cow::Owned(self.raw()),
        }
    }

    /// Turn a sentinel into explicit bits and return them.
    fn materialize(&mut self) -> &mut Bits {
        if !matches!(self.repr, Repr::Bits(_)) {
            let value = self.has_all();
            self.repr = Repr::Bits(filled(self.bit_count, value));
        }
        match &mut self.repr {
            Repr::Bits(bits) => bits,
            _ => unreachable!("bitfield was just materialized"),
        }
    }

    /// Drop the explicit bits when the set is full or empty.
    fn normalize(&mut self) {
        if self.true_count == 0 {
            self.repr = Repr::None;
        } else if self.true_count == self.bit_count {
            self.repr = Repr::All;
        }
    }

    /// Rebuild the popcount after a bulk byte-wise operation.
    fn rebuild_true_count(&mut self) {
        self.true_count = match &self.repr {
            Repr::None => 0,
            Repr::All => self.bit_count,
            Repr::Bits(bits) => bits.count_ones(),
        };
        self.normalize();
    }

    fn is_valid(&self) -> bool {
        match &self.repr {
            Repr::None => self.true_count == 0,
            Repr::All => {
                self.bit_count > 0 && self.true_count == self.bit_count
            }
            Repr::Bits(bits) => {
                let raw = bits.as_raw_slice();
                let padding_clear = raw
                    .last()
                    .map_or(true, |b| b & !last_byte_mask(self.bit_count) == 0);
                padding_clear && bits.count_ones() == self.true_count
            }
        }
    }
}

impl From<Bits> for Bitfield {
    fn from(mut bits: Bits) -> Self {
        bits.set_uninitialized(false);
        let mut bitfield = Self {
            bit_count: bits.len(),
            true_count: bits.count_ones(),
            repr: Repr::Bits(bits),
        };
        bitfield.normalize();
        bitfield
    }
}

impl PartialEq for Bitfield {
    fn eq(&self, other: &Self) -> bool {
        if self.bit_count != other.bit_count
            || self.true_count != other.true_count
        {
            return false;
        }
        match (&self.repr, &other.repr) {
            (Repr::Bits(a), Repr::Bits(b)) => a == b,
            // explicit bits are never full nor empty, so equal counts with a
            // sentinel on either side means both are the same sentinel.
            _ => true,
        }
    }
}

impl Eq for Bitfield {}

/// Union. Bits of `other` beyond `self.len()` are ignored.
impl BitOrAssign<&Bitfield> for Bitfield {
    fn bitor_assign(&mut self, other: &Bitfield) {
        if self.has_all() || other.has_none() {
            return;
        }
        if other.has_all() && other.bit_count >= self.bit_count {
            self.set_has_all();
            return;
        }
        if self.has_none() && other.bit_count == self.bit_count {
            *self = other.clone();
            return;
        }

        let bit_count = self.bit_count;
        let src = other.raw_cow();
        let dst = self.materialize().as_raw_mut_slice();
        for (a, b) in dst.iter_mut().zip(src.iter()) {
            *a |= b;
        }
        if let Some(last) = dst.last_mut() {
            *last &= last_byte_mask(bit_count);
        }

        self.rebuild_true_count();
        debug_assert!(self.is_valid());
    }
}

/// Intersection. Bits of `self` beyond `other.len()` are cleared.
impl BitAndAssign<&Bitfield> for Bitfield {
    fn bitand_assign(&mut self, other: &Bitfield) {
        if self.has_none() {
            return;
        }
        if other.has_none() {
            self.set_has_none();
            return;
        }
        if other.has_all() && other.bit_count >= self.bit_count {
            return;
        }
        if self.has_all() && other.bit_count == self.bit_count {
            *self = other.clone();
            return;
        }

        let src = other.raw_cow();
        let dst = self.materialize().as_raw_mut_slice();
        for (i, a) in dst.iter_mut().enumerate() {
            *a &= src.get(i).copied().unwrap_or(0);
        }

        self.rebuild_true_count();
        debug_assert!(self.is_valid());
    }
}

impl BitOr for &Bitfield {
    type Output = Bitfield;

    fn bitor(self, other: &Bitfield) -> Bitfield {
        let mut out = self.clone();
        out |= other;
        out
    }
}

impl BitAnd for &Bitfield {
    type Output = Bitfield;

    fn bitand(self, other: &Bitfield) -> Bitfield {
        let mut out = self.clone();
        out &= other;
        out
    }
}
