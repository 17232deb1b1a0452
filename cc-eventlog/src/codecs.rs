// SPDX-FileCopyrightText: © 2024 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! A vector whose SCALE length prefix is a fixed-width integer `L` rather
//! than a compact integer, as found in TCG structures.

use core::marker::PhantomData;
use core::ops::Deref;

use scale::{Decode, Encode, Error, Input, Output};

#[derive(Clone, PartialEq, Eq)]
pub struct VecOf<L, T> {
    inner: Vec<T>,
    _len: PhantomData<L>,
}

impl<L, T> VecOf<L, T> {
    pub fn into_inner(self) -> Vec<T> {
        self.inner
    }
}

impl<L, T> Default for VecOf<L, T> {
    fn default() -> Self {
        Vec::new().into()
    }
}

impl<L, T: core::fmt::Debug> core::fmt::Debug for VecOf<L, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.inner.fmt(f)
    }
}

impl<L, T> Deref for VecOf<L, T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<L, T> From<Vec<T>> for VecOf<L, T> {
    fn from(inner: Vec<T>) -> Self {
        Self {
            inner,
            _len: PhantomData,
        }
    }
}

/// The length element is accepted for symmetry with the wire layout; the
/// vector's own length is authoritative.
impl<L, T> From<(L, Vec<T>)> for VecOf<L, T> {
    fn from((_, inner): (L, Vec<T>)) -> Self {
        inner.into()
    }
}

impl<L, T> From<VecOf<L, T>> for Vec<T> {
    fn from(v: VecOf<L, T>) -> Self {
        v.inner
    }
}

impl<L, T> Decode for VecOf<L, T>
where
    L: Decode + TryInto<usize>,
    T: Decode,
{
    fn decode<I: Input>(input: &mut I) -> Result<Self, Error> {
        let len: usize = L::decode(input)?
            .try_into()
            .map_err(|_| Error::from("length prefix does not fit in usize"))?;
        // Every element takes at least one byte, so a larger count is a lie
        if let Some(remaining) = input.remaining_len()? {
            if core::mem::size_of::<T>() > 0 && len > remaining {
                return Err("length prefix exceeds input".into());
            }
        }
        let mut inner = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            inner.push(T::decode(input)?);
        }
        Ok(inner.into())
    }
}

impl<L, T> Encode for VecOf<L, T>
where
    L: Encode + TryFrom<usize>,
    T: Encode,
{
    fn encode_to<O: Output + ?Sized>(&self, dest: &mut O) {
        // A vector too long for its prefix encodes as nothing
        let len = match L::try_from(self.inner.len()) {
            Ok(len) => len,
            Err(_) => return,
        };
        len.encode_to(dest);
        for item in &self.inner {
            item.encode_to(dest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_prefix() {
        let v: VecOf<u32, u8> = vec![1, 2, 3].into();
        assert_eq!(v.encode(), vec![3, 0, 0, 0, 1, 2, 3]);

        let v: VecOf<u8, u16> = vec![0x0102].into();
        assert_eq!(v.encode(), vec![1, 0x02, 0x01]);
    }

    #[test]
    fn test_decode() {
        let v = VecOf::<u32, u8>::decode(&mut &[2, 0, 0, 0, 9, 8][..]).unwrap();
        assert_eq!(v.as_slice(), &[9, 8]);
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        assert!(VecOf::<u32, u8>::decode(&mut &[0xFF, 0xFF, 0xFF, 0x7F, 1][..]).is_err());
    }
}
