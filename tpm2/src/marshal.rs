// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 marshalling/unmarshalling utilities
//!
//! Big-endian encoders and decoders for TPM structures. Decoding failures are
//! reported as [`TpmError::Truncated`] so that a short or garbled blob is
//! classified as an integrity failure rather than a generic error.

use anyhow::{bail, Result};

use crate::error::TpmError;

/// Largest payload a TPM2B size prefix can describe
pub const TPM2B_MAX: usize = u16::MAX as usize;

/// Buffer for building TPM commands
#[derive(Debug, Default, Clone)]
pub struct CommandBuffer {
    data: Vec<u8>,
    /// Length of the first TPM2B payload that did not fit its size prefix
    oversized: Option<usize>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            oversized: None,
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Put a TPM2B structure (2-byte size prefix + data)
    ///
    /// A payload longer than [`TPM2B_MAX`] poisons the buffer: nothing is
    /// written for it and [`CommandBuffer::check`] fails from then on.
    pub fn put_tpm2b(&mut self, data: &[u8]) {
        if data.len() > TPM2B_MAX {
            self.oversized.get_or_insert(data.len());
            return;
        }
        self.put_u16(data.len() as u16);
        self.put_bytes(data);
    }

    /// Put an empty TPM2B structure
    pub fn put_tpm2b_empty(&mut self) {
        self.put_u16(0);
    }

    /// Put a TPM2B wrapping a nested structure built by `f`
    pub fn put_sized(&mut self, f: impl FnOnce(&mut CommandBuffer)) {
        let mut inner = CommandBuffer::new();
        f(&mut inner);
        if let Some(len) = inner.oversized {
            self.oversized.get_or_insert(len);
        }
        self.put_tpm2b(inner.as_bytes());
    }

    /// Fail if any TPM2B written so far was too long to encode
    pub fn check(&self) -> Result<()> {
        match self.oversized {
            Some(len) => bail!(TpmError::malformed(format!(
                "{len}-byte field exceeds the {TPM2B_MAX}-byte TPM2B limit"
            ))),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Update a u32 at a specific position (for size fields)
    pub fn update_u32(&mut self, pos: usize, v: u32) {
        self.data[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }
}

/// Buffer for parsing TPM responses
#[derive(Debug)]
pub struct ResponseBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(TpmError::Truncated {
                what,
                wanted: len,
                remaining: self.remaining(),
            }
            .into());
        }
        let data: &'a [u8] = self.data;
        let v = &data[self.pos..self.pos + len];
        self.pos += len;
        Ok(v)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2, "u16")?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8, "u64")?;
        let mut v = [0u8; 8];
        v.copy_from_slice(b);
        Ok(u64::from_be_bytes(v))
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len, "byte string")?.to_vec())
    }

    /// Get a TPM2B structure (2-byte size prefix + data)
    pub fn get_tpm2b(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        Ok(self.take(size, "TPM2B payload")?.to_vec())
    }

    /// Get a TPM2B wrapping a nested structure; the nested structure must
    /// consume the payload exactly.
    pub fn get_sized<T: Unmarshal>(&mut self) -> Result<T> {
        let size = self.get_u16()? as usize;
        let inner = self.take(size, "sized structure")?;
        T::from_bytes(inner)
    }

    /// Get remaining bytes
    pub fn get_remaining(&mut self) -> Vec<u8> {
        let v = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        v
    }

    /// Skip bytes
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len, "skipped bytes")?;
        Ok(())
    }

    /// Fail if any bytes are left unconsumed
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            bail!(TpmError::integrity(format!(
                "{} trailing bytes after structure",
                self.remaining()
            )));
        }
        Ok(())
    }
}

/// Trait for types that can be marshalled to TPM format
pub trait Marshal {
    fn marshal(&self, buf: &mut CommandBuffer);

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf);
        buf.into_vec()
    }
}

/// Trait for types that can be unmarshalled from TPM format
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self>;

    /// Decode a complete structure; trailing bytes are an error.
    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(data);
        let value = Self::unmarshal(&mut buf)?;
        buf.finish()?;
        Ok(value)
    }
}

impl Marshal for u8 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u8(*self);
    }
}

impl Marshal for u16 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(*self);
    }
}

impl Marshal for u32 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(*self);
    }
}

impl Unmarshal for u8 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u8()
    }
}

impl Unmarshal for u16 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u16()
    }
}

impl Unmarshal for u32 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCategory, TpmError};

    #[test]
    fn test_truncated_tpm2b_is_integrity_failure() {
        // Claims 8 bytes, carries 3
        let data = [0x00, 0x08, 0xAA, 0xBB, 0xCC];
        let err = ResponseBuffer::new(&data).get_tpm2b().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TpmError>(),
            Some(TpmError::Truncated {
                wanted: 8,
                remaining: 3,
                ..
            })
        ));
        assert_eq!(ErrorCategory::of(&err), ErrorCategory::Integrity);
    }

    #[test]
    fn test_sized_nesting() {
        let mut buf = CommandBuffer::new();
        buf.put_sized(|inner| {
            inner.put_u16(0x1234);
        });
        assert_eq!(buf.as_bytes(), &[0x00, 0x02, 0x12, 0x34]);

        let mut rsp = ResponseBuffer::new(buf.as_bytes());
        let v: u16 = rsp.get_sized().unwrap();
        assert_eq!(v, 0x1234);
        assert_eq!(rsp.remaining(), 0);
    }

    #[test]
    fn test_oversized_tpm2b_poisons_buffer() {
        let mut buf = CommandBuffer::new();
        buf.put_tpm2b(&[0x55; 16]);
        assert!(buf.check().is_ok());

        buf.put_tpm2b(&vec![0xAA; TPM2B_MAX + 1]);
        buf.put_u8(0x01);
        let err = buf.check().unwrap_err();
        assert_eq!(ErrorCategory::of(&err), ErrorCategory::MalformedInput);
        // Nothing of the oversized field reached the buffer
        assert_eq!(buf.len(), 2 + 16 + 1);

        let mut outer = CommandBuffer::new();
        outer.put_sized(|inner| inner.put_tpm2b(&vec![0; TPM2B_MAX + 7]));
        assert!(outer.check().is_err());

        let mut exact = CommandBuffer::new();
        exact.put_tpm2b(&vec![0; TPM2B_MAX]);
        assert!(exact.check().is_ok());
        assert_eq!(exact.len(), 2 + TPM2B_MAX);
    }

    #[test]
    fn test_from_bytes_rejects_trailing_data() {
        assert!(u16::from_bytes(&[0x00, 0x01, 0xFF]).is_err());
        assert_eq!(u16::from_bytes(&[0x00, 0x01]).unwrap(), 1);
    }
}
