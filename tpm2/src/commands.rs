// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command implementations
//!
//! This module provides high-level TPM operations.

use anyhow::{bail, Context, Result};
use tracing::debug;
use zeroize::Zeroizing;

use super::constants::*;
use super::device::*;
use super::marshal::*;
use super::session::{run_authorized, Auth};
use super::simulator::SimulatorConfig;
use super::types::*;

/// GetCapability page size for handle enumeration
const HANDLES_PER_PAGE: u32 = 64;

/// Result of CreatePrimary
#[derive(Debug, Clone)]
pub struct CreatedPrimary {
    pub handle: NamedHandle,
    pub public: TpmtPublic,
    /// Marshalled TPMT_PUBLIC as returned by the TPM
    pub public_area: Vec<u8>,
}

/// Result of Create: the wrapped object plus its creation record
#[derive(Debug, Clone)]
pub struct CreatedObject {
    pub private: Vec<u8>,
    pub public: Vec<u8>,
    pub creation_data: TpmsCreationData,
    pub creation_hash: Vec<u8>,
    pub creation_ticket: TpmtTkCreation,
}

/// Result of ReadPublic
#[derive(Debug, Clone)]
pub struct PublicInfo {
    pub public: TpmtPublic,
    pub public_area: Vec<u8>,
    pub name: Vec<u8>,
}

/// Pure Rust TPM context
pub struct TpmContext {
    device: TpmDevice,
}

impl TpmContext {
    /// Create a new TPM context with the given device path
    pub fn new(tcti_path: Option<&str>) -> Result<Self> {
        let device = match tcti_path {
            Some(path) => TpmDevice::open(path)?,
            None => TpmDevice::detect()?,
        };

        Ok(Self { device })
    }

    /// A context backed by a fresh in-process simulator
    pub fn simulator(config: SimulatorConfig) -> Self {
        Self {
            device: TpmDevice::simulator(config),
        }
    }

    pub fn from_device(device: TpmDevice) -> Self {
        Self { device }
    }

    /// Get the device path
    pub fn device_path(&self) -> &str {
        self.device.path()
    }

    /// Close the connection to the TPM
    pub fn close(self) {
        debug!("closing TPM context on {}", self.device.path());
    }

    /// Execute a command without an authorization area
    pub fn execute(&mut self, cmd: TpmCommand) -> Result<ResponseParts> {
        let code = cmd.code();
        let response = self.device.execute(&cmd.finalize()?)?;
        response.split(code)
    }

    /// Execute a command with one authorization per authorized handle
    pub fn execute_authorized(
        &mut self,
        cmd: TpmCommand,
        auths: &mut [Auth<'_>],
    ) -> Result<ResponseParts> {
        run_authorized(&mut self.device, cmd, auths)
    }

    // ==================== PCR Operations ====================

    /// Read PCR values for the given selection.
    ///
    /// A TPM returns at most eight digests per call; use [`Self::pcr_read_bank`]
    /// to read a whole bank.
    pub fn pcr_read(&mut self, pcr_selection: &TpmlPcrSelection) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut cmd = TpmCommand::new(TpmCc::PcrRead);
        cmd.add(pcr_selection);

        let parts = self.execute(cmd).context("PCR_Read failed")?;

        let mut buf = ResponseBuffer::new(&parts.parameters);
        let _update_counter = buf.get_u32()?;
        let pcr_selection_out = TpmlPcrSelection::unmarshal(&mut buf)?;
        let digest_list = TpmlDigest::unmarshal(&mut buf)?;

        // Map digests to PCR indices
        let mut result = Vec::new();
        let mut digests = digest_list.digests.into_iter();
        for (_, pcr_idx) in pcr_selection_out.iter_selected() {
            match digests.next() {
                Some(d) => result.push((pcr_idx, d.buffer)),
                None => break,
            }
        }

        Ok(result)
    }

    /// Read `pcrs` of one bank, issuing as many PCR_Read calls as needed
    pub fn pcr_read_bank(&mut self, hash_alg: TpmAlgId, pcrs: &[u32]) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut pending: Vec<u32> = pcrs.to_vec();
        let mut result = Vec::with_capacity(pcrs.len());
        while !pending.is_empty() {
            let selection = TpmlPcrSelection::single(hash_alg, &pending);
            let values = self.pcr_read(&selection)?;
            if values.is_empty() {
                bail!("PCR_Read returned no values for {:?} {:?}", hash_alg, pending);
            }
            pending.retain(|idx| !values.iter().any(|(i, _)| i == idx));
            result.extend(values);
        }
        result.sort_by_key(|(idx, _)| *idx);
        Ok(result)
    }

    /// Read a single PCR value
    pub fn pcr_read_single(&mut self, pcr_idx: u32, hash_alg: TpmAlgId) -> Result<Vec<u8>> {
        let selection = TpmlPcrSelection::single(hash_alg, &[pcr_idx]);
        let values = self.pcr_read(&selection)?;

        values
            .into_iter()
            .find(|(idx, _)| *idx == pcr_idx)
            .map(|(_, v)| v)
            .ok_or_else(|| anyhow::anyhow!("PCR {} not found in response", pcr_idx))
    }

    /// Extend a PCR with a hash value
    pub fn pcr_extend(&mut self, pcr: u32, hash: &[u8], hash_alg: TpmAlgId) -> Result<()> {
        let digest_values = TpmlDigestValues::single(TpmtHa {
            hash_alg,
            digest: hash.to_vec(),
        });

        let mut cmd = TpmCommand::new(TpmCc::PcrExtend);
        // pcrHandle
        cmd.add_handle(pcr);
        // digests
        cmd.add(&digest_values);

        self.execute_authorized(cmd, &mut [Auth::null()])
            .with_context(|| format!("PCR_Extend failed for PCR {}", pcr))?;

        debug!("extended PCR {}", pcr);
        Ok(())
    }

    // ==================== Object Operations ====================

    /// Create a primary key in the specified hierarchy
    pub fn create_primary(
        &mut self,
        hierarchy: u32,
        hierarchy_auth: Auth<'_>,
        template: &TpmtPublic,
        sensitive: &Tpm2bSensitiveCreate,
    ) -> Result<CreatedPrimary> {
        let public = Tpm2bPublic::from_template(template);

        let mut cmd = TpmCommand::new(TpmCc::CreatePrimary);
        // primaryHandle (hierarchy)
        cmd.add_handle(hierarchy);
        // inSensitive
        cmd.add(sensitive);
        // inPublic
        cmd.add(&public);
        // outsideInfo (empty)
        cmd.add_tpm2b_empty();
        // creationPCR (empty)
        cmd.add(&TpmlPcrSelection::default());

        let parts = self
            .execute_authorized(cmd, &mut [hierarchy_auth])
            .context("CreatePrimary failed")?;
        let handle = *parts
            .handles
            .first()
            .context("CreatePrimary returned no handle")?;

        let mut buf = ResponseBuffer::new(&parts.parameters);
        let out_public = Tpm2bPublic::unmarshal(&mut buf)?;
        let _creation_data = buf.get_tpm2b()?;
        let _creation_hash = buf.get_tpm2b()?;
        let _creation_ticket = TpmtTkCreation::unmarshal(&mut buf)?;
        let name = buf.get_tpm2b()?;

        debug!("created primary key with handle 0x{:08x}", handle);
        Ok(CreatedPrimary {
            handle: NamedHandle::new(handle, name),
            public: out_public.decode()?,
            public_area: out_public.public_area,
        })
    }

    /// Create an ordinary object under a loaded storage parent
    pub fn create(
        &mut self,
        parent: &NamedHandle,
        parent_auth: Auth<'_>,
        template: &TpmtPublic,
        sensitive: &Tpm2bSensitiveCreate,
    ) -> Result<CreatedObject> {
        let public = Tpm2bPublic::from_template(template);

        let mut cmd = TpmCommand::new(TpmCc::Create);
        // parentHandle
        cmd.add_named_handle(parent);
        // inSensitive
        cmd.add(sensitive);
        // inPublic
        cmd.add(&public);
        // outsideInfo (empty)
        cmd.add_tpm2b_empty();
        // creationPCR (empty)
        cmd.add(&TpmlPcrSelection::default());

        let parts = self
            .execute_authorized(cmd, &mut [parent_auth])
            .context("Create failed")?;

        let mut buf = ResponseBuffer::new(&parts.parameters);
        let out_private = Tpm2bPrivate::unmarshal(&mut buf)?;
        let out_public = Tpm2bPublic::unmarshal(&mut buf)?;
        let creation_data = buf.get_sized::<TpmsCreationData>()?;
        let creation_hash = buf.get_tpm2b()?;
        let creation_ticket = TpmtTkCreation::unmarshal(&mut buf)?;

        debug!("created object under 0x{:08x}", parent.handle);
        Ok(CreatedObject {
            private: out_private.buffer,
            public: out_public.public_area,
            creation_data,
            creation_hash,
            creation_ticket,
        })
    }

    /// Load an object's private/public pair under a parent
    pub fn load(
        &mut self,
        parent: &NamedHandle,
        parent_auth: Auth<'_>,
        private: &[u8],
        public: &[u8],
    ) -> Result<NamedHandle> {
        let mut cmd = TpmCommand::new(TpmCc::Load);
        // parentHandle
        cmd.add_named_handle(parent);
        // inPrivate
        cmd.add_tpm2b(private);
        // inPublic
        cmd.add_tpm2b(public);

        let parts = self
            .execute_authorized(cmd, &mut [parent_auth])
            .context("Load failed")?;
        let handle = *parts.handles.first().context("Load returned no handle")?;
        let name = ResponseBuffer::new(&parts.parameters).get_tpm2b()?;

        debug!("loaded object with handle 0x{:08x}", handle);
        Ok(NamedHandle::new(handle, name))
    }

    /// Re-wrap a duplicated object under `parent`, returning the new private
    pub fn import(
        &mut self,
        parent: &NamedHandle,
        parent_auth: Auth<'_>,
        object_public: &[u8],
        duplicate: &[u8],
        in_sym_seed: &[u8],
    ) -> Result<Vec<u8>> {
        let mut cmd = TpmCommand::new(TpmCc::Import);
        // parentHandle
        cmd.add_named_handle(parent);
        // encryptionKey (no inner wrapper)
        cmd.add_tpm2b_empty();
        // objectPublic
        cmd.add_tpm2b(object_public);
        // duplicate
        cmd.add_tpm2b(duplicate);
        // inSymSeed
        cmd.add_tpm2b(in_sym_seed);
        // symmetricAlg
        cmd.add(&TpmtSymDef::null());

        let parts = self
            .execute_authorized(cmd, &mut [parent_auth])
            .context("Import failed")?;
        let out_private = Tpm2bPrivate::unmarshal(&mut ResponseBuffer::new(&parts.parameters))?;

        debug!("imported object under 0x{:08x}", parent.handle);
        Ok(out_private.buffer)
    }

    /// Return the sealed data of a loaded keyed-hash object
    pub fn unseal(&mut self, item: &NamedHandle, auth: Auth<'_>) -> Result<Zeroizing<Vec<u8>>> {
        let mut cmd = TpmCommand::new(TpmCc::Unseal);
        cmd.add_named_handle(item);

        let parts = self
            .execute_authorized(cmd, &mut [auth])
            .context("Unseal failed")?;
        let data = Zeroizing::new(ResponseBuffer::new(&parts.parameters).get_tpm2b()?);

        debug!("unsealed {} bytes from TPM", data.len());
        Ok(data)
    }

    /// Read public area of a key
    pub fn read_public(&mut self, handle: u32) -> Result<PublicInfo> {
        let mut cmd = TpmCommand::new(TpmCc::ReadPublic);
        cmd.add_handle(handle);

        let parts = self.execute(cmd).context("ReadPublic failed")?;

        let mut buf = ResponseBuffer::new(&parts.parameters);
        let out_public = Tpm2bPublic::unmarshal(&mut buf)?;
        let name = buf.get_tpm2b()?;
        let _qualified_name = buf.get_tpm2b()?;

        Ok(PublicInfo {
            public: out_public.decode()?,
            public_area: out_public.public_area,
            name,
        })
    }

    // ==================== Handle Operations ====================

    /// Flush a context (handle)
    pub fn flush_context(&mut self, handle: u32) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_handle(handle);

        self.execute(cmd)
            .with_context(|| format!("FlushContext failed for 0x{:08x}", handle))?;

        debug!("flushed handle 0x{:08x}", handle);
        Ok(())
    }

    /// Enumerate live handles of one handle type
    pub fn get_handles(&mut self, ht: TpmHt) -> Result<Vec<u32>> {
        let mut handles = Vec::new();
        let mut property = ht.first();
        loop {
            let mut cmd = TpmCommand::new(TpmCc::GetCapability);
            cmd.add_u32(TpmCap::Handles as u32);
            cmd.add_u32(property);
            cmd.add_u32(HANDLES_PER_PAGE);

            let parts = self.execute(cmd).context("GetCapability failed")?;
            let mut buf = ResponseBuffer::new(&parts.parameters);
            let more_data = buf.get_u8()? != 0;
            let capability = buf.get_u32()?;
            if capability != TpmCap::Handles as u32 {
                bail!("GetCapability returned capability 0x{:x}", capability);
            }
            let page = TpmlHandle::unmarshal(&mut buf)?;

            // Loaded sessions are listed under one type but carry either the
            // HMAC or the policy session type byte, so page by the low bits.
            let Some(&last) = page.handles.last() else {
                break;
            };
            handles.extend(page.handles);
            if !more_data {
                break;
            }
            property = ht.first() | ((last & 0x00FF_FFFF) + 1);
        }
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::has_rc;

    fn sim() -> TpmContext {
        TpmContext::simulator(SimulatorConfig::default())
    }

    #[test]
    fn test_pcr_selection() {
        let sel = TpmsPcrSelection::sha256(&[0, 1, 2, 7]);
        assert_eq!(sel.hash, TpmAlgId::Sha256);
        // PCR 0, 1, 2, 7 = bits 0, 1, 2, 7 = 0b10000111 = 0x87
        assert_eq!(sel.pcr_select[0], 0x87);
    }

    #[test]
    fn test_pcr_extend_and_read() {
        let mut ctx = sim();
        let before = ctx.pcr_read_single(16, TpmAlgId::Sha256).unwrap();
        assert_eq!(before, vec![0u8; 32]);

        ctx.pcr_extend(16, &[0xAB; 32], TpmAlgId::Sha256).unwrap();
        let after = ctx.pcr_read_single(16, TpmAlgId::Sha256).unwrap();
        let expected =
            crate::crypto::hash(TpmAlgId::Sha256, &[&[0u8; 32], &[0xAB; 32]]).unwrap();
        assert_eq!(after, expected);
    }

    #[test]
    fn test_pcr_read_bank_covers_all() {
        let mut ctx = sim();
        let all: Vec<u32> = (0..PCR_COUNT).collect();
        let values = ctx.pcr_read_bank(TpmAlgId::Sha256, &all).unwrap();
        assert_eq!(values.len(), PCR_COUNT as usize);
        assert_eq!(values[23].0, 23);
    }

    #[test]
    fn test_create_primary_and_flush() {
        let mut ctx = sim();
        let primary = ctx
            .create_primary(
                tpm_rh::OWNER,
                Auth::null(),
                &TpmtPublic::ecc_storage_key(),
                &Tpm2bSensitiveCreate::empty(),
            )
            .unwrap();
        assert_eq!(TpmHt::of(primary.handle.handle), Some(TpmHt::Transient));
        assert_eq!(primary.handle.name, primary.public.name().unwrap());

        let info = ctx.read_public(primary.handle.handle).unwrap();
        assert_eq!(info.name, primary.handle.name);

        assert_eq!(ctx.get_handles(TpmHt::Transient).unwrap().len(), 1);
        ctx.flush_context(primary.handle.handle).unwrap();
        assert!(ctx.get_handles(TpmHt::Transient).unwrap().is_empty());

        let err = ctx.flush_context(primary.handle.handle).unwrap_err();
        assert!(has_rc(&err, TpmRc::Handle));
    }

    #[test]
    fn test_primary_is_deterministic() {
        let mut ctx = sim();
        let template = TpmtPublic::ecc_endorsement_key();
        let a = ctx
            .create_primary(
                tpm_rh::ENDORSEMENT,
                Auth::null(),
                &template,
                &Tpm2bSensitiveCreate::empty(),
            )
            .unwrap();
        let b = ctx
            .create_primary(
                tpm_rh::ENDORSEMENT,
                Auth::null(),
                &template,
                &Tpm2bSensitiveCreate::empty(),
            )
            .unwrap();
        assert_ne!(a.handle.handle, b.handle.handle);
        assert_eq!(a.public, b.public);
    }

    #[test]
    fn test_import_rejects_oversized_sealed_data() {
        use crate::protect::{self, DUPLICATE_LABEL};
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let mut ctx = sim();
        let srk = ctx
            .create_primary(
                tpm_rh::OWNER,
                Auth::null(),
                &TpmtPublic::ecc_storage_key(),
                &Tpm2bSensitiveCreate::empty(),
            )
            .unwrap();
        let sym = *srk.public.symmetric().unwrap();
        let mut rng = StdRng::seed_from_u64(11);

        let mut wrapped = |data: &[u8]| {
            let seed_value = vec![3u8; 32];
            let unique = protect::sealed_unique(TpmAlgId::Sha256, &seed_value, data).unwrap();
            let public = TpmtPublic::importable_sealed_object(Tpm2bDigest::empty(), unique);
            let sensitive = TpmtSensitive {
                sensitive_type: TpmAlgId::KeyedHash,
                auth_value: vec![],
                seed_value,
                sensitive: data.to_vec(),
            };
            let (seed, in_sym_seed) =
                protect::create_seed(&srk.public, DUPLICATE_LABEL, &mut rng).unwrap();
            let name = public.name().unwrap();
            let duplicate =
                protect::protect(srk.public.name_alg, &sym, &seed, &name, &sensitive).unwrap();
            (public.to_bytes(), duplicate, in_sym_seed)
        };

        let (public, duplicate, seed) = wrapped(&[0x5A; MAX_SYM_DATA]);
        ctx.import(&srk.handle, Auth::null(), &public, &duplicate, &seed)
            .unwrap();

        let (public, duplicate, seed) = wrapped(&[0x5A; MAX_SYM_DATA + 1]);
        let err = ctx
            .import(&srk.handle, Auth::null(), &public, &duplicate, &seed)
            .unwrap_err();
        assert!(has_rc(&err, TpmRc::Size));
    }
}
