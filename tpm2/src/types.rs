// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 data types

use anyhow::{anyhow, bail, Result};

use super::constants::*;
use super::crypto;
use super::marshal::*;

fn alg_from_u16(v: u16) -> Result<TpmAlgId> {
    TpmAlgId::from_u16(v).ok_or_else(|| anyhow!("unknown algorithm: 0x{:04x}", v))
}

fn hash_alg_from_u16(v: u16) -> Result<TpmAlgId> {
    let alg = alg_from_u16(v)?;
    if !alg.is_hash() {
        bail!("not a hash algorithm: {:?}", alg);
    }
    Ok(alg)
}

/// TPM2B_DIGEST - Variable length digest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tpm2bDigest {
    pub buffer: Vec<u8>,
}

impl Tpm2bDigest {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }

    pub fn empty() -> Self {
        Self { buffer: Vec::new() }
    }
}

impl Marshal for Tpm2bDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPM2B_NONCE - Nonce value
pub type Tpm2bNonce = Tpm2bDigest;

/// TPM2B_SENSITIVE_DATA - Sensitive data for sealing
#[derive(Debug, Clone, Default)]
pub struct Tpm2bSensitiveData {
    pub buffer: Vec<u8>,
}

impl Tpm2bSensitiveData {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }
}

impl Marshal for Tpm2bSensitiveData {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bSensitiveData {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPM2B_AUTH - Authorization value
#[derive(Debug, Clone, Default)]
pub struct Tpm2bAuth {
    pub buffer: Vec<u8>,
}

impl Tpm2bAuth {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }

    pub fn empty() -> Self {
        Self { buffer: Vec::new() }
    }
}

impl Marshal for Tpm2bAuth {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bAuth {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// A handle together with its TPM name, as needed for cpHash computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedHandle {
    pub handle: u32,
    pub name: Vec<u8>,
}

impl NamedHandle {
    pub fn new(handle: u32, name: Vec<u8>) -> Self {
        Self { handle, name }
    }

    /// Permanent handles (hierarchies, PCRs) are named by their handle value
    pub fn permanent(handle: u32) -> Self {
        Self {
            handle,
            name: handle.to_be_bytes().to_vec(),
        }
    }
}

/// TPMS_PCR_SELECTION - PCR selection for a single hash algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsPcrSelection {
    pub hash: TpmAlgId,
    pub pcr_select: Vec<u8>, // Bitmap of selected PCRs
}

impl TpmsPcrSelection {
    pub fn new(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        // Calculate required size (at least 3 bytes for PCR 0-23)
        let max_pcr = pcrs.iter().max().copied().unwrap_or(0);
        let size = ((max_pcr / 8) + 1).max(3) as usize;
        let mut pcr_select = vec![0u8; size];

        for &pcr in pcrs {
            let byte_idx = (pcr / 8) as usize;
            let bit_idx = pcr % 8;
            if byte_idx < pcr_select.len() {
                pcr_select[byte_idx] |= 1 << bit_idx;
            }
        }

        Self { hash, pcr_select }
    }

    pub fn sha256(pcrs: &[u32]) -> Self {
        Self::new(TpmAlgId::Sha256, pcrs)
    }

    /// Selected PCR indices in ascending order
    pub fn indices(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (byte_idx, &byte) in self.pcr_select.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    out.push((byte_idx * 8 + bit) as u32);
                }
            }
        }
        out
    }
}

impl Marshal for TpmsPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash.to_u16());
        buf.put_u8(self.pcr_select.len() as u8);
        buf.put_bytes(&self.pcr_select);
    }
}

impl Unmarshal for TpmsPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash = hash_alg_from_u16(buf.get_u16()?)?;
        let size = buf.get_u8()? as usize;
        let pcr_select = buf.get_bytes(size)?;
        Ok(Self { hash, pcr_select })
    }
}

/// TPML_PCR_SELECTION - List of PCR selections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlPcrSelection {
    pub pcr_selections: Vec<TpmsPcrSelection>,
}

impl TpmlPcrSelection {
    pub fn new(selections: Vec<TpmsPcrSelection>) -> Self {
        Self {
            pcr_selections: selections,
        }
    }

    pub fn single(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        Self {
            pcr_selections: vec![TpmsPcrSelection::new(hash, pcrs)],
        }
    }

    /// `(bank, index)` pairs in the order the module concatenates PCR values
    pub fn iter_selected(&self) -> impl Iterator<Item = (TpmAlgId, u32)> + '_ {
        self.pcr_selections
            .iter()
            .flat_map(|sel| sel.indices().into_iter().map(move |idx| (sel.hash, idx)))
    }

    pub fn is_empty(&self) -> bool {
        self.iter_selected().next().is_none()
    }
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.pcr_selections.len() as u32);
        for sel in &self.pcr_selections {
            sel.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        if count > 16 {
            bail!("too many PCR selections: {}", count);
        }
        let mut pcr_selections = Vec::with_capacity(count);
        for _ in 0..count {
            pcr_selections.push(TpmsPcrSelection::unmarshal(buf)?);
        }
        Ok(Self { pcr_selections })
    }
}

/// TPML_DIGEST - List of digests
#[derive(Debug, Clone, Default)]
pub struct TpmlDigest {
    pub digests: Vec<Tpm2bDigest>,
}

impl Marshal for TpmlDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.digests.len() as u32);
        for d in &self.digests {
            d.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        if count > PCR_COUNT as usize * 4 {
            bail!("too many digests: {}", count);
        }
        let mut digests = Vec::with_capacity(count);
        for _ in 0..count {
            digests.push(Tpm2bDigest::unmarshal(buf)?);
        }
        Ok(Self { digests })
    }
}

/// TPML_HANDLE - List of handles (GetCapability)
#[derive(Debug, Clone, Default)]
pub struct TpmlHandle {
    pub handles: Vec<u32>,
}

impl Marshal for TpmlHandle {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.handles.len() as u32);
        for h in &self.handles {
            buf.put_u32(*h);
        }
    }
}

impl Unmarshal for TpmlHandle {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        if count > buf.remaining() / 4 {
            bail!("handle list claims {} entries", count);
        }
        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            handles.push(buf.get_u32()?);
        }
        Ok(Self { handles })
    }
}

/// TPMT_SYM_DEF - Symmetric algorithm definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }

    pub fn aes_128_cfb() -> Self {
        Self {
            algorithm: TpmAlgId::Aes,
            key_bits: 128,
            mode: TpmAlgId::Cfb,
        }
    }

    pub fn is_null(&self) -> bool {
        self.algorithm == TpmAlgId::Null
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.algorithm.to_u16());
        if self.algorithm != TpmAlgId::Null {
            buf.put_u16(self.key_bits);
            buf.put_u16(self.mode.to_u16());
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let algorithm = alg_from_u16(buf.get_u16()?)?;
        if algorithm == TpmAlgId::Null {
            Ok(Self::null())
        } else {
            let key_bits = buf.get_u16()?;
            let mode = alg_from_u16(buf.get_u16()?)?;
            Ok(Self {
                algorithm,
                key_bits,
                mode,
            })
        }
    }
}

/// TPMT_SYM_DEF_OBJECT - Symmetric definition for objects
pub type TpmtSymDefObject = TpmtSymDef;

/// TPMT_ECC_SCHEME - ECC scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtEccScheme {
    pub scheme: TpmAlgId,
    pub hash_alg: Option<TpmAlgId>,
}

/// TPMT_KDF_SCHEME shares the scheme-plus-optional-hash layout
pub type TpmtKdfScheme = TpmtEccScheme;

impl TpmtEccScheme {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
            hash_alg: None,
        }
    }
}

impl Marshal for TpmtEccScheme {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.scheme.to_u16());
        if let Some(hash) = self.hash_alg {
            buf.put_u16(hash.to_u16());
        }
    }
}

impl Unmarshal for TpmtEccScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = alg_from_u16(buf.get_u16()?)?;
        let hash_alg = if scheme == TpmAlgId::Null {
            None
        } else {
            Some(hash_alg_from_u16(buf.get_u16()?)?)
        };
        Ok(Self { scheme, hash_alg })
    }
}

/// TPMS_ECC_PARMS - ECC key parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsEccParms {
    pub symmetric: TpmtSymDefObject,
    pub scheme: TpmtEccScheme,
    pub curve_id: TpmEccCurve,
    pub kdf: TpmtKdfScheme,
}

impl TpmsEccParms {
    /// Restricted decryption key parameters: AES-128-CFB, P-256, no scheme
    pub fn storage_key() -> Self {
        Self {
            symmetric: TpmtSymDef::aes_128_cfb(),
            scheme: TpmtEccScheme::null(),
            curve_id: TpmEccCurve::NistP256,
            kdf: TpmtKdfScheme::null(),
        }
    }
}

impl Marshal for TpmsEccParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.curve_id.to_u16());
        self.kdf.marshal(buf);
    }
}

impl Unmarshal for TpmsEccParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let symmetric = TpmtSymDef::unmarshal(buf)?;
        let scheme = TpmtEccScheme::unmarshal(buf)?;
        let curve = buf.get_u16()?;
        let curve_id = TpmEccCurve::from_u16(curve)
            .ok_or_else(|| anyhow!("unsupported ECC curve: 0x{:04x}", curve))?;
        let kdf = TpmtKdfScheme::unmarshal(buf)?;
        Ok(Self {
            symmetric,
            scheme,
            curve_id,
            kdf,
        })
    }
}

/// TPMS_KEYEDHASH_PARMS - Keyed hash parameters (for sealed data)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmsKeyedHashParms {
    pub scheme: TpmAlgId,
}

impl TpmsKeyedHashParms {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
        }
    }
}

impl Marshal for TpmsKeyedHashParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.scheme.to_u16());
    }
}

impl Unmarshal for TpmsKeyedHashParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = alg_from_u16(buf.get_u16()?)?;
        if scheme != TpmAlgId::Null {
            bail!("unsupported keyed hash scheme: {:?}", scheme);
        }
        Ok(Self { scheme })
    }
}

/// TPMS_ECC_POINT - Affine point on an ECC curve
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmsEccPoint {
    pub x: Vec<u8>,
    pub y: Vec<u8>,
}

impl Marshal for TpmsEccPoint {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.x);
        buf.put_tpm2b(&self.y);
    }
}

impl Unmarshal for TpmsEccPoint {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let x = buf.get_tpm2b()?;
        let y = buf.get_tpm2b()?;
        Ok(Self { x, y })
    }
}

/// TPMU_PUBLIC_PARMS - Public parameters union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicParms {
    Ecc(TpmsEccParms),
    KeyedHash(TpmsKeyedHashParms),
}

impl Marshal for TpmtPublicParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtPublicParms::Ecc(p) => p.marshal(buf),
            TpmtPublicParms::KeyedHash(p) => p.marshal(buf),
        }
    }
}

/// TPMU_PUBLIC_ID - Unique identifier union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicUnique {
    Ecc(TpmsEccPoint),
    KeyedHash(Vec<u8>), // TPM2B_DIGEST
}

impl Marshal for TpmtPublicUnique {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtPublicUnique::Ecc(point) => point.marshal(buf),
            TpmtPublicUnique::KeyedHash(d) => buf.put_tpm2b(d),
        }
    }
}

/// TPMT_PUBLIC - Public area template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtPublic {
    pub type_alg: TpmAlgId,
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Tpm2bDigest,
    pub parameters: TpmtPublicParms,
    pub unique: TpmtPublicUnique,
}

impl TpmtPublic {
    /// ECC P-256 storage root key template (TCG provisioning guidance)
    pub fn ecc_storage_key() -> Self {
        Self {
            type_alg: TpmAlgId::Ecc,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_no_da()
                .with_restricted()
                .with_decrypt(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::Ecc(TpmsEccParms::storage_key()),
            unique: TpmtPublicUnique::Ecc(TpmsEccPoint::default()),
        }
    }

    /// ECC P-256 endorsement key template (TCG EK credential profile, L-2)
    pub fn ecc_endorsement_key() -> Self {
        Self {
            type_alg: TpmAlgId::Ecc,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_admin_with_policy()
                .with_restricted()
                .with_decrypt(),
            auth_policy: Tpm2bDigest::new(EK_AUTH_POLICY.to_vec()),
            parameters: TpmtPublicParms::Ecc(TpmsEccParms::storage_key()),
            unique: TpmtPublicUnique::Ecc(TpmsEccPoint {
                x: vec![0; 32],
                y: vec![0; 32],
            }),
        }
    }

    /// Create a sealed data object template
    pub fn sealed_object(policy_digest: Tpm2bDigest) -> Self {
        // If policy_digest is empty, use userWithAuth; otherwise use adminWithPolicy
        let object_attributes = if policy_digest.buffer.is_empty() {
            TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_user_with_auth()
        } else {
            TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_admin_with_policy()
        };

        Self {
            type_alg: TpmAlgId::KeyedHash,
            name_alg: TpmAlgId::Sha256,
            object_attributes,
            auth_policy: policy_digest,
            parameters: TpmtPublicParms::KeyedHash(TpmsKeyedHashParms::null()),
            unique: TpmtPublicUnique::KeyedHash(Vec::new()),
        }
    }

    /// Sealed data object unlocked by its authorization value
    pub fn sealed_object_with_auth() -> Self {
        Self {
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_user_with_auth()
                .with_no_da(),
            ..Self::sealed_object(Tpm2bDigest::empty())
        }
    }

    /// Sealed data object built off-device for import under a foreign parent.
    ///
    /// Duplicated objects cannot be fixedTPM or fixedParent. With a policy the
    /// object is usable only through the policy.
    pub fn importable_sealed_object(policy_digest: Tpm2bDigest, unique: Vec<u8>) -> Self {
        let object_attributes = if policy_digest.buffer.is_empty() {
            TpmaObject::new().with_user_with_auth()
        } else {
            TpmaObject::new()
        };
        Self {
            type_alg: TpmAlgId::KeyedHash,
            name_alg: TpmAlgId::Sha256,
            object_attributes,
            auth_policy: policy_digest,
            parameters: TpmtPublicParms::KeyedHash(TpmsKeyedHashParms::null()),
            unique: TpmtPublicUnique::KeyedHash(unique),
        }
    }

    /// Object name: `nameAlg || H_nameAlg(TPMT_PUBLIC)`
    pub fn name(&self) -> Result<Vec<u8>> {
        let digest = crypto::hash(self.name_alg, &[&self.to_bytes()])?;
        let mut name = self.name_alg.to_u16().to_be_bytes().to_vec();
        name.extend_from_slice(&digest);
        Ok(name)
    }

    pub fn ecc_point(&self) -> Option<&TpmsEccPoint> {
        match &self.unique {
            TpmtPublicUnique::Ecc(point) => Some(point),
            TpmtPublicUnique::KeyedHash(_) => None,
        }
    }

    pub fn symmetric(&self) -> Option<&TpmtSymDef> {
        match &self.parameters {
            TpmtPublicParms::Ecc(p) => Some(&p.symmetric),
            TpmtPublicParms::KeyedHash(_) => None,
        }
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.type_alg.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        self.auth_policy.marshal(buf);
        self.parameters.marshal(buf);
        self.unique.marshal(buf);
    }
}

impl Unmarshal for TpmtPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let type_alg = alg_from_u16(buf.get_u16()?)?;
        let name_alg = hash_alg_from_u16(buf.get_u16()?)?;
        let object_attributes = TpmaObject(buf.get_u32()?);
        let auth_policy = Tpm2bDigest::unmarshal(buf)?;
        let (parameters, unique) = match type_alg {
            TpmAlgId::Ecc => (
                TpmtPublicParms::Ecc(TpmsEccParms::unmarshal(buf)?),
                TpmtPublicUnique::Ecc(TpmsEccPoint::unmarshal(buf)?),
            ),
            TpmAlgId::KeyedHash => (
                TpmtPublicParms::KeyedHash(TpmsKeyedHashParms::unmarshal(buf)?),
                TpmtPublicUnique::KeyedHash(buf.get_tpm2b()?),
            ),
            other => bail!("unsupported object type: {:?}", other),
        };
        Ok(Self {
            type_alg,
            name_alg,
            object_attributes,
            auth_policy,
            parameters,
            unique,
        })
    }
}

/// TPM2B_PUBLIC - Public area with size prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm2bPublic {
    pub public_area: Vec<u8>, // Raw marshalled TPMT_PUBLIC
}

impl Tpm2bPublic {
    pub fn from_template(template: &TpmtPublic) -> Self {
        Self {
            public_area: template.to_bytes(),
        }
    }

    pub fn decode(&self) -> Result<TpmtPublic> {
        TpmtPublic::from_bytes(&self.public_area)
    }
}

impl Marshal for Tpm2bPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.public_area);
    }
}

impl Unmarshal for Tpm2bPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let public_area = buf.get_tpm2b()?;
        Ok(Self { public_area })
    }
}

/// TPM2B_PRIVATE - Private area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm2bPrivate {
    pub buffer: Vec<u8>,
}

impl Tpm2bPrivate {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }
}

impl Marshal for Tpm2bPrivate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bPrivate {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPM2B_SENSITIVE_CREATE - Sensitive data for object creation
#[derive(Debug, Clone, Default)]
pub struct Tpm2bSensitiveCreate {
    pub user_auth: Tpm2bAuth,
    pub data: Tpm2bSensitiveData,
}

impl Tpm2bSensitiveCreate {
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            user_auth: Tpm2bAuth::empty(),
            data: Tpm2bSensitiveData::new(data),
        }
    }

    pub fn with_auth(user_auth: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            user_auth: Tpm2bAuth::new(user_auth),
            data: Tpm2bSensitiveData::new(data),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl Marshal for Tpm2bSensitiveCreate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_sized(|inner| {
            self.user_auth.marshal(inner);
            self.data.marshal(inner);
        });
    }
}

impl Unmarshal for Tpm2bSensitiveCreate {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let inner = buf.get_tpm2b()?;
        let mut inner = ResponseBuffer::new(&inner);
        let user_auth = Tpm2bAuth::unmarshal(&mut inner)?;
        let data = Tpm2bSensitiveData::unmarshal(&mut inner)?;
        inner.finish()?;
        Ok(Self { user_auth, data })
    }
}

/// TPMT_SENSITIVE - The private portion of an object
#[derive(Debug, Clone)]
pub struct TpmtSensitive {
    pub sensitive_type: TpmAlgId,
    pub auth_value: Vec<u8>,
    pub seed_value: Vec<u8>,
    /// TPM2B_SENSITIVE_DATA for keyed hash objects, TPM2B_ECC_PARAMETER for ECC
    pub sensitive: Vec<u8>,
}

impl Marshal for TpmtSensitive {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.sensitive_type.to_u16());
        buf.put_tpm2b(&self.auth_value);
        buf.put_tpm2b(&self.seed_value);
        buf.put_tpm2b(&self.sensitive);
    }
}

impl Unmarshal for TpmtSensitive {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let sensitive_type = alg_from_u16(buf.get_u16()?)?;
        let auth_value = buf.get_tpm2b()?;
        let seed_value = buf.get_tpm2b()?;
        let sensitive = buf.get_tpm2b()?;
        Ok(Self {
            sensitive_type,
            auth_value,
            seed_value,
            sensitive,
        })
    }
}

/// TPMT_TK_CREATION - Creation ticket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtTkCreation {
    pub tag: u16,
    pub hierarchy: u32,
    pub digest: Tpm2bDigest,
}

/// TPMT_TK_AUTH has the same layout as the creation ticket
pub type TpmtTkAuth = TpmtTkCreation;

impl TpmtTkCreation {
    /// The NULL ticket returned when no ticket is produced
    pub fn null(tag: TpmSt) -> Self {
        Self {
            tag: tag.to_u16(),
            hierarchy: tpm_rh::NULL,
            digest: Tpm2bDigest::empty(),
        }
    }
}

impl Marshal for TpmtTkCreation {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.tag);
        buf.put_u32(self.hierarchy);
        self.digest.marshal(buf);
    }
}

impl Unmarshal for TpmtTkCreation {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let tag = buf.get_u16()?;
        let hierarchy = buf.get_u32()?;
        let digest = Tpm2bDigest::unmarshal(buf)?;
        Ok(Self {
            tag,
            hierarchy,
            digest,
        })
    }
}

/// TPMS_CREATION_DATA - Creation context recorded by Create/CreatePrimary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsCreationData {
    pub pcr_select: TpmlPcrSelection,
    pub pcr_digest: Vec<u8>,
    pub locality: u8,
    pub parent_name_alg: u16,
    pub parent_name: Vec<u8>,
    pub parent_qualified_name: Vec<u8>,
    pub outside_info: Vec<u8>,
}

impl Marshal for TpmsCreationData {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.pcr_select.marshal(buf);
        buf.put_tpm2b(&self.pcr_digest);
        buf.put_u8(self.locality);
        buf.put_u16(self.parent_name_alg);
        buf.put_tpm2b(&self.parent_name);
        buf.put_tpm2b(&self.parent_qualified_name);
        buf.put_tpm2b(&self.outside_info);
    }
}

impl Unmarshal for TpmsCreationData {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            pcr_select: TpmlPcrSelection::unmarshal(buf)?,
            pcr_digest: buf.get_tpm2b()?,
            locality: buf.get_u8()?,
            parent_name_alg: buf.get_u16()?,
            parent_name: buf.get_tpm2b()?,
            parent_qualified_name: buf.get_tpm2b()?,
            outside_info: buf.get_tpm2b()?,
        })
    }
}

/// TPMT_HA - Hash value with algorithm
#[derive(Debug, Clone)]
pub struct TpmtHa {
    pub hash_alg: TpmAlgId,
    pub digest: Vec<u8>,
}

impl TpmtHa {
    pub fn sha256(digest: Vec<u8>) -> Self {
        Self {
            hash_alg: TpmAlgId::Sha256,
            digest,
        }
    }
}

impl Marshal for TpmtHa {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash_alg.to_u16());
        buf.put_bytes(&self.digest);
    }
}

impl Unmarshal for TpmtHa {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash_alg = hash_alg_from_u16(buf.get_u16()?)?;
        let digest = buf.get_bytes(hash_alg.digest_size())?;
        Ok(Self { hash_alg, digest })
    }
}

/// TPML_DIGEST_VALUES - List of digest values for PCR extend
#[derive(Debug, Clone)]
pub struct TpmlDigestValues {
    pub digests: Vec<TpmtHa>,
}

impl TpmlDigestValues {
    pub fn single(digest: TpmtHa) -> Self {
        Self {
            digests: vec![digest],
        }
    }
}

impl Marshal for TpmlDigestValues {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.digests.len() as u32);
        for d in &self.digests {
            d.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlDigestValues {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        if count > 8 {
            bail!("too many digest values: {}", count);
        }
        let mut digests = Vec::with_capacity(count);
        for _ in 0..count {
            digests.push(TpmtHa::unmarshal(buf)?);
        }
        Ok(Self { digests })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcr_selection_indices() {
        let sel = TpmsPcrSelection::sha256(&[0, 1, 2, 7, 23]);
        // PCR 0, 1, 2, 7 = bits 0, 1, 2, 7 = 0b10000111 = 0x87
        assert_eq!(sel.pcr_select, vec![0x87, 0x00, 0x80]);
        assert_eq!(sel.indices(), vec![0, 1, 2, 7, 23]);
    }

    #[test]
    fn test_public_area_round_trip_and_name() {
        let ek = TpmtPublic::ecc_endorsement_key();
        let bytes = ek.to_bytes();
        let decoded = TpmtPublic::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, ek);
        // 0x000300B2 is the TCG attribute set for the EK templates
        assert_eq!(ek.object_attributes.0, 0x000300B2);

        let name = ek.name().unwrap();
        assert_eq!(&name[..2], &[0x00, 0x0B]);
        assert_eq!(name.len(), 34);
    }

    #[test]
    fn test_srk_attributes() {
        assert_eq!(TpmtPublic::ecc_storage_key().object_attributes.0, 0x00030472);
    }

    #[test]
    fn test_sealed_templates_fail_closed() {
        let policy = TpmtPublic::sealed_object(Tpm2bDigest::new(vec![1; 32]));
        assert!(!policy
            .object_attributes
            .contains(TpmaObject::USER_WITH_AUTH));

        let auth = TpmtPublic::sealed_object_with_auth();
        assert!(auth.object_attributes.contains(TpmaObject::USER_WITH_AUTH));
        assert!(auth.object_attributes.contains(TpmaObject::NO_DA));
    }

    #[test]
    fn test_creation_data_decodes() {
        let data = TpmsCreationData {
            pcr_select: TpmlPcrSelection::default(),
            pcr_digest: vec![],
            locality: 1,
            parent_name_alg: TpmAlgId::Sha256.to_u16(),
            parent_name: vec![0xAB; 34],
            parent_qualified_name: vec![0xCD; 34],
            outside_info: vec![],
        };
        assert_eq!(TpmsCreationData::from_bytes(&data.to_bytes()).unwrap(), data);
    }
}
