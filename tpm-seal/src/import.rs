// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Cross-device import
//!
//! [`wrap`] runs off-device: it builds a sealed data object for a TPM whose
//! endorsement key it only knows publicly, and wraps it so that only that TPM
//! can import it. [`unwrap`] runs on the target TPM.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rand::{CryptoRng, RngCore};
use scale::{Decode, Encode};
use tpm2::policy::PcrValues;
use tpm2::protect::{self, DUPLICATE_LABEL};
use tpm2::{
    crypto, Auth, HandleScope, Marshal, Tpm2bDigest, TpmAlgId, TpmError, TpmtPublic,
    TpmtSensitive, Unmarshal, MAX_SYM_DATA,
};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{read_input, write_output};
use crate::{policy, seal};

/// Current [`ImportBlob`] layout
pub const IMPORT_BLOB_VERSION: u32 = 1;

/// PCR values the target must hold before it releases the secret
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BlobPcrs {
    pub hash: u16,
    pub values: Vec<(u32, Vec<u8>)>,
}

/// A secret wrapped for one TPM's endorsement key
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ImportBlob {
    pub version: u32,
    /// Marshalled `TPMT_PUBLIC` of the sealed object
    pub public_area: Vec<u8>,
    /// Outer-wrapped sensitive area
    pub duplicate: Vec<u8>,
    /// Ephemeral ECC point the seed was agreed with
    pub encrypted_seed: Vec<u8>,
    pub pcrs: Option<BlobPcrs>,
}

impl ImportBlob {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode()
    }

    /// Decode a blob; corruption is an integrity failure
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut input = data;
        let blob = Self::decode(&mut input)
            .map_err(|e| TpmError::integrity(format!("malformed import blob: {e}")))?;
        if !input.is_empty() {
            bail!(TpmError::integrity(format!(
                "import blob has {} trailing bytes",
                input.len()
            )));
        }
        if blob.version != IMPORT_BLOB_VERSION {
            bail!(TpmError::integrity(format!(
                "unsupported import blob version {}",
                blob.version
            )));
        }
        Ok(blob)
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        write_output(path, "import blob", self.to_bytes())
    }

    /// Read a blob file. A missing or unreadable file is malformed input; a
    /// file that does not decode is an integrity failure.
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let data = read_input(path, "import blob")?;
        Self::from_bytes(&data)
    }

    /// Expected PCR values embedded at wrap time
    pub fn pcr_values(&self) -> Result<Option<PcrValues>> {
        let Some(pcrs) = &self.pcrs else {
            return Ok(None);
        };
        let hash = TpmAlgId::from_u16(pcrs.hash)
            .filter(|alg| alg.is_hash())
            .ok_or_else(|| {
                TpmError::integrity(format!("import blob names hash 0x{:04x}", pcrs.hash))
            })?;
        let mut values = PcrValues::new(hash);
        for (index, value) in &pcrs.values {
            values
                .insert(*index, value.clone())
                .map_err(|e| TpmError::integrity(format!("import blob PCR list: {e:#}")))?;
        }
        Ok(Some(values))
    }
}

/// Wrap `secret` for the TPM owning `ek_public`, optionally gated on `pcrs`
pub fn wrap(
    ek_public: &TpmtPublic,
    secret: &[u8],
    pcrs: Option<&PcrValues>,
    rng: &mut (impl RngCore + CryptoRng),
) -> Result<ImportBlob> {
    let sym = ek_public
        .symmetric()
        .filter(|sym| !sym.is_null())
        .context("target key is not a storage key")?;
    if secret.len() > MAX_SYM_DATA {
        bail!(TpmError::malformed(format!(
            "secret is {} bytes, a sealed object holds at most {MAX_SYM_DATA}",
            secret.len()
        )));
    }
    let name_alg = TpmAlgId::Sha256;

    let policy = match pcrs.filter(|p| !p.is_empty()) {
        Some(pcrs) => pcrs.policy_digest(name_alg)?,
        None => Vec::new(),
    };
    let mut seed_value = Zeroizing::new(vec![0u8; name_alg.digest_size()]);
    rng.fill_bytes(&mut seed_value);
    let unique = protect::sealed_unique(name_alg, &seed_value, secret)?;
    let public = TpmtPublic::importable_sealed_object(Tpm2bDigest::new(policy), unique);
    let name = public.name()?;

    let sensitive = TpmtSensitive {
        sensitive_type: TpmAlgId::KeyedHash,
        auth_value: Vec::new(),
        seed_value: seed_value.to_vec(),
        sensitive: secret.to_vec(),
    };
    let (seed, encrypted_seed) = protect::create_seed(ek_public, DUPLICATE_LABEL, rng)?;
    let duplicate = protect::protect(ek_public.name_alg, sym, &seed, &name, &sensitive)?;

    debug!("wrapped object name {}", hex::encode(&name));
    Ok(ImportBlob {
        version: IMPORT_BLOB_VERSION,
        public_area: public.to_bytes(),
        duplicate,
        encrypted_seed,
        pcrs: pcrs.filter(|p| !p.is_empty()).map(|p| BlobPcrs {
            hash: p.hash.to_u16(),
            values: p.values.clone().into_iter().collect(),
        }),
    })
}

/// Import `blob` under this TPM's endorsement key and unseal it
pub fn unwrap(scope: &mut HandleScope<'_>, blob: &ImportBlob) -> Result<Zeroizing<Vec<u8>>> {
    let public = TpmtPublic::from_bytes(&blob.public_area)
        .map_err(|e| TpmError::integrity(format!("import blob public area: {e:#}")))?;
    let pcrs = blob.pcr_values()?.filter(|p| !p.is_empty());

    // The embedded PCR list must hash to the object's policy
    let expected = match &pcrs {
        Some(pcrs) => pcrs
            .policy_digest(public.name_alg)
            .map_err(|e| TpmError::integrity(format!("import blob PCR list: {e:#}")))?,
        None => Vec::new(),
    };
    if !crypto::ct_eq(&expected, &public.auth_policy.buffer) {
        bail!(TpmError::integrity(
            "import blob PCR values do not match the object's policy"
        ));
    }

    let ek = seal::create_ek(scope)?;

    let mut session = policy::satisfy_endorsement_policy(scope)?;
    let private = scope.tpm().import(
        &ek.handle,
        Auth::Session(&mut session),
        &blob.public_area,
        &blob.duplicate,
        &blob.encrypted_seed,
    );
    let private = scope.finish_session(
        session,
        private.context("failed to import blob under the endorsement key"),
    )?;

    let mut session = policy::satisfy_endorsement_policy(scope)?;
    let item = scope.load(
        &ek.handle,
        Auth::Session(&mut session),
        &private,
        &blob.public_area,
    );
    let item = scope.finish_session(session, item.context("failed to load imported object"))?;

    let secret = match &pcrs {
        Some(pcrs) => seal::unseal_with_pcrs(scope, &item, pcrs)?,
        None => scope
            .tpm()
            .unseal(&item, Auth::null())
            .context("failed to unseal imported object")?,
    };
    scope.release(item.handle)?;
    scope.release(ek.handle.handle)?;
    info!("unwrapped {} byte secret", secret.len());
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn target() -> TpmtPublic {
        let key = p256::SecretKey::random(&mut StdRng::seed_from_u64(5));
        let mut public = TpmtPublic::ecc_endorsement_key();
        public.unique =
            tpm2::TpmtPublicUnique::Ecc(tpm2::crypto::ecc_point(&key.public_key()).unwrap());
        public
    }

    #[test]
    fn test_blob_bytes_round_trip() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut pcrs = PcrValues::new(TpmAlgId::Sha256);
        pcrs.insert(23, vec![0; 32]).unwrap();
        let blob = wrap(&target(), b"meet me at...", Some(&pcrs), &mut rng).unwrap();

        let decoded = ImportBlob::from_bytes(&blob.to_bytes()).unwrap();
        assert_eq!(decoded, blob);
        assert_eq!(decoded.pcr_values().unwrap(), Some(pcrs));

        let public = TpmtPublic::from_bytes(&blob.public_area).unwrap();
        assert!(!public.auth_policy.buffer.is_empty());
    }

    #[test]
    fn test_blob_file_round_trip() {
        let mut rng = StdRng::seed_from_u64(2);
        let blob = wrap(&target(), b"secret", None, &mut rng).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sealed.dat");
        blob.write_to(&path).unwrap();
        assert_eq!(fs_err::read(&path).unwrap(), blob.to_bytes());
        assert_eq!(ImportBlob::read_from(&path).unwrap(), blob);
    }

    #[test]
    fn test_secret_larger_than_a_sealed_object_is_rejected() {
        let mut rng = StdRng::seed_from_u64(4);
        assert!(wrap(&target(), &[1; MAX_SYM_DATA], None, &mut rng).is_ok());
        let err = wrap(&target(), &[1; 200], None, &mut rng).unwrap_err();
        assert_eq!(
            tpm2::ErrorCategory::of(&err),
            tpm2::ErrorCategory::MalformedInput
        );
    }

    #[test]
    fn test_missing_blob_file_is_malformed_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = ImportBlob::read_from(dir.path().join("sealed.dat")).unwrap_err();
        assert_eq!(crate::classify(&err), tpm2::ErrorCategory::MalformedInput);
        assert!(crate::report(&err).starts_with("malformed input: cannot read import blob"));
    }

    #[test]
    fn test_corrupt_blob_is_integrity_failure() {
        let mut rng = StdRng::seed_from_u64(3);
        let bytes = wrap(&target(), b"secret", None, &mut rng)
            .unwrap()
            .to_bytes();
        for data in [&bytes[..bytes.len() - 1], &[bytes.as_slice(), &[0]].concat()[..]] {
            let err = ImportBlob::from_bytes(data).unwrap_err();
            assert_eq!(
                tpm2::ErrorCategory::of(&err),
                tpm2::ErrorCategory::Integrity
            );
        }
    }
}
