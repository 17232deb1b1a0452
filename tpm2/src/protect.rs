// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Outer wrapping of sensitive areas (TPM 2.0 Part 1, 23.3)
//!
//! The same construction protects objects created under a storage parent and
//! objects duplicated to a foreign parent: a seed shared with the parent
//! yields an AES key (`STORAGE`) and an HMAC key (`INTEGRITY`).

use anyhow::{bail, Context, Result};
use p256::SecretKey;
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::constants::TpmAlgId;
use crate::crypto::{self, AES_BLOCK_SIZE};
use crate::error::TpmError;
use crate::marshal::*;
use crate::types::{TpmsEccPoint, TpmtPublic, TpmtSensitive, TpmtSymDef};

/// Label for duplication seeds
pub const DUPLICATE_LABEL: &str = "DUPLICATE";
/// Label for session salts
pub const SECRET_LABEL: &str = "SECRET";

fn parent_point(parent: &TpmtPublic) -> Result<&TpmsEccPoint> {
    parent
        .ecc_point()
        .context("parent is not an ECC key")
}

/// Establish a seed with an ECC decryption key. Returns the seed and the
/// encrypted secret (a marshalled ephemeral point) to hand to the TPM.
pub fn create_seed(
    parent: &TpmtPublic,
    label: &str,
    rng: &mut (impl RngCore + CryptoRng),
) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>)> {
    let point = parent_point(parent)?;
    let (z, ephemeral) = crypto::ecdh_ephemeral(point, rng)?;
    let z = Zeroizing::new(z);
    let seed = crypto::kdfe(
        parent.name_alg,
        &z,
        label,
        &ephemeral.x,
        &point.x,
        parent.name_alg.digest_size() * 8,
    )?;
    Ok((Zeroizing::new(seed), ephemeral.to_bytes()))
}

/// Recover a seed from its encrypted form with the parent's private key
pub fn recover_seed(
    parent_key: &SecretKey,
    parent: &TpmtPublic,
    label: &str,
    encrypted: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let point = parent_point(parent)?;
    let ephemeral = TpmsEccPoint::from_bytes(encrypted)
        .map_err(|e| TpmError::integrity(format!("malformed encrypted seed: {e}")))?;
    let z = Zeroizing::new(crypto::ecdh(parent_key, &ephemeral)?);
    let seed = crypto::kdfe(
        parent.name_alg,
        &z,
        label,
        &ephemeral.x,
        &point.x,
        parent.name_alg.digest_size() * 8,
    )?;
    Ok(Zeroizing::new(seed))
}

/// `unique` of a sealed data object: `H_nameAlg(seedValue || data)`
pub fn sealed_unique(name_alg: TpmAlgId, seed_value: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    crypto::hash(name_alg, &[seed_value, data])
}

struct OuterKeys {
    sym_key: Zeroizing<Vec<u8>>,
    hmac_key: Zeroizing<Vec<u8>>,
}

fn outer_keys(name_alg: TpmAlgId, sym: &TpmtSymDef, seed: &[u8], name: &[u8]) -> Result<OuterKeys> {
    let sym_key = crypto::kdfa(name_alg, seed, "STORAGE", name, &[], sym.key_bits as usize)?;
    let hmac_key = crypto::kdfa(
        name_alg,
        seed,
        "INTEGRITY",
        &[],
        &[],
        name_alg.digest_size() * 8,
    )?;
    Ok(OuterKeys {
        sym_key: Zeroizing::new(sym_key),
        hmac_key: Zeroizing::new(hmac_key),
    })
}

/// Wrap a sensitive area: `TPM2B(HMAC(encSensitive || name)) || encSensitive`
pub fn protect(
    name_alg: TpmAlgId,
    sym: &TpmtSymDef,
    seed: &[u8],
    name: &[u8],
    sensitive: &TpmtSensitive,
) -> Result<Vec<u8>> {
    let keys = outer_keys(name_alg, sym, seed, name)?;

    let mut plain = CommandBuffer::new();
    plain.put_tpm2b(&sensitive.to_bytes());
    let mut enc = plain.into_vec();
    crypto::cfb_encrypt(sym, &keys.sym_key, &[0u8; AES_BLOCK_SIZE], &mut enc)?;

    let integrity = crypto::hmac(name_alg, &keys.hmac_key, &[&enc, name])?;

    let mut out = CommandBuffer::new();
    out.put_tpm2b(&integrity);
    out.put_bytes(&enc);
    Ok(out.into_vec())
}

/// Check and unwrap a protected sensitive area. Every failure here is an
/// integrity failure.
pub fn unprotect(
    name_alg: TpmAlgId,
    sym: &TpmtSymDef,
    seed: &[u8],
    name: &[u8],
    wrapped: &[u8],
) -> Result<TpmtSensitive> {
    let keys = outer_keys(name_alg, sym, seed, name)?;

    let mut buf = ResponseBuffer::new(wrapped);
    let integrity = buf
        .get_tpm2b()
        .map_err(|_| TpmError::integrity("wrapped sensitive area too short"))?;
    let mut enc = buf.get_remaining();

    let expected = crypto::hmac(name_alg, &keys.hmac_key, &[&enc, name])?;
    if !crypto::ct_eq(&expected, &integrity) {
        bail!(TpmError::integrity("outer integrity check failed"));
    }

    crypto::cfb_decrypt(sym, &keys.sym_key, &[0u8; AES_BLOCK_SIZE], &mut enc)?;
    let enc = Zeroizing::new(enc);
    let mut plain = ResponseBuffer::new(&enc);
    let inner = Zeroizing::new(
        plain
            .get_tpm2b()
            .map_err(|_| TpmError::integrity("wrapped sensitive area has a bad size"))?,
    );
    plain.finish()?;
    TpmtSensitive::from_bytes(&inner)
        .map_err(|e| TpmError::integrity(format!("malformed sensitive area: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sensitive() -> TpmtSensitive {
        TpmtSensitive {
            sensitive_type: TpmAlgId::KeyedHash,
            auth_value: vec![],
            seed_value: vec![7; 32],
            sensitive: b"secrets".to_vec(),
        }
    }

    #[test]
    fn test_protect_unprotect() {
        let sym = TpmtSymDef::aes_128_cfb();
        let seed = [3u8; 32];
        let wrapped = protect(TpmAlgId::Sha256, &sym, &seed, b"name", &sensitive()).unwrap();
        let out = unprotect(TpmAlgId::Sha256, &sym, &seed, b"name", &wrapped).unwrap();
        assert_eq!(out.sensitive, b"secrets");
        assert_eq!(out.seed_value, vec![7; 32]);
    }

    #[test]
    fn test_unprotect_rejects_other_name_or_seed() {
        let sym = TpmtSymDef::aes_128_cfb();
        let seed = [3u8; 32];
        let wrapped = protect(TpmAlgId::Sha256, &sym, &seed, b"name", &sensitive()).unwrap();
        let err = unprotect(TpmAlgId::Sha256, &sym, &seed, b"other", &wrapped).unwrap_err();
        assert_eq!(
            crate::error::ErrorCategory::of(&err),
            crate::error::ErrorCategory::Integrity
        );
        assert!(unprotect(TpmAlgId::Sha256, &sym, &[4u8; 32], b"name", &wrapped).is_err());

        let mut tampered = wrapped.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert!(unprotect(TpmAlgId::Sha256, &sym, &seed, b"name", &tampered).is_err());
    }

    #[test]
    fn test_seed_agreement() {
        let mut rng = StdRng::seed_from_u64(11);
        let key = SecretKey::random(&mut rng);
        let mut parent = TpmtPublic::ecc_endorsement_key();
        parent.unique =
            crate::types::TpmtPublicUnique::Ecc(crypto::ecc_point(&key.public_key()).unwrap());

        let (seed, encrypted) = create_seed(&parent, DUPLICATE_LABEL, &mut rng).unwrap();
        let recovered = recover_seed(&key, &parent, DUPLICATE_LABEL, &encrypted).unwrap();
        assert_eq!(*seed, *recovered);

        let other = recover_seed(&key, &parent, SECRET_LABEL, &encrypted).unwrap();
        assert_ne!(*seed, *other);
    }
}
