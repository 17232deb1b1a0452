// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Host-side cryptography shared by sessions, duplication and the simulator
//!
//! KDFa and KDFe follow TPM 2.0 Part 1, section 11.4.10.

use aes::Aes128;
use anyhow::{anyhow, bail, Context, Result};
use cipher::{AsyncStreamCipher, KeyIvInit};
use hmac::{digest::KeyInit, Hmac, Mac};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, PublicKey, SecretKey};
use rand::{CryptoRng, RngCore};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

use crate::constants::TpmAlgId;
use crate::error::TpmError;
use crate::types::{TpmsEccPoint, TpmtSymDef};

/// AES block size, which is also the CFB IV size
pub const AES_BLOCK_SIZE: usize = 16;

fn digest_parts<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

/// Hash the concatenation of `parts`
pub fn hash(alg: TpmAlgId, parts: &[&[u8]]) -> Result<Vec<u8>> {
    let digest = match alg {
        TpmAlgId::Sha1 => digest_parts::<Sha1>(parts),
        TpmAlgId::Sha256 => digest_parts::<Sha256>(parts),
        TpmAlgId::Sha384 => digest_parts::<Sha384>(parts),
        TpmAlgId::Sha512 => digest_parts::<Sha512>(parts),
        _ => bail!("unsupported hash algorithm: {:?}", alg),
    };
    Ok(digest)
}

fn mac_parts<M: Mac + KeyInit>(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let mut mac =
        <M as KeyInit>::new_from_slice(key).map_err(|_| anyhow!("invalid HMAC key length"))?;
    for part in parts {
        Mac::update(&mut mac, part);
    }
    Ok(Mac::finalize(mac).into_bytes().to_vec())
}

/// HMAC over the concatenation of `parts`
pub fn hmac(alg: TpmAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    match alg {
        TpmAlgId::Sha1 => mac_parts::<Hmac<Sha1>>(key, parts),
        TpmAlgId::Sha256 => mac_parts::<Hmac<Sha256>>(key, parts),
        TpmAlgId::Sha384 => mac_parts::<Hmac<Sha384>>(key, parts),
        TpmAlgId::Sha512 => mac_parts::<Hmac<Sha512>>(key, parts),
        _ => bail!("unsupported HMAC algorithm: {:?}", alg),
    }
}

/// Label encoding used by both KDFs: the ASCII label plus a NUL terminator
fn label_bytes(label: &str) -> Vec<u8> {
    let mut v = label.as_bytes().to_vec();
    v.push(0);
    v
}

/// KDFa: SP 800-108 counter mode with HMAC
pub fn kdfa(
    alg: TpmAlgId,
    key: &[u8],
    label: &str,
    context_u: &[u8],
    context_v: &[u8],
    bits: usize,
) -> Result<Vec<u8>> {
    let label = label_bytes(label);
    let bits_be = (bits as u32).to_be_bytes();
    let len = bits.div_ceil(8);
    let mut out = Vec::with_capacity(len + alg.digest_size());
    let mut counter: u32 = 1;
    while out.len() < len {
        let block = hmac(
            alg,
            key,
            &[&counter.to_be_bytes(), &label, context_u, context_v, &bits_be],
        )?;
        out.extend_from_slice(&block);
        counter += 1;
    }
    out.truncate(len);
    Ok(out)
}

/// KDFe: SP 800-56A concatenation KDF over an ECDH shared secret
pub fn kdfe(
    alg: TpmAlgId,
    z: &[u8],
    label: &str,
    party_u: &[u8],
    party_v: &[u8],
    bits: usize,
) -> Result<Vec<u8>> {
    let label = label_bytes(label);
    let len = bits.div_ceil(8);
    let mut out = Vec::with_capacity(len + alg.digest_size());
    let mut counter: u32 = 1;
    while out.len() < len {
        let block = hash(alg, &[&counter.to_be_bytes(), z, &label, party_u, party_v])?;
        out.extend_from_slice(&block);
        counter += 1;
    }
    out.truncate(len);
    Ok(out)
}

fn ensure_aes_128_cfb(sym: &TpmtSymDef) -> Result<()> {
    if sym.algorithm != TpmAlgId::Aes || sym.key_bits != 128 || sym.mode != TpmAlgId::Cfb {
        bail!("unsupported symmetric definition: {:?}", sym);
    }
    Ok(())
}

/// Encrypt `data` in place with AES-CFB
pub fn cfb_encrypt(sym: &TpmtSymDef, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    ensure_aes_128_cfb(sym)?;
    cfb_mode::Encryptor::<Aes128>::new_from_slices(key, iv)
        .map_err(|_| anyhow!("invalid AES-CFB key or IV length"))?
        .encrypt(data);
    Ok(())
}

/// Decrypt `data` in place with AES-CFB
pub fn cfb_decrypt(sym: &TpmtSymDef, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    ensure_aes_128_cfb(sym)?;
    cfb_mode::Decryptor::<Aes128>::new_from_slices(key, iv)
        .map_err(|_| anyhow!("invalid AES-CFB key or IV length"))?
        .decrypt(data);
    Ok(())
}

/// Constant-time equality for MACs and authorization values
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Convert a TPM ECC point into a P-256 public key
pub fn ecc_public_key(point: &TpmsEccPoint) -> Result<PublicKey> {
    if point.x.len() != 32 || point.y.len() != 32 {
        bail!(TpmError::integrity("ECC point coordinates must be 32 bytes"));
    }
    let encoded = EncodedPoint::from_affine_coordinates(
        point.x.as_slice().into(),
        point.y.as_slice().into(),
        false,
    );
    Option::from(PublicKey::from_encoded_point(&encoded))
        .ok_or_else(|| TpmError::integrity("ECC point is not on the P-256 curve").into())
}

/// Convert a P-256 public key into a TPM ECC point
pub fn ecc_point(key: &PublicKey) -> Result<TpmsEccPoint> {
    let encoded = key.to_encoded_point(false);
    let (Some(x), Some(y)) = (encoded.x(), encoded.y()) else {
        bail!("public key has no affine coordinates");
    };
    Ok(TpmsEccPoint {
        x: x.to_vec(),
        y: y.to_vec(),
    })
}

/// Static-static ECDH; returns the x coordinate of the shared point
pub fn ecdh(secret: &SecretKey, peer: &TpmsEccPoint) -> Result<Vec<u8>> {
    let peer = ecc_public_key(peer)?;
    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    Ok(shared.raw_secret_bytes().to_vec())
}

/// Ephemeral-static ECDH against `peer`; returns the shared x coordinate and
/// the ephemeral public point to send to the key owner.
pub fn ecdh_ephemeral(
    peer: &TpmsEccPoint,
    rng: &mut (impl RngCore + CryptoRng),
) -> Result<(Vec<u8>, TpmsEccPoint)> {
    let ephemeral = SecretKey::random(rng);
    let z = ecdh(&ephemeral, peer).context("failed to derive ECDH shared secret")?;
    let point = ecc_point(&ephemeral.public_key())?;
    Ok((z, point))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_kdfa_lengths_and_determinism() {
        let a = kdfa(TpmAlgId::Sha256, b"key", "ATH", b"u", b"v", 256).unwrap();
        let b = kdfa(TpmAlgId::Sha256, b"key", "ATH", b"u", b"v", 256).unwrap();
        assert_eq!(a.len(), 32);
        assert_eq!(a, b);

        // Two counter blocks; the bit length is mixed in, so this is not an
        // extension of the 256-bit output.
        let long = kdfa(TpmAlgId::Sha256, b"key", "ATH", b"u", b"v", 384).unwrap();
        assert_eq!(long.len(), 48);
        assert_ne!(&long[..32], a.as_slice());

        let other = kdfa(TpmAlgId::Sha256, b"key", "CFB", b"u", b"v", 256).unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn test_kdfa_first_block() {
        let expected = hmac(
            TpmAlgId::Sha256,
            b"key",
            &[&1u32.to_be_bytes(), b"STORAGE\0", b"name", &128u32.to_be_bytes()],
        )
        .unwrap();
        let derived = kdfa(TpmAlgId::Sha256, b"key", "STORAGE", b"name", b"", 128).unwrap();
        assert_eq!(derived, expected[..16]);
    }

    #[test]
    fn test_ecdh_agreement() {
        let mut rng = StdRng::seed_from_u64(7);
        let static_key = SecretKey::random(&mut rng);
        let static_point = ecc_point(&static_key.public_key()).unwrap();

        let (z_sender, ephemeral) = ecdh_ephemeral(&static_point, &mut rng).unwrap();
        let z_receiver = ecdh(&static_key, &ephemeral).unwrap();
        assert_eq!(z_sender, z_receiver);
        assert_eq!(z_sender.len(), 32);
    }

    #[test]
    fn test_off_curve_point_rejected() {
        let point = TpmsEccPoint {
            x: vec![1; 32],
            y: vec![2; 32],
        };
        assert!(ecc_public_key(&point).is_err());
    }

    #[test]
    fn test_cfb_round_trip() {
        let sym = TpmtSymDef::aes_128_cfb();
        let key = [0x11u8; 16];
        let iv = [0u8; 16];
        let mut data = b"parameter".to_vec();
        cfb_encrypt(&sym, &key, &iv, &mut data).unwrap();
        assert_ne!(data, b"parameter");
        cfb_decrypt(&sym, &key, &iv, &mut data).unwrap();
        assert_eq!(data, b"parameter");
    }
}
