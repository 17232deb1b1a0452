// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! `PUBLIC KEY` PEM interchange for TPM ECC keys

use anyhow::{anyhow, Context, Result};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use p256::PublicKey;
use tpm2::crypto;
use tpm2::{TpmError, TpmtPublic, TpmtPublicUnique};

/// SubjectPublicKeyInfo PEM of an ECC public area
pub fn public_key_pem(public: &TpmtPublic) -> Result<String> {
    let point = public.ecc_point().context("only ECC keys can be exported")?;
    let key = crypto::ecc_public_key(point)?;
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| anyhow!("failed to encode public key: {e}"))
}

/// The public area of a TCG default ECC endorsement key with the given PEM
/// public key, so its name matches the one the TPM reports.
pub fn ek_public_from_pem(pem: &str) -> Result<TpmtPublic> {
    let key = PublicKey::from_public_key_pem(pem.trim())
        .map_err(|e| TpmError::malformed(format!("invalid PUBLIC KEY PEM: {e}")))?;
    let mut public = TpmtPublic::ecc_endorsement_key();
    public.unique = TpmtPublicUnique::Ecc(crypto::ecc_point(&key)?);
    Ok(public)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm2::{ErrorCategory, HandleScope, SimulatorConfig, TpmContext};

    #[test]
    fn test_ek_pem_round_trip() {
        let mut ctx = TpmContext::simulator(SimulatorConfig::default());
        let mut scope = HandleScope::new(&mut ctx);
        let ek = crate::seal::create_ek(&mut scope).unwrap();

        let pem = public_key_pem(&ek.public).unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));

        let public = ek_public_from_pem(&pem).unwrap();
        assert_eq!(public.name().unwrap(), ek.handle.name);
        scope.close().unwrap();
    }

    #[test]
    fn test_bad_pem_is_malformed_input() {
        let err = ek_public_from_pem("-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----")
            .unwrap_err();
        assert_eq!(ErrorCategory::of(&err), ErrorCategory::MalformedInput);
    }
}
