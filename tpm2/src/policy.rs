// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Software policy digest calculation
//!
//! These reproduce what a trial session computes, so a policy can be authored
//! for a module that is not present (e.g. when wrapping a secret for import).

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::constants::{TpmAlgId, TpmCc, PCR_COUNT};
use crate::crypto;
use crate::error::TpmError;
use crate::marshal::Marshal;
use crate::types::TpmlPcrSelection;

/// The initial policy digest: all zeros of the digest size
pub fn empty_policy(alg: TpmAlgId) -> Vec<u8> {
    vec![0u8; alg.digest_size()]
}

/// Digest of the concatenated PCR values, in selection order
pub fn pcr_digest(alg: TpmAlgId, values: &[&[u8]]) -> Result<Vec<u8>> {
    crypto::hash(alg, values)
}

/// `H(policy || TPM_CC_PolicyPCR || pcrs || pcrDigest)`
pub fn pcr_policy_digest(
    alg: TpmAlgId,
    policy: &[u8],
    selection: &TpmlPcrSelection,
    pcr_digest: &[u8],
) -> Result<Vec<u8>> {
    crypto::hash(
        alg,
        &[
            policy,
            &TpmCc::PolicyPcr.to_u32().to_be_bytes(),
            &selection.to_bytes(),
            pcr_digest,
        ],
    )
}

/// `H(H(policy || TPM_CC_PolicySecret || authName) || policyRef)`
pub fn secret_policy_digest(
    alg: TpmAlgId,
    policy: &[u8],
    auth_name: &[u8],
    policy_ref: &[u8],
) -> Result<Vec<u8>> {
    let updated = crypto::hash(
        alg,
        &[
            policy,
            &TpmCc::PolicySecret.to_u32().to_be_bytes(),
            auth_name,
        ],
    )?;
    crypto::hash(alg, &[&updated, policy_ref])
}

/// Expected PCR values of one bank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrValues {
    pub hash: TpmAlgId,
    pub values: BTreeMap<u32, Vec<u8>>,
}

impl PcrValues {
    pub fn new(hash: TpmAlgId) -> Self {
        Self {
            hash,
            values: BTreeMap::new(),
        }
    }

    /// Add a register value; the index must be a real PCR and the value a
    /// digest of the bank's algorithm.
    pub fn insert(&mut self, index: u32, value: Vec<u8>) -> Result<()> {
        if index >= PCR_COUNT {
            bail!(TpmError::malformed(format!(
                "PCR index {} out of range [0, {}]",
                index,
                PCR_COUNT - 1
            )));
        }
        if value.len() != self.hash.digest_size() {
            bail!(TpmError::malformed(format!(
                "PCR {} value is {} bytes, {:?} needs {}",
                index,
                value.len(),
                self.hash,
                self.hash.digest_size()
            )));
        }
        if self.values.insert(index, value).is_some() {
            bail!(TpmError::malformed(format!("PCR {} given twice", index)));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn indices(&self) -> Vec<u32> {
        self.values.keys().copied().collect()
    }

    pub fn selection(&self) -> TpmlPcrSelection {
        TpmlPcrSelection::single(self.hash, &self.indices())
    }

    /// Digest of the values in ascending index order, which is the order the
    /// module concatenates a selection
    pub fn digest(&self) -> Result<Vec<u8>> {
        let values: Vec<&[u8]> = self.values.values().map(Vec::as_slice).collect();
        pcr_digest(self.hash, &values)
    }

    /// A fresh policy with a single PolicyPCR assertion over these values
    pub fn policy_digest(&self, policy_alg: TpmAlgId) -> Result<Vec<u8>> {
        pcr_policy_digest(
            policy_alg,
            &empty_policy(policy_alg),
            &self.selection(),
            &self.digest()?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{tpm_rh, EK_AUTH_POLICY};
    use crate::types::NamedHandle;

    #[test]
    fn test_ek_policy_reproduced() {
        let endorsement = NamedHandle::permanent(tpm_rh::ENDORSEMENT);
        let digest = secret_policy_digest(
            TpmAlgId::Sha256,
            &empty_policy(TpmAlgId::Sha256),
            &endorsement.name,
            &[],
        )
        .unwrap();
        assert_eq!(digest, EK_AUTH_POLICY);
    }

    #[test]
    fn test_pcr_values_validation() {
        let mut values = PcrValues::new(TpmAlgId::Sha256);
        assert!(values.insert(24, vec![0; 32]).is_err());
        assert!(values.insert(23, vec![0; 20]).is_err());
        values.insert(23, vec![0; 32]).unwrap();
        assert!(values.insert(23, vec![1; 32]).is_err());
        assert_eq!(values.indices(), vec![23]);
    }

    #[test]
    fn test_policy_depends_on_values() {
        let mut a = PcrValues::new(TpmAlgId::Sha256);
        a.insert(23, vec![0; 32]).unwrap();
        let mut b = PcrValues::new(TpmAlgId::Sha256);
        b.insert(23, vec![1; 32]).unwrap();
        assert_ne!(
            a.policy_digest(TpmAlgId::Sha256).unwrap(),
            b.policy_digest(TpmAlgId::Sha256).unwrap()
        );
        assert_eq!(a.policy_digest(TpmAlgId::Sha256).unwrap().len(), 32);
    }
}
