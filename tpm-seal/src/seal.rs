// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Seal/unseal executor
//!
//! `template --create--> SealedBlob --load--> NamedHandle --unseal--> data`

use anyhow::{Context, Result};
use tpm2::policy::PcrValues;
use tpm2::{
    tpm_rh, Auth, AuthSession, CreatedPrimary, HandleScope, NamedHandle, Tpm2bDigest,
    Tpm2bSensitiveCreate, TpmAlgId, TpmsCreationData, TpmtPublic, TpmtTkCreation,
};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::policy;

/// What a sealed object demands before it releases its data
#[derive(Clone)]
pub enum SealPolicy {
    /// The listed PCRs must hold the given values
    Pcr(PcrValues),
    /// The caller must prove knowledge of this auth value
    AuthValue(Zeroizing<Vec<u8>>),
}

impl std::fmt::Debug for SealPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SealPolicy::Pcr(values) => f.debug_tuple("Pcr").field(&values.indices()).finish(),
            SealPolicy::AuthValue(_) => f.write_str("AuthValue(..)"),
        }
    }
}

/// Output of sealing: the blob pair plus the creation evidence
#[derive(Debug, Clone)]
pub struct SealedBlob {
    pub private: Vec<u8>,
    pub public: Vec<u8>,
    pub creation_data: TpmsCreationData,
    pub creation_hash: Vec<u8>,
    pub creation_ticket: TpmtTkCreation,
}

/// ECC storage root key under the owner hierarchy, optionally with an auth value
pub fn create_srk(
    scope: &mut HandleScope<'_>,
    owner_auth: Auth<'_>,
    srk_auth: &[u8],
) -> Result<CreatedPrimary> {
    let sensitive = Tpm2bSensitiveCreate::with_auth(srk_auth.to_vec(), Vec::new());
    let srk = scope
        .create_primary(
            tpm_rh::OWNER,
            owner_auth,
            &TpmtPublic::ecc_storage_key(),
            &sensitive,
        )
        .context("failed to create storage root key")?;
    debug!("SRK 0x{:08x} name {}", srk.handle.handle, hex::encode(&srk.handle.name));
    Ok(srk)
}

/// TCG default ECC endorsement key
pub fn create_ek(scope: &mut HandleScope<'_>) -> Result<CreatedPrimary> {
    let ek = scope
        .create_primary(
            tpm_rh::ENDORSEMENT,
            Auth::null(),
            &TpmtPublic::ecc_endorsement_key(),
            &Tpm2bSensitiveCreate::empty(),
        )
        .context("failed to create endorsement key")?;
    debug!("EK 0x{:08x} name {}", ek.handle.handle, hex::encode(&ek.handle.name));
    Ok(ek)
}

/// Create a sealed data object holding `data` under `parent`
pub fn seal(
    scope: &mut HandleScope<'_>,
    parent: &NamedHandle,
    parent_auth: Auth<'_>,
    policy: &SealPolicy,
    data: &[u8],
) -> Result<SealedBlob> {
    let (template, sensitive) = match policy {
        SealPolicy::Pcr(pcrs) => {
            let digest = policy::trial_pcr_policy(scope, TpmAlgId::Sha256, pcrs)?;
            (
                TpmtPublic::sealed_object(Tpm2bDigest::new(digest)),
                Tpm2bSensitiveCreate::with_data(data.to_vec()),
            )
        }
        SealPolicy::AuthValue(auth) => (
            TpmtPublic::sealed_object_with_auth(),
            Tpm2bSensitiveCreate::with_auth(auth.to_vec(), data.to_vec()),
        ),
    };
    let created = scope
        .tpm()
        .create(parent, parent_auth, &template, &sensitive)
        .context("failed to create sealed object")?;
    info!("sealed {} bytes under {:?}", data.len(), policy);
    Ok(SealedBlob {
        private: created.private,
        public: created.public,
        creation_data: created.creation_data,
        creation_hash: created.creation_hash,
        creation_ticket: created.creation_ticket,
    })
}

/// Load a sealed blob pair back under its parent
pub fn load_sealed(
    scope: &mut HandleScope<'_>,
    parent: &NamedHandle,
    parent_auth: Auth<'_>,
    blob: &SealedBlob,
) -> Result<NamedHandle> {
    scope
        .load(parent, parent_auth, &blob.private, &blob.public)
        .context("failed to load sealed object")
}

/// Unseal a PCR-gated object with a fresh policy session
pub fn unseal_with_pcrs(
    scope: &mut HandleScope<'_>,
    item: &NamedHandle,
    pcrs: &PcrValues,
) -> Result<Zeroizing<Vec<u8>>> {
    let mut session = policy::satisfy_pcr_policy(scope, TpmAlgId::Sha256, pcrs)?;
    let data = scope.tpm().unseal(item, Auth::Session(&mut session));
    scope.finish_session(session, data.context("failed to unseal"))
}

/// Unseal with an already negotiated HMAC session
pub fn unseal_with_session(
    scope: &mut HandleScope<'_>,
    item: &NamedHandle,
    session: &mut AuthSession,
) -> Result<Zeroizing<Vec<u8>>> {
    scope
        .tpm()
        .unseal(item, Auth::Session(session))
        .context("failed to unseal")
}

/// Unseal according to `policy`; an auth value is presented as a password
pub fn unseal(
    scope: &mut HandleScope<'_>,
    item: &NamedHandle,
    policy: &SealPolicy,
) -> Result<Zeroizing<Vec<u8>>> {
    match policy {
        SealPolicy::Pcr(pcrs) => unseal_with_pcrs(scope, item, pcrs),
        SealPolicy::AuthValue(auth) => scope
            .tpm()
            .unseal(item, Auth::Password(auth.as_slice()))
            .context("failed to unseal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm2::{ErrorCategory, SimulatorConfig, TpmContext};

    #[test]
    fn test_auth_value_seal_round_trip() {
        let mut ctx = TpmContext::simulator(SimulatorConfig::default());
        let mut scope = HandleScope::new(&mut ctx);
        let srk = create_srk(&mut scope, Auth::null(), &[]).unwrap();
        let policy = SealPolicy::AuthValue(Zeroizing::new(b"hunter2".to_vec()));
        let blob = seal(&mut scope, &srk.handle, Auth::null(), &policy, b"payload").unwrap();
        let item = load_sealed(&mut scope, &srk.handle, Auth::null(), &blob).unwrap();

        assert_eq!(&*unseal(&mut scope, &item, &policy).unwrap(), b"payload");

        let wrong = SealPolicy::AuthValue(Zeroizing::new(b"hunter3".to_vec()));
        let err = unseal(&mut scope, &item, &wrong).unwrap_err();
        assert_eq!(ErrorCategory::of(&err), ErrorCategory::Authorization);
        scope.close().unwrap();
    }

    #[test]
    fn test_blob_from_other_parent_is_rejected() {
        let mut ctx = TpmContext::simulator(SimulatorConfig::default());
        let mut scope = HandleScope::new(&mut ctx);
        let srk = create_srk(&mut scope, Auth::null(), &[]).unwrap();
        let policy = SealPolicy::AuthValue(Zeroizing::new(Vec::new()));
        let blob = seal(&mut scope, &srk.handle, Auth::null(), &policy, b"payload").unwrap();

        let other = scope
            .create_primary(
                tpm_rh::PLATFORM,
                Auth::null(),
                &TpmtPublic::ecc_storage_key(),
                &Tpm2bSensitiveCreate::empty(),
            )
            .unwrap();
        let err = load_sealed(&mut scope, &other.handle, Auth::null(), &blob).unwrap_err();
        assert_eq!(ErrorCategory::of(&err), ErrorCategory::Integrity);
        scope.close().unwrap();
    }
}
