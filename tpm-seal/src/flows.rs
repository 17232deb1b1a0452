// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! End-to-end sequences behind the CLI subcommands
//!
//! Each flow owns a [`HandleScope`] for its whole run, so every handle it
//! allocates is flushed on success and on the first failure alike.

use anyhow::{Context, Result};
use rand::RngCore;
use tpm2::{tpm_rh, Auth, HandleScope, NamedHandle, ParameterEncryption, TpmAlgId, TpmContext};
use tracing::info;
use zeroize::Zeroizing;

use crate::import::{self, ImportBlob};
use crate::negotiator::{HmacMode, SaltKeys, SessionPlan};
use crate::seal::{self, SealPolicy};
use crate::{keys, policy};

/// Payload of the PCR sealing flow
pub const SEAL_UNSEAL_PAYLOAD: &[u8] = b"secrets";

/// Auth values generated for the encrypted-session flow
const AUTH_VALUE_SIZE: usize = 16;

/// Seal `data` to the live value of `pcr` (SHA-256 bank), load it back and
/// unseal it with a real policy session.
pub fn seal_unseal(ctx: &mut TpmContext, pcr: u32, data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut scope = HandleScope::new(ctx);
    let srk = seal::create_srk(&mut scope, Auth::null(), &[])?;
    let pcrs = policy::current_pcrs(&mut scope, TpmAlgId::Sha256, &[pcr])?;
    let policy = SealPolicy::Pcr(pcrs);

    let blob = seal::seal(&mut scope, &srk.handle, Auth::null(), &policy, data)?;
    let item = seal::load_sealed(&mut scope, &srk.handle, Auth::null(), &blob)?;
    let unsealed = seal::unseal(&mut scope, &item, &policy)?;
    scope.close()?;
    Ok(unsealed)
}

/// Seal `data` behind an auth value and unseal it over a session negotiated
/// as `plan` says.
///
/// The storage key and the sealed object are created over EK-salted sessions
/// that encrypt their command parameters, so neither auth value crosses the
/// channel in the clear. One session is live at a time.
pub fn encrypted_session(
    ctx: &mut TpmContext,
    data: &[u8],
    plan: SessionPlan,
) -> Result<Zeroizing<Vec<u8>>> {
    let mut scope = HandleScope::new(ctx);
    let ek = seal::create_ek(&mut scope)?;
    let ek_key = (&ek.handle, &ek.public);
    let salted = SessionPlan::new(HmacMode::SaltedByEk, ParameterEncryption::In);

    let mut rng = rand::thread_rng();
    let mut srk_auth = Zeroizing::new(vec![0u8; AUTH_VALUE_SIZE]);
    rng.fill_bytes(&mut srk_auth);
    let mut object_auth = Zeroizing::new(vec![0u8; AUTH_VALUE_SIZE]);
    rng.fill_bytes(&mut object_auth);

    let owner = NamedHandle::permanent(tpm_rh::OWNER);
    let ek_only = SaltKeys {
        ek: Some(ek_key),
        primary: None,
    };
    let mut session = salted.start(&mut scope, &owner, &[], ek_only)?;
    let srk = seal::create_srk(&mut scope, Auth::Session(&mut session), &srk_auth);
    let srk = scope.finish_session(session, srk)?;

    let policy = SealPolicy::AuthValue(object_auth.clone());
    let mut session = salted.start(&mut scope, &srk.handle, &srk_auth, ek_only)?;
    let blob = seal::seal(
        &mut scope,
        &srk.handle,
        Auth::Session(&mut session),
        &policy,
        data,
    );
    let blob = scope.finish_session(session, blob)?;

    let mut session = salted.start(&mut scope, &srk.handle, &srk_auth, ek_only)?;
    let item = seal::load_sealed(&mut scope, &srk.handle, Auth::Session(&mut session), &blob);
    let item = scope.finish_session(session, item)?;

    let keys = SaltKeys {
        ek: Some(ek_key),
        primary: Some((&srk.handle, &srk.public)),
    };
    let mut session = plan.start(&mut scope, &item, &object_auth, keys)?;
    let unsealed = seal::unseal_with_session(&mut scope, &item, &mut session);
    let unsealed = scope.finish_session(session, unsealed)?;

    scope.close()?;
    info!("unsealed over a {} session ({:?})", plan.mode, plan.encryption);
    Ok(unsealed)
}

/// PEM of this TPM's endorsement key
pub fn ek_public_pem(ctx: &mut TpmContext) -> Result<String> {
    let mut scope = HandleScope::new(ctx);
    let ek = seal::create_ek(&mut scope)?;
    scope.close()?;
    keys::public_key_pem(&ek.public)
}

/// Read an import blob and unwrap it on this TPM
pub fn import_unseal(ctx: &mut TpmContext, blob: &ImportBlob) -> Result<Zeroizing<Vec<u8>>> {
    let mut scope = HandleScope::new(ctx);
    let secret = import::unwrap(&mut scope, blob).context("failed to unwrap import blob")?;
    scope.close()?;
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm2::{SimulatorConfig, TpmHt};

    #[test]
    fn test_seal_unseal_leaves_no_handles() {
        let mut ctx = TpmContext::simulator(SimulatorConfig::default());
        let data = seal_unseal(&mut ctx, 23, SEAL_UNSEAL_PAYLOAD).unwrap();
        assert_eq!(&*data, b"secrets");
        assert!(ctx.get_handles(TpmHt::Transient).unwrap().is_empty());
        assert!(ctx.get_handles(TpmHt::LOADED_SESSION).unwrap().is_empty());
    }

    #[test]
    fn test_encrypted_session_salted_by_ek() {
        let mut ctx = TpmContext::simulator(SimulatorConfig::default());
        let plan = SessionPlan::new(HmacMode::SaltedByEk, ParameterEncryption::Out);
        let data = encrypted_session(&mut ctx, b"over the wire", plan).unwrap();
        assert_eq!(&*data, b"over the wire");
    }
}
