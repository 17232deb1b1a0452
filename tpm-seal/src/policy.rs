// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Policy digest engine
//!
//! A trial session computes the digest an object must carry; a real policy
//! session replays the same assertions against live state at use time.

use anyhow::{Context, Result};
use tpm2::policy::PcrValues;
use tpm2::{tpm_rh, Auth, AuthSession, HandleScope, NamedHandle, TpmAlgId, MIN_NONCE_SIZE};
use tracing::debug;

/// Policy digest of a single PolicyPCR assertion, computed by the TPM
pub fn trial_pcr_policy(
    scope: &mut HandleScope<'_>,
    policy_alg: TpmAlgId,
    pcrs: &PcrValues,
) -> Result<Vec<u8>> {
    let mut trial = scope.start_trial(policy_alg)?;
    let digest = (|| -> Result<Vec<u8>> {
        trial.policy_pcr(scope.tpm(), Some(&pcrs.digest()?), &pcrs.selection())?;
        trial.get_digest(scope.tpm())
    })();
    let digest = scope
        .finish_session(trial, digest)
        .context("failed to compute PCR policy")?;
    debug!("PCR policy over {:?}: {}", pcrs.indices(), hex::encode(&digest));
    Ok(digest)
}

/// A policy session that has asserted `pcrs`
///
/// The TPM compares the expected digest with the live registers, so a drifted
/// PCR fails here as an authorization failure.
pub fn satisfy_pcr_policy(
    scope: &mut HandleScope<'_>,
    policy_alg: TpmAlgId,
    pcrs: &PcrValues,
) -> Result<AuthSession> {
    let mut session = scope.start_policy(policy_alg, MIN_NONCE_SIZE)?;
    let digest = pcrs.digest()?;
    if let Err(err) = session.policy_pcr(scope.tpm(), Some(&digest), &pcrs.selection()) {
        let err = err.context("PCR state does not satisfy the policy");
        return scope.finish_session(session, Err(err));
    }
    Ok(session)
}

/// A policy session that has asserted knowledge of the endorsement
/// hierarchy's (empty) auth, as the TCG endorsement key policy requires
pub fn satisfy_endorsement_policy(scope: &mut HandleScope<'_>) -> Result<AuthSession> {
    let mut session = scope.start_policy(TpmAlgId::Sha256, MIN_NONCE_SIZE)?;
    let endorsement = NamedHandle::permanent(tpm_rh::ENDORSEMENT);
    if let Err(err) = session.policy_secret(scope.tpm(), &endorsement, Auth::null()) {
        let err = err.context("failed to satisfy the endorsement key policy");
        return scope.finish_session(session, Err(err));
    }
    Ok(session)
}

/// Expected values of `indices` in the `hash` bank, read from the TPM
pub fn current_pcrs(
    scope: &mut HandleScope<'_>,
    hash: TpmAlgId,
    indices: &[u32],
) -> Result<PcrValues> {
    let mut values = PcrValues::new(hash);
    for (index, value) in scope.tpm().pcr_read_bank(hash, indices)? {
        values.insert(index, value)?;
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm2::{SimulatorConfig, TpmContext, TpmHt};

    #[test]
    fn test_trial_matches_software_digest() {
        let mut ctx = TpmContext::simulator(SimulatorConfig::default());
        let mut scope = HandleScope::new(&mut ctx);
        let pcrs = current_pcrs(&mut scope, TpmAlgId::Sha256, &[23]).unwrap();
        let digest = trial_pcr_policy(&mut scope, TpmAlgId::Sha256, &pcrs).unwrap();
        assert_eq!(digest, pcrs.policy_digest(TpmAlgId::Sha256).unwrap());
        assert!(scope.live().is_empty());
        scope.close().unwrap();
    }

    #[test]
    fn test_failed_assertion_releases_session() {
        let mut ctx = TpmContext::simulator(SimulatorConfig::default());
        {
            let mut scope = HandleScope::new(&mut ctx);
            let mut pcrs = PcrValues::new(TpmAlgId::Sha256);
            pcrs.insert(23, vec![0xAA; 32]).unwrap();
            let err = satisfy_pcr_policy(&mut scope, TpmAlgId::Sha256, &pcrs).unwrap_err();
            assert_eq!(
                tpm2::ErrorCategory::of(&err),
                tpm2::ErrorCategory::Authorization
            );
            assert!(scope.live().is_empty());
        }
        assert!(ctx.get_handles(TpmHt::LOADED_SESSION).unwrap().is_empty());
    }
}
