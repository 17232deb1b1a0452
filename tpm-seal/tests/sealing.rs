// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use tpm2::{
    sweep, Auth, ErrorCategory, HandleScope, ParameterEncryption, SimulatorConfig, SweepScope,
    TpmAlgId, TpmContext, TpmHt, TpmtPublic, Tpm2bSensitiveCreate, tpm_rh,
};
use tpm_seal::negotiator::{HmacMode, SaltKeys, SessionPlan};
use tpm_seal::seal::{self, SealPolicy};
use tpm_seal::{classify, flows, policy};
use zeroize::Zeroizing;

fn simulator() -> TpmContext {
    TpmContext::simulator(SimulatorConfig::default())
}

fn live_handles(ctx: &mut TpmContext) -> usize {
    ctx.get_handles(TpmHt::Transient).unwrap().len()
        + ctx.get_handles(TpmHt::LOADED_SESSION).unwrap().len()
}

#[test]
fn seals_secrets_to_pcr23() {
    let mut ctx = simulator();
    let data = flows::seal_unseal(&mut ctx, 23, flows::SEAL_UNSEAL_PAYLOAD).unwrap();
    assert_eq!(String::from_utf8_lossy(&data), "secrets");
    assert_eq!(live_handles(&mut ctx), 0);
}

#[test]
fn pcr_drift_is_an_authorization_failure() {
    let mut ctx = simulator();
    let mut scope = HandleScope::new(&mut ctx);
    let srk = seal::create_srk(&mut scope, Auth::null(), &[]).unwrap();
    let pcrs = policy::current_pcrs(&mut scope, TpmAlgId::Sha256, &[23]).unwrap();
    let sealed_to = SealPolicy::Pcr(pcrs);
    let blob = seal::seal(&mut scope, &srk.handle, Auth::null(), &sealed_to, b"secrets").unwrap();
    let item = seal::load_sealed(&mut scope, &srk.handle, Auth::null(), &blob).unwrap();

    // Unsealing is repeatable while the PCR holds
    for _ in 0..2 {
        assert_eq!(&*seal::unseal(&mut scope, &item, &sealed_to).unwrap(), b"secrets");
    }

    scope
        .tpm()
        .pcr_extend(23, &[0x11; 32], TpmAlgId::Sha256)
        .unwrap();
    let err = seal::unseal(&mut scope, &item, &sealed_to).unwrap_err();
    assert_eq!(classify(&err), ErrorCategory::Authorization);
    assert_eq!(classify(&err).exit_code(), 4);
    scope.close().unwrap();
    assert_eq!(live_handles(&mut ctx), 0);
}

#[test]
fn salted_sessions_are_fresh() {
    let mut ctx = simulator();
    let mut scope = HandleScope::new(&mut ctx);
    let ek = seal::create_ek(&mut scope).unwrap();
    let srk = seal::create_srk(&mut scope, Auth::null(), &[]).unwrap();
    let object_auth = Zeroizing::new(b"object auth".to_vec());
    let sealed_to = SealPolicy::AuthValue(object_auth.clone());
    let blob = seal::seal(&mut scope, &srk.handle, Auth::null(), &sealed_to, b"payload").unwrap();
    let item = seal::load_sealed(&mut scope, &srk.handle, Auth::null(), &blob).unwrap();

    let plan = SessionPlan::new(HmacMode::SaltedByEk, ParameterEncryption::Out);
    let keys = SaltKeys {
        ek: Some((&ek.handle, &ek.public)),
        primary: None,
    };
    let mut first = plan.start(&mut scope, &item, &object_auth, keys).unwrap();
    let mut second = plan.start(&mut scope, &item, &object_auth, keys).unwrap();
    assert!(!first.session_key().is_empty());
    assert_ne!(first.session_key(), second.session_key());

    for session in [&mut first, &mut second] {
        let data = seal::unseal_with_session(&mut scope, &item, session).unwrap();
        assert_eq!(&*data, b"payload");
    }
    scope.close_session(first).unwrap();
    scope.close_session(second).unwrap();
    scope.close().unwrap();
}

#[test]
fn every_session_mode_unseals() {
    let encryptions = [
        ParameterEncryption::None,
        ParameterEncryption::In,
        ParameterEncryption::Out,
        ParameterEncryption::InOut,
    ];
    for mode in HmacMode::ALL {
        for encryption in encryptions {
            let mut ctx = simulator();
            let plan = SessionPlan::new(mode, encryption);
            let data = flows::encrypted_session(&mut ctx, b"over the wire", plan)
                .unwrap_or_else(|e| panic!("{mode} {encryption:?}: {e:#}"));
            assert_eq!(&*data, b"over the wire");
            assert_eq!(live_handles(&mut ctx), 0, "{mode} {encryption:?} leaked");
        }
    }
}

#[test]
fn missing_salt_key_is_rejected() {
    let mut ctx = simulator();
    let mut scope = HandleScope::new(&mut ctx);
    let srk = seal::create_srk(&mut scope, Auth::null(), &[]).unwrap();
    let plan = SessionPlan::new(HmacMode::SaltedByEk, ParameterEncryption::None);
    let err = plan
        .start(&mut scope, &srk.handle, &[], SaltKeys::default())
        .unwrap_err();
    assert_eq!(classify(&err), ErrorCategory::MalformedInput);
    scope.close().unwrap();
}

#[test]
fn sweep_is_idempotent() {
    let mut ctx = simulator();
    {
        let mut scope = HandleScope::new(&mut ctx);
        seal::create_srk(&mut scope, Auth::null(), &[]).unwrap();
        scope.start_trial(TpmAlgId::Sha256).unwrap();
        // Simulate a crashed run that never released its handles
        std::mem::forget(scope);
    }
    assert_eq!(live_handles(&mut ctx), 2);

    assert_eq!(sweep(&mut ctx, SweepScope::All).unwrap(), 2);
    assert_eq!(live_handles(&mut ctx), 0);
    assert_eq!(sweep(&mut ctx, SweepScope::All).unwrap(), 0);
    assert_eq!(live_handles(&mut ctx), 0);
}

#[test]
fn exhausted_pool_recovers_after_sweep() {
    let mut ctx = simulator();
    for hierarchy in [tpm_rh::OWNER, tpm_rh::ENDORSEMENT, tpm_rh::PLATFORM] {
        ctx.create_primary(
            hierarchy,
            Auth::null(),
            &TpmtPublic::ecc_storage_key(),
            &Tpm2bSensitiveCreate::empty(),
        )
        .unwrap();
    }

    let err = flows::seal_unseal(&mut ctx, 23, b"secrets").unwrap_err();
    assert_eq!(classify(&err), ErrorCategory::ResourceExhausted);
    assert!(tpm_seal::report(&err).starts_with("TPM out of resources"));

    assert_eq!(sweep(&mut ctx, SweepScope::Transient).unwrap(), 3);
    let data = flows::seal_unseal(&mut ctx, 23, b"secrets").unwrap();
    assert_eq!(&*data, b"secrets");
}
