// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use rand::rngs::StdRng;
use rand::SeedableRng;
use tpm2::policy::PcrValues;
use tpm2::{ErrorCategory, SimulatorConfig, TpmAlgId, TpmContext, TpmHt};
use tpm_seal::{classify, flows, import, keys, pcr_spec, ImportBlob};

fn target(seed: u64) -> TpmContext {
    TpmContext::simulator(SimulatorConfig {
        seed,
        ..Default::default()
    })
}

fn wrap_for(ctx: &mut TpmContext, secret: &[u8], pcrs: Option<&PcrValues>) -> ImportBlob {
    let pem = flows::ek_public_pem(ctx).unwrap();
    let ek_public = keys::ek_public_from_pem(&pem).unwrap();
    import::wrap(&ek_public, secret, pcrs, &mut StdRng::seed_from_u64(7)).unwrap()
}

#[test]
fn import_round_trip_through_file() {
    let mut ctx = target(SimulatorConfig::default().seed);
    let blob = wrap_for(&mut ctx, b"cross-device secret", None);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sealed.dat");
    blob.write_to(&path).unwrap();
    let loaded = ImportBlob::read_from(&path).unwrap();
    assert_eq!(loaded.to_bytes(), blob.to_bytes());

    let secret = flows::import_unseal(&mut ctx, &loaded).unwrap();
    assert_eq!(&*secret, b"cross-device secret");
    assert!(ctx.get_handles(TpmHt::Transient).unwrap().is_empty());
    assert!(ctx.get_handles(TpmHt::LOADED_SESSION).unwrap().is_empty());
}

#[test]
fn wrong_target_is_an_integrity_failure() {
    let mut intended = target(1);
    let blob = wrap_for(&mut intended, b"not for you", None);

    let mut other = target(2);
    let err = flows::import_unseal(&mut other, &blob).unwrap_err();
    assert_eq!(classify(&err), ErrorCategory::Integrity);
    assert!(other.get_handles(TpmHt::Transient).unwrap().is_empty());
}

#[test]
fn tampered_blob_is_an_integrity_failure() {
    let mut ctx = target(3);
    let mut blob = wrap_for(&mut ctx, b"secret", None);
    let last = blob.duplicate.len() - 1;
    blob.duplicate[last] ^= 0x01;
    let err = flows::import_unseal(&mut ctx, &blob).unwrap_err();
    assert_eq!(classify(&err), ErrorCategory::Integrity);
}

#[test]
fn embedded_pcr_policy_is_enforced_by_the_target() {
    let mut ctx = target(4);
    let zeros = hex::encode([0u8; 32]);
    let pcrs = pcr_spec::parse_pcr_values(&format!("23={zeros}"), TpmAlgId::Sha256).unwrap();
    let blob = wrap_for(&mut ctx, b"gated", Some(&pcrs));

    assert_eq!(&*flows::import_unseal(&mut ctx, &blob).unwrap(), b"gated");

    ctx.pcr_extend(23, &[0x22; 32], TpmAlgId::Sha256).unwrap();
    let err = flows::import_unseal(&mut ctx, &blob).unwrap_err();
    assert_eq!(classify(&err), ErrorCategory::Authorization);
    assert!(ctx.get_handles(TpmHt::Transient).unwrap().is_empty());
    assert!(ctx.get_handles(TpmHt::LOADED_SESSION).unwrap().is_empty());
}

#[test]
fn edited_pcr_list_is_an_integrity_failure() {
    let mut ctx = target(5);
    let zeros = hex::encode([0u8; 32]);
    let pcrs = pcr_spec::parse_pcr_values(&format!("23={zeros}"), TpmAlgId::Sha256).unwrap();
    let mut blob = wrap_for(&mut ctx, b"gated", Some(&pcrs));

    // Point the embedded list at a value the PCR does not hold
    blob.pcrs.as_mut().unwrap().values[0].1[0] ^= 0x01;
    let err = flows::import_unseal(&mut ctx, &blob).unwrap_err();
    assert_eq!(classify(&err), ErrorCategory::Integrity);

    // Dropping the list entirely does not bypass the policy either
    blob.pcrs = None;
    let err = flows::import_unseal(&mut ctx, &blob).unwrap_err();
    assert_eq!(classify(&err), ErrorCategory::Integrity);
    assert!(ctx.get_handles(TpmHt::Transient).unwrap().is_empty());
    assert!(ctx.get_handles(TpmHt::LOADED_SESSION).unwrap().is_empty());
}

#[test]
fn missing_blob_file_is_reported_as_malformed_input() {
    let dir = tempfile::tempdir().unwrap();
    let err = ImportBlob::read_from(dir.path().join("never-written.dat")).unwrap_err();
    assert_eq!(classify(&err), ErrorCategory::MalformedInput);
    assert_eq!(classify(&err).exit_code(), 6);
    assert!(!tpm_seal::report(&err).starts_with("transport failure"));
}

#[test]
fn oversized_secret_is_refused_before_wrapping() {
    let mut ctx = target(6);
    let pem = flows::ek_public_pem(&mut ctx).unwrap();
    let ek_public = keys::ek_public_from_pem(&pem).unwrap();
    let err = import::wrap(&ek_public, &[0x41; 200], None, &mut StdRng::seed_from_u64(7))
        .unwrap_err();
    assert_eq!(classify(&err), ErrorCategory::MalformedInput);
}
