// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use cc_eventlog::tcg::{self, TcgDigest, TcgEfiSpecIdEvent};
use cc_eventlog::{TpmEvent, TpmEventLog};
use sha2::{Digest, Sha256};
use tpm2::{ErrorCategory, SimulatorConfig, TpmAlgId, TpmContext};
use tpm_seal::{classify, eventlog};

fn measure(ctx: &mut TpmContext, pcr: u32, payload: &[u8]) -> TpmEvent {
    let digest = Sha256::digest(payload).to_vec();
    ctx.pcr_extend(pcr, &digest, TpmAlgId::Sha256).unwrap();
    TpmEvent::new(
        pcr,
        tcg::EV_IPL,
        vec![TcgDigest {
            algo_id: tcg::TPM_ALG_SHA256,
            hash: digest,
        }],
        payload.to_vec(),
    )
}

fn spec_id() -> TcgEfiSpecIdEvent {
    TcgEfiSpecIdEvent::new(&[tcg::TPM_ALG_SHA256])
}

#[test]
fn persisted_log_explains_live_pcrs() {
    let mut ctx = TpmContext::simulator(SimulatorConfig::default());
    let events = vec![
        measure(&mut ctx, 8, b"grub.cfg"),
        measure(&mut ctx, 9, b"vmlinuz"),
        measure(&mut ctx, 8, b"cmdline"),
    ];
    let log = TpmEventLog::new(spec_id(), events);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("binary_bios_measurements");
    fs_err::write(&path, log.encode()).unwrap();
    let read_back = eventlog::read_log(Some(&path)).unwrap();
    assert_eq!(read_back.events.len(), 3);

    let reference = eventlog::live_bank(&mut ctx, TpmAlgId::Sha256, &[8]).unwrap();
    let verified = eventlog::verify_log(&read_back, &reference).unwrap();
    let payloads: Vec<_> = verified.iter().map(|e| e.data.clone()).collect();
    assert_eq!(payloads, [b"grub.cfg".to_vec(), b"cmdline".to_vec()]);

    let reference = eventlog::live_bank(&mut ctx, TpmAlgId::Sha256, &[8, 9]).unwrap();
    assert_eq!(eventlog::verify_log(&read_back, &reference).unwrap().len(), 3);
}

#[test]
fn tampered_log_is_rejected() {
    let mut ctx = TpmContext::simulator(SimulatorConfig::default());
    let mut events = vec![
        measure(&mut ctx, 10, b"a"),
        measure(&mut ctx, 10, b"b"),
    ];
    let reference = eventlog::live_bank(&mut ctx, TpmAlgId::Sha256, &[10]).unwrap();
    events[0].digests[0].hash[0] ^= 0xFF;

    let err = eventlog::verify_log(&TpmEventLog::new(spec_id(), events), &reference).unwrap_err();
    assert_eq!(classify(&err), ErrorCategory::Integrity);
    assert!(tpm_seal::report(&err).starts_with("integrity failure"));
}

#[test]
fn given_pcr_value_replaces_the_live_read() {
    let mut ctx = TpmContext::simulator(SimulatorConfig::default());
    let events = vec![measure(&mut ctx, 14, b"policy")];
    let live = ctx.pcr_read_single(14, TpmAlgId::Sha256).unwrap();

    let reference = eventlog::given_bank(TpmAlgId::Sha256, 14, live).unwrap();
    let log = TpmEventLog::new(spec_id(), events);
    assert_eq!(eventlog::verify_log(&log, &reference).unwrap().len(), 1);

    let reference = eventlog::given_bank(TpmAlgId::Sha256, 14, vec![0; 32]).unwrap();
    assert!(eventlog::verify_log(&log, &reference).is_err());
}
