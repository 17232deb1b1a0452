// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Event log verification against the TPM's PCRs

use std::path::Path;

use anyhow::{bail, Context, Result};
use cc_eventlog::tpm::TPM_BINARY_BIOS_MEASUREMENTS;
use cc_eventlog::{PcrBank, TpmEventLog, VerifiedEvent};
use tpm2::{TpmAlgId, TpmContext, TpmError};
use tracing::info;

use crate::error::read_input;

/// Read and decode a binary event log, by default the kernel's securityfs copy
pub fn read_log(path: Option<&Path>) -> Result<TpmEventLog> {
    let path = path.unwrap_or(Path::new(TPM_BINARY_BIOS_MEASUREMENTS));
    let data = read_input(path, "event log")?;
    TpmEventLog::decode(&mut data.as_slice())
        .with_context(|| format!("failed to decode {}", path.display()))
}

/// Live values of `pcrs` in the `bank` bank
pub fn live_bank(tpm: &mut TpmContext, bank: TpmAlgId, pcrs: &[u32]) -> Result<PcrBank> {
    let mut reference = PcrBank::new(bank.to_u16());
    for (index, value) in tpm
        .pcr_read_bank(bank, pcrs)
        .context("failed to read reference PCRs")?
    {
        reference.insert(index, value);
    }
    Ok(reference)
}

/// A single given PCR value, checked against the bank's digest size
pub fn given_bank(bank: TpmAlgId, pcr: u32, value: Vec<u8>) -> Result<PcrBank> {
    if value.len() != bank.digest_size() {
        bail!(TpmError::malformed(format!(
            "PCR {pcr} value is {} bytes, {bank:?} needs {}",
            value.len(),
            bank.digest_size()
        )));
    }
    Ok(PcrBank::new(bank.to_u16()).with_value(pcr, value))
}

/// Replay the events of the PCRs in `reference` and require the chain to
/// reproduce every reference value.
pub fn verify_log(log: &TpmEventLog, reference: &PcrBank) -> Result<Vec<VerifiedEvent>> {
    let events: Vec<_> = log
        .events
        .iter()
        .filter(|e| reference.values.contains_key(&e.pcr_index))
        .cloned()
        .collect();
    let verified = cc_eventlog::verify(&events, reference)
        .context("event log does not explain the PCR values")?;
    info!(
        "event log verified: {} event(s) over PCR {:?}",
        verified.len(),
        reference.values.keys().collect::<Vec<_>>()
    );
    Ok(verified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cc_eventlog::tcg::{self, TcgDigest, TcgEfiSpecIdEvent};
    use cc_eventlog::TpmEvent;
    use sha2::{Digest, Sha256};
    use tpm2::{ErrorCategory, SimulatorConfig};

    fn log_for(pcr: u32, payloads: &[&[u8]]) -> TpmEventLog {
        let events = payloads
            .iter()
            .map(|payload| {
                TpmEvent::new(
                    pcr,
                    tcg::EV_IPL,
                    vec![TcgDigest {
                        algo_id: tcg::TPM_ALG_SHA256,
                        hash: Sha256::digest(payload).to_vec(),
                    }],
                    payload.to_vec(),
                )
            })
            .collect();
        TpmEventLog::new(TcgEfiSpecIdEvent::default(), events)
    }

    #[test]
    fn test_log_matches_extended_pcr() {
        let mut tpm = TpmContext::simulator(SimulatorConfig::default());
        for payload in [b"kernel".as_slice(), b"initrd".as_slice()] {
            tpm.pcr_extend(9, &Sha256::digest(payload), TpmAlgId::Sha256)
                .unwrap();
        }
        let reference = live_bank(&mut tpm, TpmAlgId::Sha256, &[9]).unwrap();

        let verified = verify_log(&log_for(9, &[b"kernel", b"initrd"]), &reference).unwrap();
        assert_eq!(verified.len(), 2);

        let err = verify_log(&log_for(9, &[b"kernel"]), &reference).unwrap_err();
        assert_eq!(crate::classify(&err), ErrorCategory::Integrity);
    }

    #[test]
    fn test_read_log_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binary_bios_measurements");
        let err = read_log(Some(&path)).unwrap_err();
        assert_eq!(crate::classify(&err), ErrorCategory::MalformedInput);

        fs_err::write(&path, [0u8; 5]).unwrap();
        let err = read_log(Some(&path)).unwrap_err();
        assert_eq!(crate::classify(&err), ErrorCategory::Integrity);

        fs_err::write(&path, log_for(9, &[b"kernel"]).encode()).unwrap();
        assert_eq!(read_log(Some(&path)).unwrap().events.len(), 1);
    }

    #[test]
    fn test_given_value_length() {
        assert!(given_bank(TpmAlgId::Sha1, 0, vec![0; 20]).is_ok());
        let err = given_bank(TpmAlgId::Sha1, 0, vec![0; 32]).unwrap_err();
        assert_eq!(ErrorCategory::of(&err), ErrorCategory::MalformedInput);
    }
}
