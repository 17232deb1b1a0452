// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! PCR replay of a decoded event log

use std::collections::BTreeMap;

use serde::Serialize;
use serde_human_bytes as hex_bytes;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::debug;

use crate::tcg::{self, alg_id_to_digest_size};
use crate::tpm::TpmEvent;

/// Number of PCRs on a PC client platform
pub const PCR_COUNT: u32 = 24;

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("event {index} (PCR {pcr}) carries no digest for algorithm 0x{alg:04x}")]
    MissingDigest { index: usize, pcr: u32, alg: u16 },
    #[error(
        "PCR {pcr} does not match the event log: expected {}, replayed {}",
        hex::encode(.expected),
        hex::encode(.replayed)
    )]
    Mismatch {
        pcr: u32,
        expected: Vec<u8>,
        replayed: Vec<u8>,
    },
    #[error("PCR {0} is out of range")]
    UnknownPcr(u32),
    #[error("unsupported digest algorithm 0x{0:04x}")]
    UnsupportedAlgorithm(u16),
    #[error("malformed event log: {0}")]
    Malformed(String),
}

/// PCR values of one bank, keyed by PCR index
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcrBank {
    pub alg_id: u16,
    pub values: BTreeMap<u32, Vec<u8>>,
}

impl PcrBank {
    pub fn new(alg_id: u16) -> Self {
        Self {
            alg_id,
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, pcr: u32, value: Vec<u8>) -> Self {
        self.insert(pcr, value);
        self
    }

    pub fn insert(&mut self, pcr: u32, value: Vec<u8>) {
        self.values.insert(pcr, value);
    }

    pub fn get(&self, pcr: u32) -> Option<&[u8]> {
        self.values.get(&pcr).map(Vec::as_slice)
    }
}

/// An event whose PCR chain has been checked against a reference bank
#[derive(Clone, Debug, Serialize)]
pub struct VerifiedEvent {
    /// Position in the event log
    pub sequence: usize,
    /// PCR index
    pub index: u32,
    pub event_type: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type_name: Option<&'static str>,
    #[serde(with = "hex_bytes")]
    pub digest: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

fn digest_size(alg_id: u16) -> Result<usize, ReplayError> {
    alg_id_to_digest_size(alg_id)
        .map(usize::from)
        .ok_or(ReplayError::UnsupportedAlgorithm(alg_id))
}

fn extend(alg_id: u16, acc: &[u8], digest: &[u8]) -> Result<Vec<u8>, ReplayError> {
    fn chain<D: Digest>(acc: &[u8], digest: &[u8]) -> Vec<u8> {
        let mut hasher = D::new();
        hasher.update(acc);
        hasher.update(digest);
        hasher.finalize().to_vec()
    }
    let out = match alg_id {
        tcg::TPM_ALG_SHA1 => chain::<Sha1>(acc, digest),
        tcg::TPM_ALG_SHA256 => chain::<Sha256>(acc, digest),
        tcg::TPM_ALG_SHA384 => chain::<Sha384>(acc, digest),
        tcg::TPM_ALG_SHA512 => chain::<Sha512>(acc, digest),
        _ => return Err(ReplayError::UnsupportedAlgorithm(alg_id)),
    };
    Ok(out)
}

/// Value a PCR holds after platform reset
///
/// PCR 0 starts at `0..0 || locality` when the log announces a startup
/// locality, every other PCR starts at zero.
pub fn reset_value(alg_id: u16, pcr: u32, locality: Option<u8>) -> Result<Vec<u8>, ReplayError> {
    let mut value = vec![0u8; digest_size(alg_id)?];
    if let (0, Some(locality)) = (pcr, locality) {
        if let Some(last) = value.last_mut() {
            *last = locality;
        }
    }
    Ok(value)
}

fn startup_locality(events: &[TpmEvent]) -> Option<u8> {
    events.iter().find_map(TpmEvent::startup_locality)
}

/// Replay every extended event into a fresh bank
///
/// Only PCRs that at least one event extends appear in the result.
pub fn replay(events: &[TpmEvent], alg_id: u16) -> Result<PcrBank, ReplayError> {
    let size = digest_size(alg_id)?;
    let locality = startup_locality(events);
    let mut bank = PcrBank::new(alg_id);
    for (index, event) in events.iter().enumerate() {
        if !event.is_extended_to_pcr() {
            continue;
        }
        let pcr = event.pcr_index;
        if pcr >= PCR_COUNT {
            return Err(ReplayError::UnknownPcr(pcr));
        }
        let digest = event.digest(alg_id).ok_or(ReplayError::MissingDigest {
            index,
            pcr,
            alg: alg_id,
        })?;
        if digest.len() != size {
            return Err(ReplayError::Malformed(format!(
                "event {index} has a {} byte digest, expected {size}",
                digest.len()
            )));
        }
        let acc = match bank.values.remove(&pcr) {
            Some(acc) => acc,
            None => reset_value(alg_id, pcr, locality)?,
        };
        bank.insert(pcr, extend(alg_id, &acc, digest)?);
    }
    Ok(bank)
}

/// Replay `events` and check the result against every PCR in `reference`
///
/// A reference PCR that no event extends must still hold its reset value.
/// On success the replayed events are returned in log order.
pub fn verify(events: &[TpmEvent], reference: &PcrBank) -> Result<Vec<VerifiedEvent>, ReplayError> {
    let alg_id = reference.alg_id;
    let replayed = replay(events, alg_id)?;
    let locality = startup_locality(events);
    for (&pcr, expected) in &reference.values {
        if pcr >= PCR_COUNT {
            return Err(ReplayError::UnknownPcr(pcr));
        }
        let value = match replayed.get(pcr) {
            Some(value) => value.to_vec(),
            None => reset_value(alg_id, pcr, locality)?,
        };
        if &value != expected {
            return Err(ReplayError::Mismatch {
                pcr,
                expected: expected.clone(),
                replayed: value,
            });
        }
        debug!("PCR {pcr} matches the event log");
    }

    let verified = events
        .iter()
        .enumerate()
        .filter(|(_, event)| event.is_extended_to_pcr())
        .filter_map(|(sequence, event)| {
            Some(VerifiedEvent {
                sequence,
                index: event.pcr_index,
                event_type: event.event_type,
                event_type_name: tcg::event_type_name(event.event_type),
                digest: event.digest(alg_id)?.to_vec(),
                data: event.data.clone(),
            })
        })
        .collect();
    Ok(verified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcg::TcgDigest;
    use crate::tpm::STARTUP_LOCALITY_SIGNATURE;

    fn sha256(data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    fn event(pcr: u32, payload: &[u8]) -> TpmEvent {
        TpmEvent::new(
            pcr,
            tcg::EV_IPL,
            vec![TcgDigest {
                algo_id: tcg::TPM_ALG_SHA256,
                hash: sha256(payload),
            }],
            payload.to_vec(),
        )
    }

    fn chained(start: Vec<u8>, payloads: &[&[u8]]) -> Vec<u8> {
        payloads.iter().fold(start, |acc, payload| {
            sha256(&[acc.as_slice(), &sha256(payload)].concat())
        })
    }

    #[test]
    fn test_two_events_on_pcr0() {
        let events = vec![event(0, b"a"), event(0, b"b")];
        let expected = chained(vec![0; 32], &[b"a", b"b"]);
        let bank = PcrBank::new(tcg::TPM_ALG_SHA256).with_value(0, expected.clone());

        let verified = verify(&events, &bank).unwrap();
        assert_eq!(verified.len(), 2);
        assert_eq!(verified[0].data, b"a");
        assert_eq!(verified[1].digest, sha256(b"b"));
        assert_eq!(verified[1].event_type_name, Some("EV_IPL"));

        let replayed = replay(&events, tcg::TPM_ALG_SHA256).unwrap();
        assert_eq!(replayed.get(0), Some(expected.as_slice()));
    }

    #[test]
    fn test_mutated_digest_fails() {
        let expected = chained(vec![0; 32], &[b"a", b"b"]);
        let bank = PcrBank::new(tcg::TPM_ALG_SHA256).with_value(0, expected);

        for i in 0..2 {
            let mut events = vec![event(0, b"a"), event(0, b"b")];
            events[i].digests[0].hash[5] ^= 0x01;
            let err = verify(&events, &bank).unwrap_err();
            assert!(matches!(err, ReplayError::Mismatch { pcr: 0, .. }));
        }

        let reordered = vec![event(0, b"b"), event(0, b"a")];
        assert!(verify(&reordered, &bank).is_err());
    }

    #[test]
    fn test_startup_locality() {
        let mut data = STARTUP_LOCALITY_SIGNATURE.to_vec();
        data.push(3);
        let locality = TpmEvent::new(
            0,
            tcg::EV_NO_ACTION,
            vec![TcgDigest {
                algo_id: tcg::TPM_ALG_SHA256,
                hash: vec![0; 32],
            }],
            data,
        );
        let events = vec![locality, event(0, b"crtm")];

        let mut start = vec![0u8; 32];
        start[31] = 3;
        let bank = PcrBank::new(tcg::TPM_ALG_SHA256).with_value(0, chained(start, &[b"crtm"]));
        let verified = verify(&events, &bank).unwrap();
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].sequence, 1);
    }

    #[test]
    fn test_untouched_pcr_must_be_reset() {
        let events = vec![event(0, b"a")];
        let bank = PcrBank::new(tcg::TPM_ALG_SHA256).with_value(7, vec![0; 32]);
        assert!(verify(&events, &bank).is_ok());

        let bank = PcrBank::new(tcg::TPM_ALG_SHA256).with_value(7, vec![1; 32]);
        assert!(matches!(
            verify(&events, &bank),
            Err(ReplayError::Mismatch { pcr: 7, .. })
        ));
    }

    #[test]
    fn test_missing_bank_and_bad_pcr() {
        let events = vec![event(0, b"a")];
        assert!(matches!(
            replay(&events, tcg::TPM_ALG_SHA1),
            Err(ReplayError::MissingDigest { index: 0, pcr: 0, .. })
        ));
        assert!(matches!(
            replay(&events, 0x99),
            Err(ReplayError::UnsupportedAlgorithm(0x99))
        ));
        assert!(matches!(
            replay(&[event(30, b"a")], tcg::TPM_ALG_SHA256),
            Err(ReplayError::UnknownPcr(30))
        ));
    }

    #[test]
    fn test_mismatch_message_is_hex() {
        let err = ReplayError::Mismatch {
            pcr: 4,
            expected: vec![0xab],
            replayed: vec![0xcd],
        };
        assert_eq!(
            err.to_string(),
            "PCR 4 does not match the event log: expected ab, replayed cd"
        );
    }
}
