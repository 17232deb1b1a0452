// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM Event Log parsing (binary_bios_measurements format)

use crate::codecs::VecOf;
use crate::replay::ReplayError;
use crate::tcg::{self, TcgDigest, TcgEfiSpecIdEvent};
use anyhow::{Context, Result};
use scale::{Decode, Encode};
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;

/// Kernel export of the firmware event log
pub const TPM_BINARY_BIOS_MEASUREMENTS: &str =
    "/sys/kernel/security/tpm0/binary_bios_measurements";

/// Signature opening the data of a StartupLocality `EV_NO_ACTION` event
pub const STARTUP_LOCALITY_SIGNATURE: &[u8; 16] = b"StartupLocality\0";

/// One TCG_PCR_EVENT2 record
///
/// See TCG PC Client Platform Firmware Profile spec section 9.2.2
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpmEvent {
    /// PCR index this event was extended to
    pub pcr_index: u32,
    pub event_type: u32,
    /// One digest per bank the log records
    pub digests: Vec<TcgDigest>,
    /// Raw event data
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl core::fmt::Debug for TpmEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TpmEvent")
            .field("pcr_index", &self.pcr_index)
            .field("event_type", &self.event_type)
            .field(
                "digests",
                &self
                    .digests
                    .iter()
                    .map(|d| hex::encode(&d.hash))
                    .collect::<Vec<_>>(),
            )
            .field("data", &hex::encode(&self.data))
            .finish()
    }
}

impl Decode for TpmEvent {
    fn decode<I: scale::Input>(input: &mut I) -> Result<Self, scale::Error> {
        let pcr_index = u32::decode(input)?;
        let event_type = u32::decode(input)?;
        let digests = VecOf::<u32, TcgDigest>::decode(input)?.into_inner();
        let data = VecOf::<u32, u8>::decode(input)?.into_inner();
        Ok(Self {
            pcr_index,
            event_type,
            digests,
            data,
        })
    }
}

impl Encode for TpmEvent {
    fn encode_to<O: scale::Output + ?Sized>(&self, dest: &mut O) {
        self.pcr_index.encode_to(dest);
        self.event_type.encode_to(dest);
        (self.digests.len() as u32).encode_to(dest);
        for digest in &self.digests {
            digest.encode_to(dest);
        }
        (self.data.len() as u32).encode_to(dest);
        dest.write(&self.data);
    }
}

impl TpmEvent {
    pub fn new(pcr_index: u32, event_type: u32, digests: Vec<TcgDigest>, data: Vec<u8>) -> Self {
        Self {
            pcr_index,
            event_type,
            digests,
            data,
        }
    }

    /// The digest recorded for one bank
    pub fn digest(&self, algo_id: u16) -> Option<&[u8]> {
        self.digests
            .iter()
            .find(|d| d.algo_id == algo_id)
            .map(|d| d.hash.as_slice())
    }

    /// Whether this event was extended into its PCR
    pub fn is_extended_to_pcr(&self) -> bool {
        self.event_type != tcg::EV_NO_ACTION
    }

    /// Locality announced by a StartupLocality event
    pub fn startup_locality(&self) -> Option<u8> {
        if self.event_type != tcg::EV_NO_ACTION || self.pcr_index != 0 {
            return None;
        }
        match self.data.as_slice() {
            [signature @ .., locality] if signature == STARTUP_LOCALITY_SIGNATURE.as_slice() => {
                Some(*locality)
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TpmEventLog {
    pub spec_id_header_event: TcgEfiSpecIdEvent,
    /// Every event after the header, including `EV_NO_ACTION` ones
    pub events: Vec<TpmEvent>,
}

impl TpmEventLog {
    pub fn new(spec_id_header_event: TcgEfiSpecIdEvent, events: Vec<TpmEvent>) -> Self {
        Self {
            spec_id_header_event,
            events,
        }
    }

    /// Decode from binary_bios_measurements format
    ///
    /// First event is TCG_PCClientPCREvent (legacy format with SHA-1).
    /// Subsequent events are TCG_PCR_EVENT2 (crypto-agile format).
    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let spec_id_header_event = parse_spec_id_event(input)
            .map_err(|e| ReplayError::Malformed(format!("bad spec id event: {e:#}")))?;

        let mut events = vec![];
        loop {
            let head_buffer = &mut &input[..];
            let pcr_index = match u32::decode(head_buffer) {
                Ok(idx) => idx,
                Err(_) => break,
            };

            if pcr_index == 0xFFFFFFFF {
                break;
            }

            let event = TpmEvent::decode(input).map_err(|e| {
                ReplayError::Malformed(format!("event {} is truncated: {e}", events.len()))
            })?;
            events.push(event);
        }

        Ok(TpmEventLog {
            spec_id_header_event,
            events,
        })
    }

    /// Encode in binary_bios_measurements format
    pub fn encode(&self) -> Vec<u8> {
        let header = SpecIdHeader {
            pcr_index: 0,
            event_type: tcg::EV_NO_ACTION,
            digest_sha1: [0; 20],
            event: self.spec_id_header_event.encode().into(),
        };
        let mut out = header.encode();
        for event in &self.events {
            event.encode_to(&mut out);
        }
        out
    }

    /// Filter events by PCR index
    pub fn filter_by_pcr(&self, pcr_index: u32) -> Vec<TpmEvent> {
        self.events
            .iter()
            .filter(|e| e.pcr_index == pcr_index)
            .cloned()
            .collect()
    }

    /// Banks the header announces
    pub fn algorithms(&self) -> Vec<u16> {
        self.spec_id_header_event
            .digest_sizes
            .iter()
            .map(|d| d.algo_id)
            .collect()
    }
}

#[derive(Encode, Decode)]
struct SpecIdHeader {
    pcr_index: u32,
    event_type: u32,
    digest_sha1: [u8; 20],
    event: VecOf<u32, u8>,
}

/// Parse Spec ID Event in legacy TCG_PCClientPCREvent format
fn parse_spec_id_event<I: scale::Input>(input: &mut I) -> Result<TcgEfiSpecIdEvent> {
    let header = SpecIdHeader::decode(input).context("failed to decode spec id header")?;
    if header.event_type != tcg::EV_NO_ACTION {
        anyhow::bail!(
            "first event has type 0x{:x}, expected EV_NO_ACTION",
            header.event_type
        );
    }
    TcgEfiSpecIdEvent::decode(&mut header.event.as_slice())
        .context("failed to decode TcgEfiSpecIdEvent")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha256(hash: u8) -> TcgDigest {
        TcgDigest {
            algo_id: tcg::TPM_ALG_SHA256,
            hash: vec![hash; 32],
        }
    }

    fn sample() -> TpmEventLog {
        let mut locality = STARTUP_LOCALITY_SIGNATURE.to_vec();
        locality.push(3);
        TpmEventLog::new(
            TcgEfiSpecIdEvent::default(),
            vec![
                TpmEvent::new(0, tcg::EV_NO_ACTION, vec![sha256(0)], locality),
                TpmEvent::new(0, tcg::EV_S_CRTM_VERSION, vec![sha256(1)], vec![0; 2]),
                TpmEvent::new(2, tcg::EV_SEPARATOR, vec![sha256(2)], vec![0; 4]),
            ],
        )
    }

    #[test]
    fn test_decode_empty() {
        let result = TpmEventLog::decode(&mut &[][..]);
        assert!(result.is_err());
    }

    #[test]
    fn test_encode_decode() {
        let log = sample();
        let bytes = log.encode();
        let decoded = TpmEventLog::decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded.events, log.events);
        assert_eq!(decoded.algorithms(), vec![tcg::TPM_ALG_SHA256]);
        assert_eq!(
            decoded.spec_id_header_event.signature,
            tcg::SPEC_ID_EVENT03_SIGNATURE
        );
    }

    #[test]
    fn test_truncated_log_is_malformed() {
        let bytes = sample().encode();
        let err = TpmEventLog::decode(&mut &bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReplayError>(),
            Some(ReplayError::Malformed(_))
        ));
    }

    #[test]
    fn test_filter_and_locality() {
        let log = sample();
        assert_eq!(log.filter_by_pcr(0).len(), 2);
        assert_eq!(log.filter_by_pcr(99).len(), 0);
        assert_eq!(log.events[0].startup_locality(), Some(3));
        assert!(!log.events[0].is_extended_to_pcr());
        assert_eq!(log.events[1].startup_locality(), None);
        assert_eq!(log.events[2].digest(tcg::TPM_ALG_SHA256), Some(&[2u8; 32][..]));
        assert_eq!(log.events[2].digest(tcg::TPM_ALG_SHA1), None);
    }

    #[test]
    fn test_json_uses_hex() {
        let json = serde_json::to_value(&sample().events[2]).unwrap();
        assert_eq!(json["data"], "00000000");
        assert_eq!(json["digests"][0]["algo_id"], 11);
    }
}
