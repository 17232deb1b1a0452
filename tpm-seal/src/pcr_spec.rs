// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! `index=hex-digest` PCR arguments

use anyhow::{bail, Result};
use tpm2::policy::PcrValues;
use tpm2::{TpmAlgId, TpmError, PCR_COUNT};

/// Parse `23=ab12..,20=cd34..` into expected values of the `hash` bank.
///
/// Every check happens here, before any TPM command is sent. An empty string
/// yields an empty set.
pub fn parse_pcr_values(spec: &str, hash: TpmAlgId) -> Result<PcrValues> {
    let mut values = PcrValues::new(hash);
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((index, digest)) = entry.split_once('=') else {
            bail!(TpmError::malformed(format!(
                "PCR value {entry:?} is not of the form index=hex"
            )));
        };
        let index = parse_pcr_index(index.trim())?;
        let digest = hex::decode(digest.trim()).map_err(|e| {
            TpmError::malformed(format!("PCR {index} value is not valid hex: {e}"))
        })?;
        values.insert(index, digest)?;
    }
    Ok(values)
}

/// A PCR index in `[0, 23]`
pub fn parse_pcr_index(s: &str) -> Result<u32> {
    let index: u32 = s
        .parse()
        .map_err(|_| TpmError::malformed(format!("invalid PCR index {s:?}")))?;
    if index >= PCR_COUNT {
        bail!(TpmError::malformed(format!(
            "PCR index {index} out of range [0, {}]",
            PCR_COUNT - 1
        )));
    }
    Ok(index)
}

/// Hash bank by its command-line name
pub fn parse_bank(s: &str) -> Result<TpmAlgId> {
    match s.to_ascii_lowercase().as_str() {
        "sha1" => Ok(TpmAlgId::Sha1),
        "sha256" => Ok(TpmAlgId::Sha256),
        other => bail!(TpmError::malformed(format!(
            "unsupported PCR bank {other:?}, expected sha1 or sha256"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm2::ErrorCategory;

    fn category(err: anyhow::Error) -> ErrorCategory {
        ErrorCategory::of(&err)
    }

    #[test]
    fn test_parse_values() {
        let spec = format!("23={}, 20={}", "00".repeat(32), "ab".repeat(32));
        let values = parse_pcr_values(&spec, TpmAlgId::Sha256).unwrap();
        assert_eq!(values.indices(), vec![20, 23]);
        assert_eq!(values.values[&20], vec![0xab; 32]);
        assert!(parse_pcr_values("", TpmAlgId::Sha256).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_bad_input() {
        let good = "00".repeat(32);
        for spec in [
            format!("24={good}"),
            format!("x={good}"),
            "23=abcd".to_string(),
            "23=zz".to_string(),
            "23".to_string(),
            format!("1={good},1={good}"),
        ] {
            let err = parse_pcr_values(&spec, TpmAlgId::Sha256).unwrap_err();
            assert_eq!(category(err), ErrorCategory::MalformedInput, "{spec}");
        }
        assert!(parse_pcr_values(&"00".repeat(20), TpmAlgId::Sha1).is_err());
    }

    #[test]
    fn test_bank_and_index() {
        assert_eq!(parse_bank("SHA1").unwrap(), TpmAlgId::Sha1);
        assert!(parse_bank("sm3").is_err());
        assert_eq!(parse_pcr_index("0").unwrap(), 0);
        assert!(parse_pcr_index("-1").is_err());
    }
}
