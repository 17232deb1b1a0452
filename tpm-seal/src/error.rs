// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use anyhow::Result;
use cc_eventlog::ReplayError;
use tpm2::{ErrorCategory, TpmError};

/// Category of a failure anywhere in the sealing engine
///
/// A broken event log chain is an integrity failure; everything else is
/// classified by the TPM error it carries.
pub fn classify(err: &anyhow::Error) -> ErrorCategory {
    if err.chain().any(|cause| cause.is::<ReplayError>()) {
        return ErrorCategory::Integrity;
    }
    ErrorCategory::of(err)
}

/// `<prefix>: <error chain>`, as printed by the CLI
pub fn report(err: &anyhow::Error) -> String {
    format!("{}: {:#}", classify(err).prefix(), err)
}

/// Read a file named on the command line; failures are malformed input
pub fn read_input(path: impl AsRef<Path>, what: &str) -> Result<Vec<u8>> {
    fs_err::read(path.as_ref())
        .map_err(|e| TpmError::malformed(format!("cannot read {what}: {e}")).into())
}

/// Write a file named on the command line
pub fn write_output(path: impl AsRef<Path>, what: &str, data: impl AsRef<[u8]>) -> Result<()> {
    fs_err::write(path.as_ref(), data)
        .map_err(|e| TpmError::malformed(format!("cannot write {what}: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_replay_errors_are_integrity() {
        let err = Err::<(), _>(ReplayError::UnknownPcr(40))
            .context("failed to verify event log")
            .unwrap_err();
        assert_eq!(classify(&err), ErrorCategory::Integrity);
        assert_eq!(
            report(&err),
            "integrity failure: failed to verify event log: PCR 40 is out of range"
        );
    }

    #[test]
    fn test_malformed_input_prefix() {
        let err = anyhow::Error::new(tpm2::TpmError::malformed("bad PCR spec"));
        assert_eq!(classify(&err), ErrorCategory::MalformedInput);
        assert_eq!(report(&err), "malformed input: bad PCR spec");
    }

    #[test]
    fn test_unreadable_input_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_input(dir.path().join("absent.dat"), "sealed data")
            .context("import-unseal")
            .unwrap_err();
        assert_eq!(classify(&err), ErrorCategory::MalformedInput);
        assert!(report(&err)
            .starts_with("malformed input: import-unseal: cannot read sealed data"));

        let err = write_output(dir.path().join("no/such/dir/ek.pem"), "EK public key", b"pem")
            .unwrap_err();
        assert_eq!(classify(&err), ErrorCategory::MalformedInput);
    }
}
