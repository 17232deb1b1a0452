// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Typed TPM errors and their user-facing categories
//!
//! Errors travel as `anyhow::Error` with context attached at every layer.
//! [`ErrorCategory::of`] digs the typed [`TpmError`] back out of the chain so
//! that callers can tell a denied authorization from a tampered blob no
//! matter how much context was added on the way up.

use std::fmt;

use thiserror::Error;

use crate::constants::{TpmCc, TpmRc};

/// Failure categories surfaced to users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The channel to the module could not be used
    Transport,
    /// The module ran out of object or session slots
    ResourceExhausted,
    /// Policy, password or HMAC authorization was rejected
    Authorization,
    /// A blob, response or log failed an integrity check
    Integrity,
    /// User input was rejected before any module call
    MalformedInput,
    /// Any other module error
    Tpm,
}

impl ErrorCategory {
    /// Stable message prefix for this category
    pub fn prefix(self) -> &'static str {
        match self {
            ErrorCategory::Transport => "transport failure",
            ErrorCategory::ResourceExhausted => "TPM out of resources",
            ErrorCategory::Authorization => "authorization failure",
            ErrorCategory::Integrity => "integrity failure",
            ErrorCategory::MalformedInput => "malformed input",
            ErrorCategory::Tpm => "TPM error",
        }
    }

    /// Process exit code for this category
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCategory::Tpm => 1,
            ErrorCategory::Transport => 2,
            ErrorCategory::ResourceExhausted => 3,
            ErrorCategory::Authorization => 4,
            ErrorCategory::Integrity => 5,
            ErrorCategory::MalformedInput => 6,
        }
    }

    /// Classify an error by the first [`TpmError`] in its chain.
    ///
    /// Only [`TpmError::Transport`] counts as a transport failure; an untyped
    /// `io::Error` (a missing input file, say) falls back to [`ErrorCategory::Tpm`].
    pub fn of(err: &anyhow::Error) -> Self {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<TpmError>())
            .map_or(ErrorCategory::Tpm, TpmError::category)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, Error)]
pub enum TpmError {
    #[error("{context}")]
    Transport {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} failed: {}", describe_rc(.code))]
    Response { command: TpmCc, code: u32 },
    #[error("truncated {what}: need {wanted} bytes, {remaining} remaining")]
    Truncated {
        what: &'static str,
        wanted: usize,
        remaining: usize,
    },
    #[error("{0}")]
    Integrity(String),
    #[error("{0}")]
    MalformedInput(String),
}

fn describe_rc(code: &u32) -> String {
    let code = *code;
    match TpmRc::from_u32(code) {
        Some(rc) => format!("{rc} (0x{code:03x})"),
        None => format!("0x{code:08x}"),
    }
}

impl TpmError {
    pub fn transport(context: impl Into<String>, source: std::io::Error) -> Self {
        TpmError::Transport {
            context: context.into(),
            source,
        }
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        TpmError::Integrity(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        TpmError::MalformedInput(msg.into())
    }

    /// The canonical response code, if this error came from the module
    pub fn rc(&self) -> Option<TpmRc> {
        match self {
            TpmError::Response { code, .. } => TpmRc::from_u32(*code),
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            TpmError::Transport { .. } => ErrorCategory::Transport,
            TpmError::Truncated { .. } | TpmError::Integrity(_) => ErrorCategory::Integrity,
            TpmError::MalformedInput(_) => ErrorCategory::MalformedInput,
            TpmError::Response { command, code } => classify_response(*command, *code),
        }
    }
}

fn classify_response(command: TpmCc, code: u32) -> ErrorCategory {
    let Some(rc) = TpmRc::from_u32(code) else {
        return ErrorCategory::Tpm;
    };
    match rc {
        TpmRc::ObjectMemory
        | TpmRc::SessionMemory
        | TpmRc::Memory
        | TpmRc::SessionHandles
        | TpmRc::ObjectHandles => ErrorCategory::ResourceExhausted,
        TpmRc::AuthFail
        | TpmRc::BadAuth
        | TpmRc::PolicyFail
        | TpmRc::PcrChanged
        | TpmRc::AuthUnavailable
        | TpmRc::AuthType
        | TpmRc::AuthMissing => ErrorCategory::Authorization,
        // A policy assertion whose expected value differs from the live state
        TpmRc::Value if matches!(command, TpmCc::PolicyPcr | TpmCc::PolicySecret) => {
            ErrorCategory::Authorization
        }
        TpmRc::Integrity | TpmRc::Binding => ErrorCategory::Integrity,
        TpmRc::EccPoint | TpmRc::Size if matches!(command, TpmCc::Load | TpmCc::Import) => {
            ErrorCategory::Integrity
        }
        _ => ErrorCategory::Tpm,
    }
}

/// Whether the error chain carries the given module response code
pub fn has_rc(err: &anyhow::Error, rc: TpmRc) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<TpmError>())
        .any(|e| e.rc() == Some(rc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    fn response(command: TpmCc, code: u32) -> anyhow::Error {
        anyhow::Error::new(TpmError::Response { command, code })
    }

    #[test]
    fn test_context_does_not_reclassify() {
        let err = Err::<(), _>(response(TpmCc::Unseal, TpmRc::PolicyFail.at_session(1)))
            .context("failed to unseal")
            .context("seal round trip")
            .unwrap_err();
        assert_eq!(ErrorCategory::of(&err), ErrorCategory::Authorization);
        assert!(has_rc(&err, TpmRc::PolicyFail));
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            ErrorCategory::of(&response(TpmCc::Load, TpmRc::Integrity.at_parameter(1))),
            ErrorCategory::Integrity
        );
        assert_eq!(
            ErrorCategory::of(&response(TpmCc::CreatePrimary, 0x902)),
            ErrorCategory::ResourceExhausted
        );
        assert_eq!(
            ErrorCategory::of(&response(TpmCc::PolicyPcr, TpmRc::Value.at_parameter(1))),
            ErrorCategory::Authorization
        );
        assert_eq!(
            ErrorCategory::of(&response(TpmCc::Create, TpmRc::Value.at_parameter(1))),
            ErrorCategory::Tpm
        );
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(
            ErrorCategory::of(&TpmError::transport("write", io).into()),
            ErrorCategory::Transport
        );
        assert_eq!(
            ErrorCategory::of(&anyhow::anyhow!("plain")),
            ErrorCategory::Tpm
        );
    }

    #[test]
    fn test_untyped_io_error_is_not_transport() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = anyhow::Error::new(missing).context("failed to read blob");
        assert_eq!(ErrorCategory::of(&err), ErrorCategory::Tpm);

        let err = anyhow::Error::new(TpmError::malformed("cannot read blob"))
            .context("import-unseal");
        assert_eq!(ErrorCategory::of(&err), ErrorCategory::MalformedInput);
    }
}
