// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! HMAC session negotiation
//!
//! An HMAC session can be keyed four ways. None of them is a safe default
//! for every caller, so the mode is always chosen explicitly.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use tpm2::{
    AuthSession, HandleScope, HmacSessionParams, NamedHandle, ParameterEncryption,
    SessionKeySource, TpmAlgId, TpmError, TpmtPublic, MIN_NONCE_SIZE,
};
use tracing::debug;

/// How the session key of an HMAC session is established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacMode {
    /// Keyed by the entity's auth value only
    Plain,
    /// Salt encrypted to the endorsement key
    SaltedByEk,
    /// Salt encrypted to the storage primary
    SaltedByPrimary,
    /// Bound to the authorized entity
    Bound,
}

impl HmacMode {
    pub const ALL: [HmacMode; 4] = [
        HmacMode::Plain,
        HmacMode::SaltedByEk,
        HmacMode::SaltedByPrimary,
        HmacMode::Bound,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HmacMode::Plain => "plain",
            HmacMode::SaltedByEk => "salted-ek",
            HmacMode::SaltedByPrimary => "salted-primary",
            HmacMode::Bound => "bound",
        }
    }
}

impl fmt::Display for HmacMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HmacMode {
    type Err = TpmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HmacMode::ALL
            .into_iter()
            .find(|mode| mode.name() == s)
            .ok_or_else(|| {
                TpmError::malformed(format!(
                    "unknown session mode {s:?}, expected one of: plain, salted-ek, salted-primary, bound"
                ))
            })
    }
}

/// Which parameters to encrypt, by command-line name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Encryption(pub ParameterEncryption);

impl FromStr for Encryption {
    type Err = TpmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encryption = match s {
            "none" => ParameterEncryption::None,
            "in" => ParameterEncryption::In,
            "out" => ParameterEncryption::Out,
            "in-out" => ParameterEncryption::InOut,
            other => {
                return Err(TpmError::malformed(format!(
                    "unknown encryption {other:?}, expected one of: none, in, out, in-out"
                )))
            }
        };
        Ok(Encryption(encryption))
    }
}

/// Keys available for salting; a mode that needs a missing key fails
#[derive(Clone, Copy, Default)]
pub struct SaltKeys<'a> {
    pub ek: Option<(&'a NamedHandle, &'a TpmtPublic)>,
    pub primary: Option<(&'a NamedHandle, &'a TpmtPublic)>,
}

/// A fully specified HMAC session
#[derive(Debug, Clone, Copy)]
pub struct SessionPlan {
    pub mode: HmacMode,
    pub encryption: ParameterEncryption,
    pub hash_alg: TpmAlgId,
    pub nonce_size: usize,
}

impl SessionPlan {
    pub fn new(mode: HmacMode, encryption: ParameterEncryption) -> Self {
        Self {
            mode,
            encryption,
            hash_alg: TpmAlgId::Sha256,
            nonce_size: MIN_NONCE_SIZE,
        }
    }

    /// Start a session authorizing `entity`, whose auth value is `auth_value`
    pub fn start(
        &self,
        scope: &mut HandleScope<'_>,
        entity: &NamedHandle,
        auth_value: &[u8],
        keys: SaltKeys<'_>,
    ) -> Result<AuthSession> {
        let missing = |what: &str| {
            TpmError::malformed(format!("{} session needs a loaded {what}", self.mode))
        };
        let key_source = match self.mode {
            HmacMode::Plain => SessionKeySource::Unsalted,
            HmacMode::SaltedByEk => {
                let (tpm_key, public) = keys.ek.ok_or_else(|| missing("endorsement key"))?;
                SessionKeySource::Salted { tpm_key, public }
            }
            HmacMode::SaltedByPrimary => {
                let (tpm_key, public) = keys.primary.ok_or_else(|| missing("primary key"))?;
                SessionKeySource::Salted { tpm_key, public }
            }
            HmacMode::Bound => SessionKeySource::Bound { entity, auth_value },
        };
        let session = scope
            .start_hmac(HmacSessionParams {
                hash_alg: self.hash_alg,
                nonce_size: self.nonce_size,
                auth_value,
                encryption: self.encryption,
                key_source,
            })
            .with_context(|| format!("failed to start {} HMAC session", self.mode))?;
        debug!(
            "started {} HMAC session 0x{:08x} ({:?})",
            self.mode, session.handle, self.encryption
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modes() {
        for mode in HmacMode::ALL {
            assert_eq!(mode.name().parse::<HmacMode>().unwrap(), mode);
        }
        assert!("salted".parse::<HmacMode>().is_err());
    }

    #[test]
    fn test_parse_encryption() {
        assert_eq!(
            "in-out".parse::<Encryption>().unwrap().0,
            ParameterEncryption::InOut
        );
        assert_eq!(
            "none".parse::<Encryption>().unwrap().0,
            ParameterEncryption::None
        );
        assert!("both".parse::<Encryption>().is_err());
    }
}
