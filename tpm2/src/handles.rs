// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Handle lifecycle management
//!
//! [`HandleScope`] records every handle allocated through it and flushes them
//! in reverse allocation order when the scope ends, on success and on error.
//! [`sweep`] recovers a pool left full by a crashed run.

use std::str::FromStr;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::commands::{CreatedPrimary, TpmContext};
use crate::constants::{TpmAlgId, TpmHt};
use crate::error::TpmError;
use crate::session::{AuthSession, Auth, HmacSessionParams};
use crate::types::{NamedHandle, Tpm2bSensitiveCreate, TpmtPublic};

/// Handle categories accepted by [`sweep`], keyed by their command-line name
pub static HANDLE_CATEGORIES: &[(&str, &[TpmHt])] = &[
    (
        "all",
        &[TpmHt::LOADED_SESSION, TpmHt::SAVED_SESSION, TpmHt::Transient],
    ),
    ("loaded", &[TpmHt::LOADED_SESSION]),
    ("saved", &[TpmHt::SAVED_SESSION]),
    ("transient", &[TpmHt::Transient]),
];

/// Which handles to force-release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SweepScope {
    #[default]
    All,
    Loaded,
    Saved,
    Transient,
}

impl SweepScope {
    pub fn name(self) -> &'static str {
        match self {
            SweepScope::All => "all",
            SweepScope::Loaded => "loaded",
            SweepScope::Saved => "saved",
            SweepScope::Transient => "transient",
        }
    }

    pub fn handle_types(self) -> &'static [TpmHt] {
        HANDLE_CATEGORIES
            .iter()
            .find(|(name, _)| *name == self.name())
            .map(|(_, types)| *types)
            .unwrap_or(&[])
    }
}

impl FromStr for SweepScope {
    type Err = TpmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(SweepScope::All),
            "loaded" => Ok(SweepScope::Loaded),
            "saved" => Ok(SweepScope::Saved),
            "transient" => Ok(SweepScope::Transient),
            other => Err(TpmError::malformed(format!(
                "unknown handle scope {:?}, expected one of: {}",
                other,
                HANDLE_CATEGORIES
                    .iter()
                    .map(|(name, _)| *name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

/// Flush every live handle in `scope`; returns how many were flushed
pub fn sweep(ctx: &mut TpmContext, scope: SweepScope) -> Result<usize> {
    let mut flushed = 0;
    for ht in scope.handle_types() {
        for handle in ctx.get_handles(*ht)? {
            ctx.flush_context(handle)?;
            flushed += 1;
        }
    }
    info!("swept {} {} handle(s)", flushed, scope.name());
    Ok(flushed)
}

/// Tracks handles allocated against one context and releases them in reverse
/// order on [`close`](Self::close) or drop.
pub struct HandleScope<'a> {
    ctx: &'a mut TpmContext,
    live: Vec<u32>,
}

impl<'a> HandleScope<'a> {
    pub fn new(ctx: &'a mut TpmContext) -> Self {
        Self {
            ctx,
            live: Vec::new(),
        }
    }

    /// The context, for commands that do not allocate handles
    pub fn tpm(&mut self) -> &mut TpmContext {
        self.ctx
    }

    /// Handles currently owed a release, oldest first
    pub fn live(&self) -> &[u32] {
        &self.live
    }

    /// Record a release obligation for `handle`
    pub fn acquire(&mut self, handle: u32) -> u32 {
        if !self.live.contains(&handle) {
            self.live.push(handle);
        }
        handle
    }

    /// Release `handle` now. Releasing a handle that is not (or no longer)
    /// tracked is a no-op.
    pub fn release(&mut self, handle: u32) -> Result<()> {
        let Some(pos) = self.live.iter().position(|h| *h == handle) else {
            return Ok(());
        };
        self.live.remove(pos);
        self.ctx.flush_context(handle)
    }

    pub fn create_primary(
        &mut self,
        hierarchy: u32,
        hierarchy_auth: Auth<'_>,
        template: &TpmtPublic,
        sensitive: &Tpm2bSensitiveCreate,
    ) -> Result<CreatedPrimary> {
        let primary = self
            .ctx
            .create_primary(hierarchy, hierarchy_auth, template, sensitive)?;
        self.acquire(primary.handle.handle);
        Ok(primary)
    }

    pub fn load(
        &mut self,
        parent: &NamedHandle,
        parent_auth: Auth<'_>,
        private: &[u8],
        public: &[u8],
    ) -> Result<NamedHandle> {
        let handle = self.ctx.load(parent, parent_auth, private, public)?;
        self.acquire(handle.handle);
        Ok(handle)
    }

    pub fn start_trial(&mut self, hash_alg: TpmAlgId) -> Result<AuthSession> {
        let session = AuthSession::start_trial(self.ctx, hash_alg)?;
        self.acquire(session.handle);
        Ok(session)
    }

    pub fn start_policy(&mut self, hash_alg: TpmAlgId, nonce_size: usize) -> Result<AuthSession> {
        let session = AuthSession::start_policy(self.ctx, hash_alg, nonce_size)?;
        self.acquire(session.handle);
        Ok(session)
    }

    pub fn start_hmac(&mut self, params: HmacSessionParams<'_>) -> Result<AuthSession> {
        let session = AuthSession::start_hmac(self.ctx, params)?;
        self.acquire(session.handle);
        Ok(session)
    }

    /// Flush a session and wipe its key material
    pub fn close_session(&mut self, session: AuthSession) -> Result<()> {
        self.release(session.handle)
    }

    /// Close `session` after the command it authorized produced `result`.
    ///
    /// If the command failed, its error is returned and a failure to flush
    /// the session is only logged.
    pub fn finish_session<T>(&mut self, session: AuthSession, result: Result<T>) -> Result<T> {
        let handle = session.handle;
        match (result, self.close_session(session)) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(flush)) => Err(flush),
            (Err(err), flushed) => {
                if let Err(flush) = flushed {
                    warn!("failed to flush session 0x{:08x}: {:#}", handle, flush);
                }
                Err(err)
            }
        }
    }

    /// Release everything still tracked, newest first. All handles are
    /// attempted; the first failure is returned.
    pub fn close(mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(handle) = self.live.pop() {
            if let Err(err) = self.ctx.flush_context(handle) {
                warn!("failed to flush handle 0x{:08x}: {:#}", handle, err);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err.context("failed to release TPM handles")),
            None => Ok(()),
        }
    }
}

impl Drop for HandleScope<'_> {
    fn drop(&mut self) {
        while let Some(handle) = self.live.pop() {
            match self.ctx.flush_context(handle) {
                Ok(()) => debug!("released handle 0x{:08x}", handle),
                Err(err) => warn!("failed to flush handle 0x{:08x}: {:#}", handle, err),
            }
        }
    }
}
