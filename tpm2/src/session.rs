// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 session management
//!
//! Trial, policy and HMAC sessions. HMAC sessions may be salted with an ECC
//! key loaded in the TPM, bound to an entity, and may encrypt the first
//! command and/or response parameter with AES-CFB.

use std::fmt;

use anyhow::{bail, Context, Result};
use rand::RngCore;
use tracing::debug;
use zeroize::Zeroizing;

use super::commands::TpmContext;
use super::constants::*;
use super::crypto;
use super::device::*;
use super::error::TpmError;
use super::marshal::*;
use super::protect;
use super::types::*;

/// Smallest nonce the TPM accepts for a session
pub const MIN_NONCE_SIZE: usize = 16;

/// Which parameters an HMAC session encrypts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterEncryption {
    #[default]
    None,
    /// Encrypt the first command parameter (TPMA_SESSION.decrypt)
    In,
    /// Encrypt the first response parameter (TPMA_SESSION.encrypt)
    Out,
    InOut,
}

impl ParameterEncryption {
    fn encrypts_command(self) -> bool {
        matches!(self, ParameterEncryption::In | ParameterEncryption::InOut)
    }

    fn encrypts_response(self) -> bool {
        matches!(self, ParameterEncryption::Out | ParameterEncryption::InOut)
    }
}

/// How the session key of an HMAC session is established
#[derive(Clone, Copy)]
pub enum SessionKeySource<'a> {
    /// No salt, no bind: the session key is empty and only the entity's
    /// authorization value keys the HMAC
    Unsalted,
    /// A salt encrypted to an ECC decryption key loaded in the TPM
    Salted {
        tpm_key: &'a NamedHandle,
        public: &'a TpmtPublic,
    },
    /// Bound to an entity whose authorization value is mixed into the key
    Bound {
        entity: &'a NamedHandle,
        auth_value: &'a [u8],
    },
}

/// Parameters for [`AuthSession::start_hmac`]
#[derive(Clone, Copy)]
pub struct HmacSessionParams<'a> {
    pub hash_alg: TpmAlgId,
    pub nonce_size: usize,
    /// Authorization value of the entity this session will authorize
    pub auth_value: &'a [u8],
    pub encryption: ParameterEncryption,
    pub key_source: SessionKeySource<'a>,
}

/// Authorization session handle
pub struct AuthSession {
    pub handle: u32,
    pub session_type: TpmSe,
    pub hash_alg: TpmAlgId,
    symmetric: TpmtSymDef,
    encryption: ParameterEncryption,
    session_key: Zeroizing<Vec<u8>>,
    auth_value: Zeroizing<Vec<u8>>,
    bound_to: Option<Vec<u8>>,
    nonce_size: usize,
    nonce_caller: Vec<u8>,
    nonce_tpm: Vec<u8>,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("handle", &format_args!("0x{:08x}", self.handle))
            .field("session_type", &self.session_type)
            .field("hash_alg", &self.hash_alg)
            .field("encryption", &self.encryption)
            .field("salted_or_bound", &!self.session_key.is_empty())
            .finish()
    }
}

struct StartParams<'a> {
    session_type: TpmSe,
    hash_alg: TpmAlgId,
    nonce_size: usize,
    key_source: SessionKeySource<'a>,
    symmetric: TpmtSymDef,
}

impl AuthSession {
    fn start(ctx: &mut TpmContext, params: StartParams<'_>) -> Result<Self> {
        let StartParams {
            session_type,
            hash_alg,
            nonce_size,
            key_source,
            symmetric,
        } = params;

        let digest_size = hash_alg.digest_size();
        if digest_size == 0 {
            bail!(TpmError::malformed(format!(
                "session hash must be a digest algorithm, got {:?}",
                hash_alg
            )));
        }
        if !(MIN_NONCE_SIZE..=digest_size).contains(&nonce_size) {
            bail!(TpmError::malformed(format!(
                "nonce size {} outside [{}, {}] for {:?}",
                nonce_size, MIN_NONCE_SIZE, digest_size, hash_alg
            )));
        }

        let mut rng = rand::thread_rng();
        let mut nonce_caller = vec![0u8; nonce_size];
        rng.fill_bytes(&mut nonce_caller);

        let mut tpm_key = NamedHandle::permanent(tpm_rh::NULL);
        let mut bind = NamedHandle::permanent(tpm_rh::NULL);
        let mut encrypted_salt = Vec::new();
        let mut key_material = Zeroizing::new(Vec::new());
        let mut bound_to = None;

        match key_source {
            SessionKeySource::Unsalted => {}
            SessionKeySource::Salted {
                tpm_key: key,
                public,
            } => {
                let (salt, encrypted) = protect::create_seed(public, protect::SECRET_LABEL, &mut rng)
                    .context("failed to salt session")?;
                key_material.extend_from_slice(&salt);
                encrypted_salt = encrypted;
                tpm_key = key.clone();
            }
            SessionKeySource::Bound { entity, auth_value } => {
                key_material.extend_from_slice(auth_value);
                bind = entity.clone();
                bound_to = Some(entity.name.clone());
            }
        }

        let mut cmd = TpmCommand::new(TpmCc::StartAuthSession);
        // tpmKey
        cmd.add_named_handle(&tpm_key);
        // bind
        cmd.add_named_handle(&bind);
        // nonceCaller
        cmd.add_tpm2b(&nonce_caller);
        // encryptedSalt
        cmd.add_tpm2b(&encrypted_salt);
        // sessionType
        cmd.add_u8(session_type as u8);
        // symmetric
        cmd.add(&symmetric);
        // authHash
        cmd.add_u16(hash_alg.to_u16());

        let parts = ctx
            .execute(cmd)
            .context("failed to start authorization session")?;
        let handle = *parts
            .handles
            .first()
            .context("StartAuthSession returned no handle")?;
        let nonce_tpm = ResponseBuffer::new(&parts.parameters).get_tpm2b()?;

        let session_key = if tpm_key.handle == tpm_rh::NULL && bind.handle == tpm_rh::NULL {
            Zeroizing::new(Vec::new())
        } else {
            Zeroizing::new(crypto::kdfa(
                hash_alg,
                &key_material,
                "ATH",
                &nonce_tpm,
                &nonce_caller,
                digest_size * 8,
            )?)
        };

        debug!(
            "started {:?} session 0x{:08x} ({:?})",
            session_type, handle, hash_alg
        );
        Ok(Self {
            handle,
            session_type,
            hash_alg,
            symmetric,
            encryption: ParameterEncryption::None,
            session_key,
            auth_value: Zeroizing::new(Vec::new()),
            bound_to,
            nonce_size,
            nonce_caller,
            nonce_tpm,
        })
    }

    /// Start a policy session
    pub fn start_policy(ctx: &mut TpmContext, hash_alg: TpmAlgId, nonce_size: usize) -> Result<Self> {
        Self::start(
            ctx,
            StartParams {
                session_type: TpmSe::Policy,
                hash_alg,
                nonce_size,
                key_source: SessionKeySource::Unsalted,
                symmetric: TpmtSymDef::null(),
            },
        )
    }

    /// Start a trial policy session (for computing policy digest)
    pub fn start_trial(ctx: &mut TpmContext, hash_alg: TpmAlgId) -> Result<Self> {
        Self::start(
            ctx,
            StartParams {
                session_type: TpmSe::Trial,
                hash_alg,
                nonce_size: MIN_NONCE_SIZE,
                key_source: SessionKeySource::Unsalted,
                symmetric: TpmtSymDef::null(),
            },
        )
    }

    /// Start an HMAC session for an entity with the given authorization value
    pub fn start_hmac(ctx: &mut TpmContext, params: HmacSessionParams<'_>) -> Result<Self> {
        let symmetric = if params.encryption == ParameterEncryption::None {
            TpmtSymDef::null()
        } else {
            TpmtSymDef::aes_128_cfb()
        };
        let mut session = Self::start(
            ctx,
            StartParams {
                session_type: TpmSe::Hmac,
                hash_alg: params.hash_alg,
                nonce_size: params.nonce_size,
                key_source: params.key_source,
                symmetric,
            },
        )?;
        session.encryption = params.encryption;
        session.auth_value = Zeroizing::new(params.auth_value.to_vec());
        Ok(session)
    }

    pub fn is_trial(&self) -> bool {
        self.session_type == TpmSe::Trial
    }

    /// The derived session key; empty for unsalted, unbound sessions
    pub fn session_key(&self) -> &[u8] {
        &self.session_key
    }

    pub fn encryption(&self) -> ParameterEncryption {
        self.encryption
    }

    /// Assert PCR state. With `pcr_digest` the TPM checks the live PCRs
    /// against it (a trial session just records it); without, the live
    /// values are folded into the policy.
    pub fn policy_pcr(
        &mut self,
        ctx: &mut TpmContext,
        pcr_digest: Option<&[u8]>,
        pcr_selection: &TpmlPcrSelection,
    ) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::PolicyPcr);

        // policySession
        cmd.add_handle(self.handle);
        // pcrDigest
        cmd.add_tpm2b(pcr_digest.unwrap_or_default());
        // pcrs
        cmd.add(pcr_selection);

        ctx.execute(cmd).context("PolicyPCR failed")?;
        Ok(())
    }

    /// Assert knowledge of `auth_entity`'s authorization
    pub fn policy_secret(
        &mut self,
        ctx: &mut TpmContext,
        auth_entity: &NamedHandle,
        auth: Auth<'_>,
    ) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::PolicySecret);
        // authHandle
        cmd.add_named_handle(auth_entity);
        // policySession
        cmd.add_handle(self.handle);
        // nonceTPM (empty: not bound to this session's nonce)
        cmd.add_tpm2b_empty();
        // cpHashA
        cmd.add_tpm2b_empty();
        // policyRef
        cmd.add_tpm2b_empty();
        // expiration
        cmd.add_i32(0);

        ctx.execute_authorized(cmd, &mut [auth])
            .context("PolicySecret failed")?;
        Ok(())
    }

    /// Get the current policy digest
    pub fn get_digest(&self, ctx: &mut TpmContext) -> Result<Vec<u8>> {
        let mut cmd = TpmCommand::new(TpmCc::PolicyGetDigest);
        cmd.add_handle(self.handle);

        let parts = ctx.execute(cmd).context("PolicyGetDigest failed")?;
        ResponseBuffer::new(&parts.parameters).get_tpm2b()
    }

    /// Flush (close) this session; key material is wiped on drop
    pub fn flush(self, ctx: &mut TpmContext) -> Result<()> {
        ctx.flush_context(self.handle)
    }

    /// HMAC key for authorizing `entity_name`
    fn session_value(&self, entity_name: &[u8]) -> Zeroizing<Vec<u8>> {
        let mut value = Zeroizing::new(self.session_key.to_vec());
        let bound_here = self.bound_to.as_deref() == Some(entity_name);
        if self.session_type == TpmSe::Hmac && !bound_here {
            value.extend_from_slice(&self.auth_value);
        }
        value
    }

    fn uses_hmac(&self) -> bool {
        match self.session_type {
            TpmSe::Hmac => true,
            TpmSe::Policy | TpmSe::Trial => !self.session_key.is_empty(),
        }
    }

    fn refresh_nonce(&mut self) {
        let mut nonce = vec![0u8; self.nonce_size];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.nonce_caller = nonce;
    }

    /// AES-CFB key and IV for parameter encryption
    fn cfb_key(
        &self,
        session_value: &[u8],
        nonce_newer: &[u8],
        nonce_older: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let key_bits = self.symmetric.key_bits as usize;
        Ok(Zeroizing::new(crypto::kdfa(
            self.hash_alg,
            session_value,
            "CFB",
            nonce_newer,
            nonce_older,
            key_bits + crypto::AES_BLOCK_SIZE * 8,
        )?))
    }
}

/// Authorization for one handle of a command
pub enum Auth<'a> {
    /// Password authorization (TPM_RS_PW); an empty slice is the null auth
    Password(&'a [u8]),
    Session(&'a mut AuthSession),
}

impl Auth<'static> {
    /// Empty password authorization
    pub fn null() -> Self {
        Auth::Password(&[])
    }
}

/// Apply AES-CFB to the payload of the TPM2B at the start of `params`
fn crypt_first_parameter(
    params: &mut [u8],
    sym: &TpmtSymDef,
    key: &[u8],
    encrypt: bool,
) -> Result<()> {
    if params.len() < 2 {
        return Ok(());
    }
    let size = u16::from_be_bytes([params[0], params[1]]) as usize;
    let Some(payload) = params.get_mut(2..2 + size) else {
        bail!(TpmError::integrity("first parameter overruns the parameter area"));
    };
    let key_len = sym.key_bits as usize / 8;
    let (aes_key, iv) = key.split_at(key_len);
    if encrypt {
        crypto::cfb_encrypt(sym, aes_key, iv, payload)
    } else {
        crypto::cfb_decrypt(sym, aes_key, iv, payload)
    }
}

fn cp_hash(alg: TpmAlgId, cc: TpmCc, handles: &[NamedHandle], params: &[u8]) -> Result<Vec<u8>> {
    let cc_bytes = cc.to_u32().to_be_bytes();
    let mut parts: Vec<&[u8]> = vec![cc_bytes.as_slice()];
    for h in handles {
        parts.push(&h.name);
    }
    parts.push(params);
    crypto::hash(alg, &parts)
}

fn rp_hash(alg: TpmAlgId, cc: TpmCc, params: &[u8]) -> Result<Vec<u8>> {
    crypto::hash(
        alg,
        &[&0u32.to_be_bytes(), &cc.to_u32().to_be_bytes(), params],
    )
}

/// Run a command that carries an authorization area, one entry per
/// authorized handle, verifying the response authorizations and decrypting
/// the response parameters.
pub(crate) fn run_authorized(
    device: &mut TpmDevice,
    cmd: TpmCommand,
    auths: &mut [Auth<'_>],
) -> Result<ResponseParts> {
    let cc = cmd.code();
    let (_, auth_handles) = cc.handle_layout();
    if auths.len() != auth_handles {
        bail!(
            "{} needs {} authorizations, {} given",
            cc,
            auth_handles,
            auths.len()
        );
    }
    let (cmd_encryptable, rsp_encryptable) = cc.encryptable_parameters();
    let handles = cmd.handles().to_vec();
    let mut params = cmd.params().to_vec();

    for auth in auths.iter_mut() {
        if let Auth::Session(session) = auth {
            if session.is_trial() {
                debug!("trial session 0x{:08x} used for authorization", session.handle);
            }
            session.refresh_nonce();
        }
    }

    // Command parameter encryption: at most one session may decrypt
    let mut decrypt_session = None;
    let mut encrypt_session = None;
    for (i, auth) in auths.iter().enumerate() {
        if let Auth::Session(session) = auth {
            if cmd_encryptable && session.encryption.encrypts_command() && decrypt_session.is_none()
            {
                decrypt_session = Some(i);
            }
            if rsp_encryptable && session.encryption.encrypts_response() && encrypt_session.is_none()
            {
                encrypt_session = Some(i);
            }
        }
    }
    if let Some(i) = decrypt_session {
        if let Auth::Session(session) = &auths[i] {
            let value = session.session_value(&handles[i].name);
            let key = session.cfb_key(&value, &session.nonce_caller, &session.nonce_tpm)?;
            crypt_first_parameter(&mut params, &session.symmetric, &key, true)?;
        }
    }

    let mut auth_area = CommandBuffer::new();
    for (i, auth) in auths.iter().enumerate() {
        match auth {
            Auth::Password(password) => {
                auth_area.put_u32(tpm_rh::PW);
                auth_area.put_tpm2b_empty();
                auth_area.put_u8(TpmaSa::CONTINUE_SESSION);
                auth_area.put_tpm2b(password);
            }
            Auth::Session(session) => {
                let mut attrs = TpmaSa::new().with_continue_session();
                if decrypt_session == Some(i) {
                    attrs = attrs.with_decrypt();
                }
                if encrypt_session == Some(i) {
                    attrs = attrs.with_encrypt();
                }
                let hmac = if session.uses_hmac() {
                    let cp = cp_hash(session.hash_alg, cc, &handles, &params)?;
                    let key = session.session_value(&handles[i].name);
                    crypto::hmac(
                        session.hash_alg,
                        &key,
                        &[&cp, &session.nonce_caller, &session.nonce_tpm, &[attrs.0]],
                    )?
                } else {
                    Vec::new()
                };
                auth_area.put_u32(session.handle);
                auth_area.put_tpm2b(&session.nonce_caller);
                auth_area.put_u8(attrs.0);
                auth_area.put_tpm2b(&hmac);
            }
        }
    }

    let bytes = cmd.finalize_with_auth(&params, &auth_area)?;
    let response = device.execute(&bytes)?;
    let mut parts = response.split(cc)?;

    let mut rsp_auth = ResponseBuffer::new(&parts.auth_area);
    for (i, auth) in auths.iter_mut().enumerate() {
        let nonce_tpm = rsp_auth.get_tpm2b()?;
        let attrs = rsp_auth.get_u8()?;
        let hmac = rsp_auth.get_tpm2b()?;
        let Auth::Session(session) = auth else {
            continue;
        };
        session.nonce_tpm = nonce_tpm;
        if session.uses_hmac() {
            let rp = rp_hash(session.hash_alg, cc, &parts.parameters)?;
            let key = session.session_value(&handles[i].name);
            let expected = crypto::hmac(
                session.hash_alg,
                &key,
                &[&rp, &session.nonce_tpm, &session.nonce_caller, &[attrs]],
            )?;
            if !crypto::ct_eq(&expected, &hmac) {
                bail!(TpmError::integrity(format!(
                    "response HMAC mismatch for {} on session 0x{:08x}",
                    cc, session.handle
                )));
            }
        }
    }

    if let Some(i) = encrypt_session {
        if let Auth::Session(session) = &auths[i] {
            let value = session.session_value(&handles[i].name);
            let key = session.cfb_key(&value, &session.nonce_tpm, &session.nonce_caller)?;
            crypt_first_parameter(&mut parts.parameters, &session.symmetric, &key, false)?;
        }
    }

    Ok(parts)
}
