// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Sessions, authorization checks and the policy commands of the simulator

use anyhow::Result;
use tracing::trace;
use zeroize::Zeroizing;

use super::{OrRc, RcResult, Reply, Request, Simulator};
use crate::constants::*;
use crate::crypto;
use crate::marshal::*;
use crate::policy;
use crate::protect;
use crate::session::MIN_NONCE_SIZE;
use crate::types::*;

/// One entry of a command authorization area
pub(super) struct AuthEntry {
    handle: u32,
    nonce_caller: Vec<u8>,
    attrs: TpmaSa,
    hmac: Vec<u8>,
}

impl Unmarshal for AuthEntry {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            handle: buf.get_u32()?,
            nonce_caller: buf.get_tpm2b()?,
            attrs: TpmaSa(buf.get_u8()?),
            hmac: buf.get_tpm2b()?,
        })
    }
}

/// A loaded session
pub(super) struct Session {
    session_type: TpmSe,
    hash_alg: TpmAlgId,
    symmetric: TpmtSymDef,
    session_key: Zeroizing<Vec<u8>>,
    bind_name: Option<Vec<u8>>,
    nonce_tpm: Vec<u8>,
    policy_digest: Vec<u8>,
    /// PCR update counter seen by the last PolicyPCR
    pcr_counter: Option<u32>,
}

impl Session {
    fn uses_hmac(&self) -> bool {
        self.session_type == TpmSe::Hmac || !self.session_key.is_empty()
    }
}

/// What the module knows about the entity behind an authorized handle
struct Entity {
    name: Vec<u8>,
    auth_value: Vec<u8>,
    auth_policy: Vec<u8>,
    user_with_auth: bool,
    no_da: bool,
}

impl Entity {
    fn auth_fail(&self) -> TpmRc {
        if self.no_da {
            TpmRc::BadAuth
        } else {
            TpmRc::AuthFail
        }
    }
}

/// Authorization state carried from a command to its response
pub(super) struct Authorized {
    session: Option<u32>,
    hash_alg: TpmAlgId,
    symmetric: TpmtSymDef,
    session_value: Zeroizing<Vec<u8>>,
    nonce_caller: Vec<u8>,
    attrs: TpmaSa,
    uses_hmac: bool,
    is_policy: bool,
}

fn crypt_first_parameter(
    params: &mut [u8],
    auth: &Authorized,
    nonce_newer: &[u8],
    nonce_older: &[u8],
    encrypt: bool,
) -> Result<()> {
    if params.len() < 2 {
        return Ok(());
    }
    let size = u16::from_be_bytes([params[0], params[1]]) as usize;
    let Some(payload) = params.get_mut(2..2 + size) else {
        anyhow::bail!("first parameter overruns the parameter area");
    };
    let key_bytes = auth.symmetric.key_bits as usize / 8;
    let key = Zeroizing::new(crypto::kdfa(
        auth.hash_alg,
        &auth.session_value,
        "CFB",
        nonce_newer,
        nonce_older,
        (key_bytes + crypto::AES_BLOCK_SIZE) * 8,
    )?);
    let (aes_key, iv) = key.split_at(key_bytes);
    if encrypt {
        crypto::cfb_encrypt(&auth.symmetric, aes_key, iv, payload)
    } else {
        crypto::cfb_decrypt(&auth.symmetric, aes_key, iv, payload)
    }
}

impl Simulator {
    fn entity(&self, handle: u32) -> Option<Entity> {
        if let Some(object) = self.objects.get(&handle) {
            let attrs = object.public.object_attributes;
            return Some(Entity {
                name: object.name.clone(),
                auth_value: object.sensitive.auth_value.clone(),
                auth_policy: object.public.auth_policy.buffer.clone(),
                user_with_auth: attrs.contains(TpmaObject::USER_WITH_AUTH),
                no_da: attrs.contains(TpmaObject::NO_DA),
            });
        }
        let permanent = tpm_rh::is_hierarchy(handle) && handle != tpm_rh::NULL;
        if permanent || handle < PCR_COUNT {
            return Some(Entity {
                name: handle.to_be_bytes().to_vec(),
                auth_value: Vec::new(),
                auth_policy: Vec::new(),
                user_with_auth: true,
                no_da: false,
            });
        }
        None
    }

    /// Check every authorization of `request` and decrypt the first command
    /// parameter in place when a session asks for it.
    pub(super) fn authorize(
        &self,
        request: &Request,
        params: &mut [u8],
    ) -> RcResult<Vec<Authorized>> {
        let (_, auth_count) = request.cc.handle_layout();
        if !request.has_sessions {
            if auth_count > 0 {
                return Err(TpmRc::AuthMissing.to_u32());
            }
            return Ok(Vec::new());
        }
        if auth_count == 0 || request.auths.len() > auth_count {
            return Err(TpmRc::AuthContext.to_u32());
        }
        if request.auths.len() < auth_count {
            return Err(TpmRc::AuthMissing.to_u32());
        }

        let (cmd_encryptable, rsp_encryptable) = request.cc.encryptable_parameters();
        // cpHash covers the parameters as sent, before decryption
        let sent = params.to_vec();
        let cp_hash = |alg: TpmAlgId| -> RcResult<Vec<u8>> {
            let cc = request.cc.to_u32().to_be_bytes();
            let names: Vec<Vec<u8>> = request
                .handles
                .iter()
                .map(|h| self.handle_name(*h))
                .collect();
            let mut parts: Vec<&[u8]> = vec![cc.as_slice()];
            parts.extend(names.iter().map(Vec::as_slice));
            parts.push(&sent);
            crypto::hash(alg, &parts).or_rc(TpmRc::Hash.to_u32())
        };

        let mut authorized = Vec::with_capacity(request.auths.len());
        for (i, entry) in request.auths.iter().enumerate() {
            let n = i as u32 + 1;
            let entity = self
                .entity(request.handles[i])
                .or_rc(TpmRc::Handle.at_handle(n))?;

            if entry.handle == tpm_rh::PW {
                if entry.attrs.decrypt() || entry.attrs.encrypt() {
                    return Err(TpmRc::Attributes.at_session(n));
                }
                if !entity.user_with_auth {
                    return Err(TpmRc::AuthUnavailable.at_session(n));
                }
                if !crypto::ct_eq(&entry.hmac, &entity.auth_value) {
                    return Err(entity.auth_fail().at_session(n));
                }
                authorized.push(Authorized {
                    session: None,
                    hash_alg: TpmAlgId::Null,
                    symmetric: TpmtSymDef::null(),
                    session_value: Zeroizing::new(Vec::new()),
                    nonce_caller: Vec::new(),
                    attrs: TpmaSa::new().with_continue_session(),
                    uses_hmac: false,
                    is_policy: false,
                });
                continue;
            }

            let session = self
                .sessions
                .get(&entry.handle)
                .or_rc(TpmRc::Handle.at_session(n))?;
            match session.session_type {
                TpmSe::Trial => return Err(TpmRc::AuthType.at_session(n)),
                TpmSe::Policy => {
                    if let Some(counter) = session.pcr_counter {
                        if counter != self.pcrs.update_counter {
                            return Err(TpmRc::PcrChanged.at_session(n));
                        }
                    }
                    if entity.auth_policy.is_empty()
                        || !crypto::ct_eq(&session.policy_digest, &entity.auth_policy)
                    {
                        return Err(TpmRc::PolicyFail.at_session(n));
                    }
                }
                TpmSe::Hmac => {
                    if !entity.user_with_auth {
                        return Err(TpmRc::AuthUnavailable.at_session(n));
                    }
                }
            }

            let digest_size = session.hash_alg.digest_size();
            if entry.nonce_caller.len() < MIN_NONCE_SIZE || entry.nonce_caller.len() > digest_size
            {
                return Err(TpmRc::Size.at_session(n));
            }
            if (entry.attrs.decrypt() || entry.attrs.encrypt()) && session.symmetric.is_null() {
                return Err(TpmRc::Symmetric.at_session(n));
            }
            if (entry.attrs.decrypt() && !cmd_encryptable)
                || (entry.attrs.encrypt() && !rsp_encryptable)
            {
                return Err(TpmRc::Attributes.at_session(n));
            }

            let mut session_value = Zeroizing::new(session.session_key.to_vec());
            let bound_here = session.bind_name.as_deref() == Some(entity.name.as_slice());
            if session.session_type == TpmSe::Hmac && !bound_here {
                session_value.extend_from_slice(&entity.auth_value);
            }

            if session.uses_hmac() {
                let cp = cp_hash(session.hash_alg)?;
                let expected = crypto::hmac(
                    session.hash_alg,
                    &session_value,
                    &[&cp, &entry.nonce_caller, &session.nonce_tpm, &[entry.attrs.0]],
                )
                .or_rc(TpmRc::Hash.to_u32())?;
                if !crypto::ct_eq(&expected, &entry.hmac) {
                    return Err(entity.auth_fail().at_session(n));
                }
            }

            authorized.push(Authorized {
                session: Some(entry.handle),
                hash_alg: session.hash_alg,
                symmetric: session.symmetric,
                session_value,
                nonce_caller: entry.nonce_caller.clone(),
                attrs: entry.attrs,
                uses_hmac: session.uses_hmac(),
                is_policy: session.session_type == TpmSe::Policy,
            });
        }

        for (i, auth) in authorized.iter().enumerate() {
            if !auth.attrs.decrypt() {
                continue;
            }
            let nonce_tpm = auth
                .session
                .and_then(|h| self.sessions.get(&h))
                .map(|s| s.nonce_tpm.as_slice())
                .unwrap_or_default();
            crypt_first_parameter(params, auth, &auth.nonce_caller, nonce_tpm, false)
                .or_rc(TpmRc::Size.at_session(i as u32 + 1))?;
        }

        Ok(authorized)
    }

    /// Roll nonces, encrypt the first response parameter and build the
    /// response authorization area.
    pub(super) fn respond(
        &mut self,
        request: &Request,
        authorized: Vec<Authorized>,
        mut params: Vec<u8>,
    ) -> RcResult<(Vec<u8>, Vec<u8>)> {
        let mut new_nonces = Vec::with_capacity(authorized.len());
        for auth in &authorized {
            let nonce = match auth.session {
                Some(_) => self.random_bytes(auth.nonce_caller.len()),
                None => Vec::new(),
            };
            new_nonces.push(nonce);
        }

        for (auth, nonce_tpm) in authorized.iter().zip(&new_nonces) {
            if auth.attrs.encrypt() {
                crypt_first_parameter(&mut params, auth, nonce_tpm, &auth.nonce_caller, true)
                    .or_rc(TpmRc::Failure.to_u32())?;
            }
        }

        let rp_hash = |alg: TpmAlgId| -> RcResult<Vec<u8>> {
            crypto::hash(
                alg,
                &[
                    &0u32.to_be_bytes(),
                    &request.cc.to_u32().to_be_bytes(),
                    &params,
                ],
            )
            .or_rc(TpmRc::Hash.to_u32())
        };

        let mut area = CommandBuffer::new();
        for (auth, nonce_tpm) in authorized.iter().zip(&new_nonces) {
            let Some(handle) = auth.session else {
                area.put_tpm2b_empty();
                area.put_u8(TpmaSa::CONTINUE_SESSION);
                area.put_tpm2b_empty();
                continue;
            };
            let hmac = if auth.uses_hmac {
                let rp = rp_hash(auth.hash_alg)?;
                crypto::hmac(
                    auth.hash_alg,
                    &auth.session_value,
                    &[&rp, nonce_tpm, &auth.nonce_caller, &[auth.attrs.0]],
                )
                .or_rc(TpmRc::Hash.to_u32())?
            } else {
                Vec::new()
            };
            area.put_tpm2b(nonce_tpm);
            area.put_u8(auth.attrs.0);
            area.put_tpm2b(&hmac);

            if !auth.attrs.continue_session() {
                self.sessions.remove(&handle);
                trace!("simulator closed session 0x{:08x}", handle);
            } else if let Some(session) = self.sessions.get_mut(&handle) {
                session.nonce_tpm = nonce_tpm.clone();
                // A satisfied policy is consumed by the command it authorized
                if auth.is_policy {
                    session.policy_digest = policy::empty_policy(session.hash_alg);
                    session.pcr_counter = None;
                }
            }
        }

        Ok((params, area.into_vec()))
    }

    pub(super) fn start_auth_session(
        &mut self,
        handles: &[u32],
        buf: &mut ResponseBuffer,
    ) -> RcResult<Reply> {
        let (tpm_key, bind) = (handles[0], handles[1]);
        let nonce_caller = buf.get_tpm2b().or_rc(TpmRc::Size.at_parameter(1))?;
        let encrypted_salt = buf.get_tpm2b().or_rc(TpmRc::Size.at_parameter(2))?;
        let session_type = buf.get_u8().or_rc(TpmRc::Size.at_parameter(3))?;
        let symmetric = TpmtSymDef::unmarshal(buf).or_rc(TpmRc::Symmetric.at_parameter(4))?;
        let auth_hash = buf.get_u16().or_rc(TpmRc::Size.at_parameter(5))?;

        let session_type = TpmSe::from_u8(session_type).or_rc(TpmRc::Value.at_parameter(3))?;
        let hash_alg = TpmAlgId::from_u16(auth_hash)
            .filter(|alg| alg.is_hash())
            .or_rc(TpmRc::Hash.at_parameter(5))?;
        if !symmetric.is_null() && symmetric != TpmtSymDef::aes_128_cfb() {
            return Err(TpmRc::Symmetric.at_parameter(4));
        }
        let digest_size = hash_alg.digest_size();
        if nonce_caller.len() < MIN_NONCE_SIZE || nonce_caller.len() > digest_size {
            return Err(TpmRc::Size.at_parameter(1));
        }
        if self.sessions.len() >= self.config.max_sessions {
            return Err(TpmRc::SessionHandles.to_u32());
        }

        let mut key_material = Zeroizing::new(Vec::new());
        if bind != tpm_rh::NULL {
            let entity = self.entity(bind).or_rc(TpmRc::Handle.at_handle(2))?;
            key_material.extend_from_slice(&entity.auth_value);
        }
        if tpm_key != tpm_rh::NULL {
            let key = self.objects.get(&tpm_key).or_rc(TpmRc::Handle.at_handle(1))?;
            let secret = key.ecc_key.as_ref().or_rc(TpmRc::Key.at_handle(1))?;
            if !key.public.object_attributes.contains(TpmaObject::DECRYPT) {
                return Err(TpmRc::Attributes.at_handle(1));
            }
            if encrypted_salt.is_empty() {
                return Err(TpmRc::Value.at_parameter(2));
            }
            let salt = protect::recover_seed(
                secret,
                &key.public,
                protect::SECRET_LABEL,
                &encrypted_salt,
            )
            .or_rc(TpmRc::EccPoint.at_parameter(2))?;
            key_material.extend_from_slice(&salt);
        } else if !encrypted_salt.is_empty() {
            return Err(TpmRc::Value.at_parameter(2));
        }

        let nonce_tpm = self.random_bytes(nonce_caller.len());
        let session_key = if tpm_key == tpm_rh::NULL && bind == tpm_rh::NULL {
            Zeroizing::new(Vec::new())
        } else {
            Zeroizing::new(
                crypto::kdfa(
                    hash_alg,
                    &key_material,
                    "ATH",
                    &nonce_tpm,
                    &nonce_caller,
                    digest_size * 8,
                )
                .or_rc(TpmRc::Failure.to_u32())?,
            )
        };

        self.next_session += 1;
        let ht = match session_type {
            TpmSe::Hmac => TpmHt::HmacSession,
            TpmSe::Policy | TpmSe::Trial => TpmHt::PolicySession,
        };
        let handle = ht.first() | self.next_session;
        let bind_name = (bind != tpm_rh::NULL).then(|| self.handle_name(bind));
        self.sessions.insert(
            handle,
            Session {
                session_type,
                hash_alg,
                symmetric,
                session_key,
                bind_name,
                nonce_tpm: nonce_tpm.clone(),
                policy_digest: policy::empty_policy(hash_alg),
                pcr_counter: None,
            },
        );
        trace!("simulator started session 0x{:08x}", handle);

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&nonce_tpm);
        Ok(Reply {
            handles: vec![handle],
            params: out.into_vec(),
        })
    }

    fn policy_session(&mut self, handle: u32, n: u32) -> RcResult<&mut Session> {
        match self.sessions.get_mut(&handle) {
            Some(s) if s.session_type != TpmSe::Hmac => Ok(s),
            _ => Err(TpmRc::Handle.at_handle(n)),
        }
    }

    pub(super) fn policy_pcr(&mut self, handles: &[u32], buf: &mut ResponseBuffer) -> RcResult<Reply> {
        let expected = buf.get_tpm2b().or_rc(TpmRc::Size.at_parameter(1))?;
        let selection = TpmlPcrSelection::unmarshal(buf).or_rc(TpmRc::Size.at_parameter(2))?;
        for (bank, index) in selection.iter_selected() {
            if self.pcrs.value(bank, index).is_none() {
                return Err(TpmRc::Value.at_parameter(2));
            }
        }

        let (hash_alg, is_trial) = {
            let session = self.policy_session(handles[0], 1)?;
            (session.hash_alg, session.session_type == TpmSe::Trial)
        };
        let live = self.pcr_selection_digest(hash_alg, &selection, TpmRc::Value.at_parameter(2))?;
        let counter = self.pcrs.update_counter;

        let pcr_digest = if is_trial {
            if expected.is_empty() {
                live
            } else {
                expected
            }
        } else {
            if !expected.is_empty() && !crypto::ct_eq(&expected, &live) {
                return Err(TpmRc::Value.at_parameter(1));
            }
            live
        };

        let session = self.policy_session(handles[0], 1)?;
        if !is_trial {
            if let Some(seen) = session.pcr_counter {
                if seen != counter {
                    return Err(TpmRc::PcrChanged.to_u32());
                }
            }
            session.pcr_counter = Some(counter);
        }
        session.policy_digest =
            policy::pcr_policy_digest(hash_alg, &session.policy_digest, &selection, &pcr_digest)
                .or_rc(TpmRc::Hash.to_u32())?;
        Ok(Reply::default())
    }

    pub(super) fn policy_secret(
        &mut self,
        handles: &[u32],
        buf: &mut ResponseBuffer,
    ) -> RcResult<Reply> {
        let nonce_tpm = buf.get_tpm2b().or_rc(TpmRc::Size.at_parameter(1))?;
        let _cp_hash_a = buf.get_tpm2b().or_rc(TpmRc::Size.at_parameter(2))?;
        let policy_ref = buf.get_tpm2b().or_rc(TpmRc::Size.at_parameter(3))?;
        let _expiration = buf.get_i32().or_rc(TpmRc::Size.at_parameter(4))?;

        let auth_name = self.handle_name(handles[0]);
        let session = self.policy_session(handles[1], 2)?;
        if !nonce_tpm.is_empty() && nonce_tpm != session.nonce_tpm {
            return Err(TpmRc::Value.at_parameter(1));
        }
        session.policy_digest = policy::secret_policy_digest(
            session.hash_alg,
            &session.policy_digest,
            &auth_name,
            &policy_ref,
        )
        .or_rc(TpmRc::Hash.to_u32())?;

        let mut out = CommandBuffer::new();
        // timeout
        out.put_tpm2b_empty();
        // policyTicket
        TpmtTkAuth::null(TpmSt::AuthSecret).marshal(&mut out);
        Ok(Reply::params(out))
    }

    pub(super) fn policy_get_digest(&mut self, handles: &[u32]) -> RcResult<Reply> {
        let session = self.policy_session(handles[0], 1)?;
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&session.policy_digest);
        Ok(Reply::params(out))
    }
}
