// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! In-process TPM 2.0 simulator
//!
//! A deterministic software module implementing the command subset this
//! crate issues. It speaks the same wire format as a device, so everything
//! above [`Transport`] runs unchanged against it. Primary keys are derived
//! from fixed per-hierarchy seeds, which makes runs reproducible.

mod auth;
mod objects;

use std::collections::BTreeMap;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, trace};

use crate::constants::*;
use crate::crypto;
use crate::device::{Transport, TPM_HEADER_SIZE};
use crate::marshal::*;
use crate::types::*;

use auth::{AuthEntry, Session};
use objects::Object;

/// Default simulator seed
pub const SIMULATOR_SEED: u64 = 1073741825;

/// PCR_Read returns at most this many digests per call, like real modules
const MAX_PCR_READ_DIGESTS: usize = 8;

/// Simulator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatorConfig {
    /// Seed for hierarchy seeds and the simulator's random number generator
    pub seed: u64,
    /// Transient object slots
    pub max_objects: usize,
    /// Loaded session slots
    pub max_sessions: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: SIMULATOR_SEED,
            max_objects: 3,
            max_sessions: 3,
        }
    }
}

/// A response code with its parameter/handle/session number already encoded
type RcResult<T> = std::result::Result<T, u32>;

trait OrRc<T> {
    fn or_rc(self, rc: u32) -> RcResult<T>;
}

impl<T, E> OrRc<T> for std::result::Result<T, E> {
    fn or_rc(self, rc: u32) -> RcResult<T> {
        self.map_err(|_| rc)
    }
}

impl<T> OrRc<T> for Option<T> {
    fn or_rc(self, rc: u32) -> RcResult<T> {
        self.ok_or(rc)
    }
}

/// A decoded command
struct Request {
    cc: TpmCc,
    handles: Vec<u32>,
    auths: Vec<AuthEntry>,
    params: Vec<u8>,
    has_sessions: bool,
}

/// Output of a command body
#[derive(Default)]
struct Reply {
    handles: Vec<u32>,
    params: Vec<u8>,
}

impl Reply {
    fn params(params: CommandBuffer) -> Self {
        Self {
            handles: Vec::new(),
            params: params.into_vec(),
        }
    }
}

struct PcrBanks {
    sha1: Vec<Vec<u8>>,
    sha256: Vec<Vec<u8>>,
    update_counter: u32,
}

impl PcrBanks {
    fn new() -> Self {
        Self {
            sha1: vec![vec![0u8; TpmAlgId::Sha1.digest_size()]; PCR_COUNT as usize],
            sha256: vec![vec![0u8; TpmAlgId::Sha256.digest_size()]; PCR_COUNT as usize],
            update_counter: 0,
        }
    }

    fn bank(&self, alg: TpmAlgId) -> Option<&[Vec<u8>]> {
        match alg {
            TpmAlgId::Sha1 => Some(&self.sha1),
            TpmAlgId::Sha256 => Some(&self.sha256),
            _ => None,
        }
    }

    fn value(&self, alg: TpmAlgId, index: u32) -> Option<&[u8]> {
        self.bank(alg)?.get(index as usize).map(Vec::as_slice)
    }

    fn extend(&mut self, alg: TpmAlgId, index: u32, digest: &[u8]) -> Result<()> {
        let bank = match alg {
            TpmAlgId::Sha1 => &mut self.sha1,
            TpmAlgId::Sha256 => &mut self.sha256,
            // Banks this module does not implement are ignored
            _ => return Ok(()),
        };
        if let Some(value) = bank.get_mut(index as usize) {
            let extended = crypto::hash(alg, &[value.as_slice(), digest])?;
            *value = extended;
        }
        Ok(())
    }
}

/// Deterministic software TPM
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
    hierarchy_seeds: BTreeMap<u32, [u8; 32]>,
    objects: BTreeMap<u32, Object>,
    sessions: BTreeMap<u32, Session>,
    next_object: u32,
    next_session: u32,
    pcrs: PcrBanks,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut hierarchy_seeds = BTreeMap::new();
        for hierarchy in [
            tpm_rh::OWNER,
            tpm_rh::ENDORSEMENT,
            tpm_rh::PLATFORM,
            tpm_rh::NULL,
        ] {
            let mut seed = [0u8; 32];
            rng.fill_bytes(&mut seed);
            hierarchy_seeds.insert(hierarchy, seed);
        }
        debug!(
            "simulator started (seed {}, {} object slots, {} session slots)",
            config.seed, config.max_objects, config.max_sessions
        );
        Self {
            config,
            rng,
            hierarchy_seeds,
            objects: BTreeMap::new(),
            sessions: BTreeMap::new(),
            next_object: 0,
            next_session: 0,
            pcrs: PcrBanks::new(),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    fn random_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut v = vec![0u8; len];
        self.rng.fill_bytes(&mut v);
        v
    }

    /// Process one marshalled command and return the marshalled response
    pub fn process(&mut self, command: &[u8]) -> Vec<u8> {
        match self.dispatch(command) {
            Ok(response) => response,
            Err(rc) => {
                trace!("simulator command failed with 0x{:03x}", rc);
                encode_error(rc)
            }
        }
    }

    fn dispatch(&mut self, command: &[u8]) -> RcResult<Vec<u8>> {
        let request = parse_request(command)?;
        let mut params = request.params.clone();
        let authorized = self.authorize(&request, &mut params)?;
        let reply = self.execute(request.cc, &request.handles, &params)?;
        let (params, auth_area) = self.respond(&request, authorized, reply.params)?;

        let mut out = CommandBuffer::new();
        let tag = if request.has_sessions {
            TpmSt::Sessions
        } else {
            TpmSt::NoSessions
        };
        out.put_u16(tag.to_u16());
        out.put_u32(0);
        out.put_u32(TpmRc::Success.to_u32());
        for handle in reply.handles {
            out.put_u32(handle);
        }
        if request.has_sessions {
            out.put_u32(params.len() as u32);
            out.put_bytes(&params);
            out.put_bytes(&auth_area);
        } else {
            out.put_bytes(&params);
        }
        let size = out.len() as u32;
        out.update_u32(2, size);
        Ok(out.into_vec())
    }

    fn execute(&mut self, cc: TpmCc, handles: &[u32], params: &[u8]) -> RcResult<Reply> {
        let mut buf = ResponseBuffer::new(params);
        match cc {
            TpmCc::StartAuthSession => self.start_auth_session(handles, &mut buf),
            TpmCc::PolicyPcr => self.policy_pcr(handles, &mut buf),
            TpmCc::PolicySecret => self.policy_secret(handles, &mut buf),
            TpmCc::PolicyGetDigest => self.policy_get_digest(handles),
            TpmCc::CreatePrimary => self.create_primary(handles, &mut buf),
            TpmCc::Create => self.create(handles, &mut buf),
            TpmCc::Load => self.load(handles, &mut buf),
            TpmCc::Import => self.import(handles, &mut buf),
            TpmCc::Unseal => self.unseal(handles),
            TpmCc::ReadPublic => self.read_public(handles),
            TpmCc::FlushContext => self.flush_context(&mut buf),
            TpmCc::GetCapability => self.get_capability(&mut buf),
            TpmCc::PcrRead => self.pcr_read(&mut buf),
            TpmCc::PcrExtend => self.pcr_extend(handles, &mut buf),
        }
    }

    /// Name of any handle appearing in a command
    fn handle_name(&self, handle: u32) -> Vec<u8> {
        match self.objects.get(&handle) {
            Some(object) => object.name.clone(),
            None => handle.to_be_bytes().to_vec(),
        }
    }

    /// Digest of the selected PCR values, in selection order
    fn pcr_selection_digest(
        &self,
        alg: TpmAlgId,
        selection: &TpmlPcrSelection,
        rc: u32,
    ) -> RcResult<Vec<u8>> {
        let mut values = Vec::new();
        for (bank, index) in selection.iter_selected() {
            values.push(self.pcrs.value(bank, index).or_rc(rc)?);
        }
        crypto::hash(alg, &values).or_rc(TpmRc::Hash.to_u32())
    }

    fn flush_context(&mut self, buf: &mut ResponseBuffer) -> RcResult<Reply> {
        let handle = buf.get_u32().or_rc(TpmRc::Size.at_parameter(1))?;
        let removed = match TpmHt::of(handle) {
            Some(TpmHt::Transient) => self.objects.remove(&handle).is_some(),
            Some(TpmHt::HmacSession) | Some(TpmHt::PolicySession) => {
                self.sessions.remove(&handle).is_some()
            }
            _ => false,
        };
        if !removed {
            return Err(TpmRc::Handle.at_parameter(1));
        }
        trace!("simulator flushed 0x{:08x}", handle);
        Ok(Reply::default())
    }

    fn get_capability(&mut self, buf: &mut ResponseBuffer) -> RcResult<Reply> {
        let capability = buf.get_u32().or_rc(TpmRc::Size.at_parameter(1))?;
        let property = buf.get_u32().or_rc(TpmRc::Size.at_parameter(2))?;
        let count = buf.get_u32().or_rc(TpmRc::Size.at_parameter(3))? as usize;
        if capability != TpmCap::Handles as u32 {
            return Err(TpmRc::Value.at_parameter(1));
        }

        let low = property & 0x00FF_FFFF;
        let candidates: Vec<u32> = match TpmHt::of(property) {
            Some(TpmHt::Transient) => self.objects.keys().copied().collect(),
            // Loaded sessions of either type, ordered by session number
            Some(TpmHt::HmacSession) => {
                let mut v: Vec<u32> = self.sessions.keys().copied().collect();
                v.sort_by_key(|h| h & 0x00FF_FFFF);
                v
            }
            Some(TpmHt::Pcr) => (0..PCR_COUNT).collect(),
            Some(TpmHt::Permanent) => vec![
                tpm_rh::OWNER,
                tpm_rh::NULL,
                tpm_rh::PW,
                tpm_rh::ENDORSEMENT,
                tpm_rh::PLATFORM,
            ],
            // Context save is not supported, so there are never saved sessions
            _ => Vec::new(),
        };
        let matching: Vec<u32> = candidates
            .into_iter()
            .filter(|h| h & 0x00FF_FFFF >= low)
            .collect();
        let more_data = matching.len() > count;
        let handles = TpmlHandle {
            handles: matching.into_iter().take(count).collect(),
        };

        let mut out = CommandBuffer::new();
        out.put_u8(more_data as u8);
        out.put_u32(capability);
        handles.marshal(&mut out);
        Ok(Reply::params(out))
    }

    fn pcr_read(&mut self, buf: &mut ResponseBuffer) -> RcResult<Reply> {
        let selection =
            TpmlPcrSelection::unmarshal(buf).or_rc(TpmRc::Size.at_parameter(1))?;

        let mut returned = Vec::new();
        let mut digests = TpmlDigest::default();
        for sel in &selection.pcr_selections {
            let mut picked = Vec::new();
            if let Some(bank) = self.pcrs.bank(sel.hash) {
                for index in sel.indices() {
                    if digests.digests.len() == MAX_PCR_READ_DIGESTS {
                        break;
                    }
                    if let Some(value) = bank.get(index as usize) {
                        picked.push(index);
                        digests.digests.push(Tpm2bDigest::new(value.clone()));
                    }
                }
            }
            let mut out_sel = TpmsPcrSelection::new(sel.hash, &picked);
            out_sel.pcr_select.resize(sel.pcr_select.len().max(3), 0);
            returned.push(out_sel);
        }

        let mut out = CommandBuffer::new();
        out.put_u32(self.pcrs.update_counter);
        TpmlPcrSelection::new(returned).marshal(&mut out);
        digests.marshal(&mut out);
        Ok(Reply::params(out))
    }

    fn pcr_extend(&mut self, handles: &[u32], buf: &mut ResponseBuffer) -> RcResult<Reply> {
        let index = handles[0];
        if index >= PCR_COUNT {
            return Err(TpmRc::Value.at_handle(1));
        }
        let digests = TpmlDigestValues::unmarshal(buf).or_rc(TpmRc::Size.at_parameter(1))?;
        for d in &digests.digests {
            self.pcrs
                .extend(d.hash_alg, index, &d.digest)
                .or_rc(TpmRc::Hash.at_parameter(1))?;
        }
        self.pcrs.update_counter = self.pcrs.update_counter.wrapping_add(1);
        trace!("simulator extended PCR {}", index);
        Ok(Reply::default())
    }
}

impl Transport for Simulator {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        Ok(self.process(command))
    }
}

fn encode_error(rc: u32) -> Vec<u8> {
    let mut out = CommandBuffer::new();
    out.put_u16(TpmSt::NoSessions.to_u16());
    out.put_u32(TPM_HEADER_SIZE as u32);
    out.put_u32(rc);
    out.into_vec()
}

fn parse_request(command: &[u8]) -> RcResult<Request> {
    let mut buf = ResponseBuffer::new(command);
    let tag = buf.get_u16().or_rc(TpmRc::CommandSize.to_u32())?;
    let size = buf.get_u32().or_rc(TpmRc::CommandSize.to_u32())?;
    let code = buf.get_u32().or_rc(TpmRc::CommandSize.to_u32())?;
    if size as usize != command.len() {
        return Err(TpmRc::CommandSize.to_u32());
    }
    let has_sessions = match TpmSt::from_u16(tag) {
        Some(TpmSt::Sessions) => true,
        Some(TpmSt::NoSessions) => false,
        _ => return Err(TpmRc::Tag.to_u32()),
    };
    let cc = TpmCc::from_u32(code).or_rc(TpmRc::CommandCode.to_u32())?;

    let (handle_count, _) = cc.handle_layout();
    let mut handles = Vec::with_capacity(handle_count);
    for _ in 0..handle_count {
        handles.push(buf.get_u32().or_rc(TpmRc::CommandSize.to_u32())?);
    }

    let mut auths = Vec::new();
    if has_sessions {
        let auth_size = buf.get_u32().or_rc(TpmRc::AuthContext.to_u32())? as usize;
        let area = buf.get_bytes(auth_size).or_rc(TpmRc::AuthContext.to_u32())?;
        let mut area = ResponseBuffer::new(&area);
        while area.remaining() > 0 {
            let n = auths.len() as u32 + 1;
            let entry = AuthEntry::unmarshal(&mut area).or_rc(TpmRc::Size.at_session(n))?;
            auths.push(entry);
        }
    }

    Ok(Request {
        cc,
        handles,
        auths,
        params: buf.get_remaining(),
        has_sessions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{TpmCommand, TpmResponse};

    fn run(sim: &mut Simulator, cmd: TpmCommand) -> TpmResponse {
        TpmResponse::parse(&sim.process(&cmd.finalize().unwrap())).unwrap()
    }

    #[test]
    fn test_unknown_command_code() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        let mut bytes = TpmCommand::new(TpmCc::GetCapability).finalize().unwrap();
        bytes[6..10].copy_from_slice(&0x0000_0199u32.to_be_bytes());
        let rsp = TpmResponse::parse(&sim.process(&bytes)).unwrap();
        assert_eq!(rsp.response_code, TpmRc::CommandCode.to_u32());
    }

    #[test]
    fn test_size_mismatch() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        let mut bytes = TpmCommand::new(TpmCc::GetCapability).finalize().unwrap();
        bytes.push(0);
        let rsp = TpmResponse::parse(&sim.process(&bytes)).unwrap();
        assert_eq!(rsp.response_code, TpmRc::CommandSize.to_u32());
    }

    #[test]
    fn test_missing_authorization() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        let mut cmd = TpmCommand::new(TpmCc::PcrExtend);
        cmd.add_handle(16);
        cmd.add(&TpmlDigestValues::single(TpmtHa::sha256(vec![0; 32])));
        let rsp = run(&mut sim, cmd);
        assert_eq!(rsp.response_code, TpmRc::AuthMissing.to_u32());
    }

    #[test]
    fn test_pcr_read_is_paged() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        let mut cmd = TpmCommand::new(TpmCc::PcrRead);
        let all: Vec<u32> = (0..PCR_COUNT).collect();
        cmd.add(&TpmlPcrSelection::single(TpmAlgId::Sha256, &all));
        let rsp = run(&mut sim, cmd);
        let mut buf = rsp.data_buffer();
        let _counter = buf.get_u32().unwrap();
        let sel = TpmlPcrSelection::unmarshal(&mut buf).unwrap();
        let digests = TpmlDigest::unmarshal(&mut buf).unwrap();
        assert_eq!(digests.digests.len(), MAX_PCR_READ_DIGESTS);
        assert_eq!(sel.pcr_selections[0].indices(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_same_seed_same_hierarchies() {
        let a = Simulator::new(SimulatorConfig::default());
        let b = Simulator::new(SimulatorConfig::default());
        assert_eq!(a.hierarchy_seeds, b.hierarchy_seeds);
        let c = Simulator::new(SimulatorConfig {
            seed: 7,
            ..Default::default()
        });
        assert_ne!(a.hierarchy_seeds, c.hierarchy_seeds);
    }
}
