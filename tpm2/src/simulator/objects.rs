// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Object commands of the simulator: create, load, import, unseal

use p256::SecretKey;
use tracing::trace;
use zeroize::Zeroizing;

use super::{OrRc, RcResult, Reply, Simulator};
use crate::constants::*;
use crate::crypto;
use crate::marshal::*;
use crate::protect;
use crate::types::*;

/// Candidate scalars tried when deriving a primary key
const MAX_DERIVATION_ATTEMPTS: u32 = 16;

/// A loaded object
pub(super) struct Object {
    pub(super) public: TpmtPublic,
    pub(super) public_area: Vec<u8>,
    pub(super) name: Vec<u8>,
    pub(super) sensitive: TpmtSensitive,
    pub(super) ecc_key: Option<SecretKey>,
    /// Hierarchy the object descends from
    pub(super) hierarchy: u32,
}

impl Object {
    fn new(public: TpmtPublic, sensitive: TpmtSensitive, hierarchy: u32) -> RcResult<Self> {
        let ecc_key = match public.type_alg {
            TpmAlgId::Ecc => {
                Some(SecretKey::from_slice(&sensitive.sensitive).or_rc(TpmRc::Key.to_u32())?)
            }
            _ => None,
        };
        let public_area = public.to_bytes();
        let name = public.name().or_rc(TpmRc::Hash.to_u32())?;
        Ok(Self {
            public,
            public_area,
            name,
            sensitive,
            ecc_key,
            hierarchy,
        })
    }

    /// Symmetric definition used to protect children, if this is a storage key
    fn storage_symmetric(&self) -> Option<TpmtSymDef> {
        if !self.public.object_attributes.is_storage_parent() {
            return None;
        }
        self.public.symmetric().filter(|s| !s.is_null()).copied()
    }
}

/// What a storage parent contributes to protecting a child
struct Parent {
    name_alg: TpmAlgId,
    name: Vec<u8>,
    symmetric: TpmtSymDef,
    seed: Zeroizing<Vec<u8>>,
    hierarchy: u32,
}

struct CreateParams {
    sensitive: Tpm2bSensitiveCreate,
    template: TpmtPublic,
    outside_info: Vec<u8>,
    creation_pcr: TpmlPcrSelection,
}

fn parse_create(buf: &mut ResponseBuffer) -> RcResult<CreateParams> {
    let sensitive = Tpm2bSensitiveCreate::unmarshal(buf).or_rc(TpmRc::Size.at_parameter(1))?;
    let in_public = buf.get_tpm2b().or_rc(TpmRc::Size.at_parameter(2))?;
    let outside_info = buf.get_tpm2b().or_rc(TpmRc::Size.at_parameter(3))?;
    let creation_pcr = TpmlPcrSelection::unmarshal(buf).or_rc(TpmRc::Size.at_parameter(4))?;
    let template = TpmtPublic::from_bytes(&in_public).or_rc(TpmRc::Value.at_parameter(2))?;
    check_template(&template)?;
    if sensitive.data.buffer.len() > MAX_SYM_DATA {
        return Err(TpmRc::Size.at_parameter(1));
    }
    Ok(CreateParams {
        sensitive,
        template,
        outside_info,
        creation_pcr,
    })
}

/// Attribute and parameter consistency of a public area (always parameter 2)
fn check_template(public: &TpmtPublic) -> RcResult<()> {
    let attrs = public.object_attributes;
    match &public.parameters {
        TpmtPublicParms::Ecc(parms) => {
            if parms.curve_id != TpmEccCurve::NistP256 {
                return Err(TpmRc::Curve.at_parameter(2));
            }
            let restricted_decrypt =
                attrs.contains(TpmaObject::RESTRICTED | TpmaObject::DECRYPT);
            if restricted_decrypt && parms.symmetric != TpmtSymDef::aes_128_cfb() {
                return Err(TpmRc::Symmetric.at_parameter(2));
            }
        }
        TpmtPublicParms::KeyedHash(_) => {
            // Sealed data objects can neither sign nor decrypt
            if attrs.0 & (TpmaObject::RESTRICTED | TpmaObject::DECRYPT | TpmaObject::SIGN_ENCRYPT)
                != 0
            {
                return Err(TpmRc::Attributes.at_parameter(2));
            }
        }
    }
    Ok(())
}

/// Whether `sensitive` is the private half of `public`
fn check_binding(public: &TpmtPublic, sensitive: &TpmtSensitive) -> bool {
    if sensitive.sensitive_type != public.type_alg {
        return false;
    }
    match &public.unique {
        TpmtPublicUnique::KeyedHash(unique) => {
            protect::sealed_unique(public.name_alg, &sensitive.seed_value, &sensitive.sensitive)
                .map(|expected| crypto::ct_eq(&expected, unique))
                .unwrap_or(false)
        }
        TpmtPublicUnique::Ecc(point) => SecretKey::from_slice(&sensitive.sensitive)
            .ok()
            .and_then(|key| crypto::ecc_point(&key.public_key()).ok())
            .is_some_and(|derived| &derived == point),
    }
}

/// Derive a primary key from the hierarchy seed and the template
fn derive_ecc_key(seed: &[u8], template_digest: &[u8]) -> RcResult<SecretKey> {
    for counter in 1..=MAX_DERIVATION_ATTEMPTS {
        let candidate = Zeroizing::new(
            crypto::kdfa(
                TpmAlgId::Sha256,
                seed,
                "ECC",
                template_digest,
                &counter.to_be_bytes(),
                256,
            )
            .or_rc(TpmRc::Failure.to_u32())?,
        );
        if let Ok(key) = SecretKey::from_slice(&candidate) {
            return Ok(key);
        }
    }
    Err(TpmRc::Failure.to_u32())
}

/// Creation data, its digest and the ticket over both
struct CreationRecord {
    data: TpmsCreationData,
    hash: Vec<u8>,
    ticket: TpmtTkCreation,
}

impl CreationRecord {
    fn marshal(&self, out: &mut CommandBuffer) {
        out.put_sized(|inner| self.data.marshal(inner));
        out.put_tpm2b(&self.hash);
        self.ticket.marshal(out);
    }
}

impl Simulator {
    fn ensure_object_slot(&self) -> RcResult<()> {
        if self.objects.len() >= self.config.max_objects {
            return Err(TpmRc::ObjectMemory.to_u32());
        }
        Ok(())
    }

    fn insert_object(&mut self, object: Object) -> u32 {
        self.next_object += 1;
        let handle = TpmHt::Transient.first() | self.next_object;
        self.objects.insert(handle, object);
        trace!("simulator loaded object 0x{:08x}", handle);
        handle
    }

    fn storage_parent(&self, handle: u32) -> RcResult<Parent> {
        let parent = self
            .objects
            .get(&handle)
            .or_rc(TpmRc::Handle.at_handle(1))?;
        let symmetric = parent.storage_symmetric().or_rc(TpmRc::Type.at_handle(1))?;
        Ok(Parent {
            name_alg: parent.public.name_alg,
            name: parent.name.clone(),
            symmetric,
            seed: Zeroizing::new(parent.sensitive.seed_value.clone()),
            hierarchy: parent.hierarchy,
        })
    }

    fn hierarchy_seed(&self, hierarchy: u32) -> RcResult<Zeroizing<Vec<u8>>> {
        self.hierarchy_seeds
            .get(&hierarchy)
            .map(|seed| Zeroizing::new(seed.to_vec()))
            .or_rc(TpmRc::Hierarchy.to_u32())
    }

    #[allow(clippy::too_many_arguments)]
    fn creation_record(
        &self,
        hierarchy: u32,
        name_alg: TpmAlgId,
        name: &[u8],
        parent_name_alg: u16,
        parent_name: &[u8],
        outside_info: Vec<u8>,
        creation_pcr: TpmlPcrSelection,
    ) -> RcResult<CreationRecord> {
        let pcr_digest = if creation_pcr.is_empty() {
            Vec::new()
        } else {
            self.pcr_selection_digest(name_alg, &creation_pcr, TpmRc::Value.at_parameter(4))?
        };
        let data = TpmsCreationData {
            pcr_select: creation_pcr,
            pcr_digest,
            locality: 0,
            parent_name_alg,
            parent_name: parent_name.to_vec(),
            parent_qualified_name: parent_name.to_vec(),
            outside_info,
        };
        let hash = crypto::hash(name_alg, &[&data.to_bytes()]).or_rc(TpmRc::Hash.to_u32())?;

        let proof = Zeroizing::new(
            crypto::kdfa(
                TpmAlgId::Sha256,
                &self.hierarchy_seed(hierarchy)?,
                "PROOF",
                &[],
                &[],
                256,
            )
            .or_rc(TpmRc::Failure.to_u32())?,
        );
        let ticket_digest = crypto::hmac(
            name_alg,
            &proof,
            &[&TpmSt::Creation.to_u16().to_be_bytes(), name, &hash],
        )
        .or_rc(TpmRc::Hash.to_u32())?;

        Ok(CreationRecord {
            data,
            hash,
            ticket: TpmtTkCreation {
                tag: TpmSt::Creation.to_u16(),
                hierarchy,
                digest: Tpm2bDigest::new(ticket_digest),
            },
        })
    }

    pub(super) fn create_primary(
        &mut self,
        handles: &[u32],
        buf: &mut ResponseBuffer,
    ) -> RcResult<Reply> {
        let hierarchy = handles[0];
        let hseed = self
            .hierarchy_seed(hierarchy)
            .map_err(|_| TpmRc::Hierarchy.at_handle(1))?;
        let params = parse_create(buf)?;
        self.ensure_object_slot()?;

        let template_bytes = params.template.to_bytes();
        let template_digest =
            crypto::hash(TpmAlgId::Sha256, &[&template_bytes]).or_rc(TpmRc::Hash.to_u32())?;
        let name_alg = params.template.name_alg;
        let seed_value = crypto::kdfa(
            name_alg,
            &hseed,
            "SEED",
            &template_digest,
            &[],
            name_alg.digest_size() * 8,
        )
        .or_rc(TpmRc::Failure.to_u32())?;

        let mut public = params.template;
        let sensitive_bytes = match public.type_alg {
            TpmAlgId::Ecc => {
                let key = derive_ecc_key(&hseed, &template_digest)?;
                public.unique = TpmtPublicUnique::Ecc(
                    crypto::ecc_point(&key.public_key()).or_rc(TpmRc::Failure.to_u32())?,
                );
                key.to_bytes().to_vec()
            }
            _ => {
                let data = params.sensitive.data.buffer.clone();
                public.unique = TpmtPublicUnique::KeyedHash(
                    protect::sealed_unique(name_alg, &seed_value, &data)
                        .or_rc(TpmRc::Hash.to_u32())?,
                );
                data
            }
        };

        let sensitive = TpmtSensitive {
            sensitive_type: public.type_alg,
            auth_value: params.sensitive.user_auth.buffer.clone(),
            seed_value,
            sensitive: sensitive_bytes,
        };
        let object = Object::new(public, sensitive, hierarchy)?;
        let record = self.creation_record(
            hierarchy,
            name_alg,
            &object.name,
            TpmAlgId::Null.to_u16(),
            &hierarchy.to_be_bytes(),
            params.outside_info,
            params.creation_pcr,
        )?;

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&object.public_area);
        record.marshal(&mut out);
        out.put_tpm2b(&object.name);
        let handle = self.insert_object(object);
        Ok(Reply {
            handles: vec![handle],
            params: out.into_vec(),
        })
    }

    pub(super) fn create(&mut self, handles: &[u32], buf: &mut ResponseBuffer) -> RcResult<Reply> {
        let parent = self.storage_parent(handles[0])?;
        let params = parse_create(buf)?;
        self.ensure_object_slot()?;

        let name_alg = params.template.name_alg;
        let seed_value = self.random_bytes(name_alg.digest_size());
        let mut public = params.template;
        let sensitive_bytes = match public.type_alg {
            TpmAlgId::Ecc => {
                let key = SecretKey::random(&mut self.rng);
                public.unique = TpmtPublicUnique::Ecc(
                    crypto::ecc_point(&key.public_key()).or_rc(TpmRc::Failure.to_u32())?,
                );
                key.to_bytes().to_vec()
            }
            _ => {
                let mut data = params.sensitive.data.buffer.clone();
                if data.is_empty()
                    && public
                        .object_attributes
                        .contains(TpmaObject::SENSITIVE_DATA_ORIGIN)
                {
                    data = self.random_bytes(name_alg.digest_size());
                }
                public.unique = TpmtPublicUnique::KeyedHash(
                    protect::sealed_unique(name_alg, &seed_value, &data)
                        .or_rc(TpmRc::Hash.to_u32())?,
                );
                data
            }
        };

        let sensitive = TpmtSensitive {
            sensitive_type: public.type_alg,
            auth_value: params.sensitive.user_auth.buffer.clone(),
            seed_value,
            sensitive: sensitive_bytes,
        };
        let public_area = public.to_bytes();
        let name = public.name().or_rc(TpmRc::Hash.to_u32())?;
        let private = protect::protect(
            parent.name_alg,
            &parent.symmetric,
            &parent.seed,
            &name,
            &sensitive,
        )
        .or_rc(TpmRc::Failure.to_u32())?;
        let record = self.creation_record(
            parent.hierarchy,
            name_alg,
            &name,
            parent.name_alg.to_u16(),
            &parent.name,
            params.outside_info,
            params.creation_pcr,
        )?;

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&private);
        out.put_tpm2b(&public_area);
        record.marshal(&mut out);
        Ok(Reply::params(out))
    }

    pub(super) fn load(&mut self, handles: &[u32], buf: &mut ResponseBuffer) -> RcResult<Reply> {
        let parent = self.storage_parent(handles[0])?;
        let in_private = buf.get_tpm2b().or_rc(TpmRc::Size.at_parameter(1))?;
        let in_public = buf.get_tpm2b().or_rc(TpmRc::Size.at_parameter(2))?;
        let public = TpmtPublic::from_bytes(&in_public).or_rc(TpmRc::Size.at_parameter(2))?;
        check_template(&public)?;
        self.ensure_object_slot()?;

        let name = public.name().or_rc(TpmRc::Hash.to_u32())?;
        let sensitive = protect::unprotect(
            parent.name_alg,
            &parent.symmetric,
            &parent.seed,
            &name,
            &in_private,
        )
        .or_rc(TpmRc::Integrity.at_parameter(1))?;
        if !check_binding(&public, &sensitive) {
            return Err(TpmRc::Binding.at_parameter(2));
        }

        let object = Object::new(public, sensitive, parent.hierarchy)?;
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&object.name);
        let handle = self.insert_object(object);
        Ok(Reply {
            handles: vec![handle],
            params: out.into_vec(),
        })
    }

    pub(super) fn import(&mut self, handles: &[u32], buf: &mut ResponseBuffer) -> RcResult<Reply> {
        let parent = self.storage_parent(handles[0])?;
        let encryption_key = buf.get_tpm2b().or_rc(TpmRc::Size.at_parameter(1))?;
        let object_public = buf.get_tpm2b().or_rc(TpmRc::Size.at_parameter(2))?;
        let duplicate = buf.get_tpm2b().or_rc(TpmRc::Size.at_parameter(3))?;
        let in_sym_seed = buf.get_tpm2b().or_rc(TpmRc::Size.at_parameter(4))?;
        let symmetric_alg =
            TpmtSymDef::unmarshal(buf).or_rc(TpmRc::Symmetric.at_parameter(5))?;

        // Only outer-wrapped duplicates are accepted
        if !symmetric_alg.is_null() {
            return Err(TpmRc::Symmetric.at_parameter(5));
        }
        if !encryption_key.is_empty() {
            return Err(TpmRc::Size.at_parameter(1));
        }

        let public = TpmtPublic::from_bytes(&object_public).or_rc(TpmRc::Size.at_parameter(2))?;
        check_template(&public)?;
        let attrs = public.object_attributes;
        if attrs.contains(TpmaObject::FIXED_TPM) || attrs.contains(TpmaObject::FIXED_PARENT) {
            return Err(TpmRc::Attributes.at_parameter(2));
        }

        let parent_key = self
            .objects
            .get(&handles[0])
            .and_then(|object| object.ecc_key.clone())
            .or_rc(TpmRc::Type.at_handle(1))?;
        let parent_public = self
            .objects
            .get(&handles[0])
            .map(|object| object.public.clone())
            .or_rc(TpmRc::Handle.at_handle(1))?;
        if in_sym_seed.is_empty() {
            return Err(TpmRc::Size.at_parameter(4));
        }
        let seed = protect::recover_seed(
            &parent_key,
            &parent_public,
            protect::DUPLICATE_LABEL,
            &in_sym_seed,
        )
        .or_rc(TpmRc::EccPoint.at_parameter(4))?;

        let name = public.name().or_rc(TpmRc::Hash.to_u32())?;
        let sensitive = protect::unprotect(
            parent.name_alg,
            &parent.symmetric,
            &seed,
            &name,
            &duplicate,
        )
        .or_rc(TpmRc::Integrity.at_parameter(3))?;
        if !check_binding(&public, &sensitive) {
            return Err(TpmRc::Binding.at_parameter(3));
        }
        if sensitive.sensitive.len() > MAX_SYM_DATA {
            return Err(TpmRc::Size.at_parameter(3));
        }

        let private = protect::protect(
            parent.name_alg,
            &parent.symmetric,
            &parent.seed,
            &name,
            &sensitive,
        )
        .or_rc(TpmRc::Failure.to_u32())?;
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&private);
        Ok(Reply::params(out))
    }

    pub(super) fn unseal(&mut self, handles: &[u32]) -> RcResult<Reply> {
        let object = self
            .objects
            .get(&handles[0])
            .or_rc(TpmRc::Handle.at_handle(1))?;
        if object.public.type_alg != TpmAlgId::KeyedHash {
            return Err(TpmRc::Type.at_handle(1));
        }
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&object.sensitive.sensitive);
        Ok(Reply::params(out))
    }

    pub(super) fn read_public(&mut self, handles: &[u32]) -> RcResult<Reply> {
        let object = self
            .objects
            .get(&handles[0])
            .or_rc(TpmRc::Handle.at_handle(1))?;
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&object.public_area);
        out.put_tpm2b(&object.name);
        // qualifiedName; the hierarchy chain is not tracked
        out.put_tpm2b(&object.name);
        Ok(Reply::params(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatorConfig;

    fn sealed(data: &[u8]) -> (TpmtPublic, TpmtSensitive) {
        let seed_value = vec![9u8; 32];
        let unique = protect::sealed_unique(TpmAlgId::Sha256, &seed_value, data).unwrap();
        let public = TpmtPublic::importable_sealed_object(Tpm2bDigest::empty(), unique);
        let sensitive = TpmtSensitive {
            sensitive_type: TpmAlgId::KeyedHash,
            auth_value: vec![],
            seed_value,
            sensitive: data.to_vec(),
        };
        (public, sensitive)
    }

    #[test]
    fn test_binding() {
        let (public, sensitive) = sealed(b"secrets");
        assert!(check_binding(&public, &sensitive));

        let mut other = sensitive.clone();
        other.sensitive = b"secretz".to_vec();
        assert!(!check_binding(&public, &other));

        let mut wrong_type = sensitive;
        wrong_type.sensitive_type = TpmAlgId::Ecc;
        assert!(!check_binding(&public, &wrong_type));
    }

    #[test]
    fn test_template_checks() {
        let mut srk = TpmtPublic::ecc_storage_key();
        assert!(check_template(&srk).is_ok());
        if let TpmtPublicParms::Ecc(parms) = &mut srk.parameters {
            parms.symmetric = TpmtSymDef::null();
        }
        assert_eq!(
            check_template(&srk),
            Err(TpmRc::Symmetric.at_parameter(2))
        );

        let mut sealed = TpmtPublic::sealed_object_with_auth();
        sealed.object_attributes = sealed.object_attributes.with_decrypt();
        assert_eq!(
            check_template(&sealed),
            Err(TpmRc::Attributes.at_parameter(2))
        );
    }

    #[test]
    fn test_primary_keys_are_deterministic() {
        let seed = [5u8; 32];
        let digest = crypto::hash(
            TpmAlgId::Sha256,
            &[&TpmtPublic::ecc_storage_key().to_bytes()],
        )
        .unwrap();
        let a = derive_ecc_key(&seed, &digest).unwrap();
        let b = derive_ecc_key(&seed, &digest).unwrap();
        assert_eq!(a.to_bytes(), b.to_bytes());

        let other = derive_ecc_key(&[6u8; 32], &digest).unwrap();
        assert_ne!(a.to_bytes(), other.to_bytes());
    }

    #[test]
    fn test_object_slots() {
        let sim = Simulator::new(SimulatorConfig {
            max_objects: 0,
            ..Default::default()
        });
        assert_eq!(
            sim.ensure_object_slot(),
            Err(TpmRc::ObjectMemory.to_u32())
        );
    }
}
