// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Policy-gated sealing on top of the [`tpm2`] client
//!
//! - [`negotiator`]: picks how an HMAC session is keyed and encrypted
//! - [`policy`]: computes and satisfies PCR policies with trial and real sessions
//! - [`seal`]: create, load and unseal sealed data objects
//! - [`import`]: wrap a secret for a foreign TPM's endorsement key and unwrap it there
//! - [`eventlog`]: check a firmware event log against live PCRs
//! - [`flows`]: the end-to-end sequences run by the `tpm-seal` binary

pub mod error;
pub mod eventlog;
pub mod flows;
pub mod import;
pub mod keys;
pub mod negotiator;
pub mod pcr_spec;
pub mod policy;
pub mod seal;

pub use error::{classify, report};
pub use import::ImportBlob;
pub use negotiator::{HmacMode, SaltKeys, SessionPlan};
pub use seal::{SealPolicy, SealedBlob};
