// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 2.0 implementation
//!
//! This crate provides the TPM 2.0 commands needed to seal data under
//! policies, communicating directly with the TPM device without C library
//! dependencies.
//!
//! ## Features
//!
//! - **Direct device communication**: Talks directly to `/dev/tpmrm0` or `/dev/tpm0`
//! - **Authenticated sessions**: Salted, bound and parameter-encrypting HMAC sessions
//! - **Handle hygiene**: [`HandleScope`] releases every handle it hands out
//! - **In-process simulator**: The same wire format, for tests and dry runs
//!
//! ## Supported Commands
//!
//! - PCR operations: `PCR_Read`, `PCR_Extend`
//! - Key operations: `CreatePrimary`, `Create`, `Load`, `Import`, `ReadPublic`
//! - Sealing: `Unseal` with PCR and secret policies
//! - Sessions: `StartAuthSession`, `PolicyPCR`, `PolicySecret`, `PolicyGetDigest`
//! - Handles: `GetCapability`, `FlushContext`
//!
//! ## Example
//!
//! ```no_run
//! use tpm2::{TpmAlgId, TpmContext};
//!
//! let mut ctx = TpmContext::new(None)?; // Auto-detect TPM device
//! let pcr23 = ctx.pcr_read_single(23, TpmAlgId::Sha256)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod commands;
mod constants;
mod device;
mod marshal;
mod session;
mod types;

pub mod crypto;
pub mod error;
pub mod handles;
pub mod policy;
pub mod protect;
pub mod simulator;

pub use commands::{CreatedObject, CreatedPrimary, PublicInfo, TpmContext};
pub use constants::*;
pub use error::{has_rc, ErrorCategory, TpmError};
pub use handles::{sweep, HandleScope, SweepScope};
pub use types::*;

// Re-export device for advanced usage
pub use device::{ResponseParts, TpmCommand, TpmDevice, TpmResponse, Transport};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
pub use session::{
    Auth, AuthSession, HmacSessionParams, ParameterEncryption, SessionKeySource, MIN_NONCE_SIZE,
};
pub use simulator::{Simulator, SimulatorConfig};
