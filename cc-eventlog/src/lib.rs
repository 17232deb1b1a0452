// SPDX-FileCopyrightText: © 2024 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

pub use replay::{replay, reset_value, verify, PcrBank, ReplayError, VerifiedEvent, PCR_COUNT};
pub use tcg::{TcgDigest, TcgEfiSpecIdEvent};
pub use tpm::{TpmEvent, TpmEventLog};

mod codecs;
mod replay;
pub mod tcg;
pub mod tpm;

pub use codecs::VecOf;
