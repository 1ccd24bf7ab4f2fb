// SPDX-License-Identifier: Apache-2.0

//! Durable offset tracking.

pub mod persistence;
mod registry;
mod worker;

pub use registry::{FileState, Registry};
pub use worker::{Registrar, RegistrarConfig, RegistrarMessage, load_state};
