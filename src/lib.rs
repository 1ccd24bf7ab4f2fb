// SPDX-License-Identifier: Apache-2.0

pub mod bounded_channel;
pub mod config;
pub mod error;
pub mod event;
pub mod harvester;
pub mod init;
pub mod input;
pub mod prospector;
pub mod publisher;
pub mod registrar;
pub mod spooler;

pub use error::{Error, Result};
