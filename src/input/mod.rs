// SPDX-License-Identifier: Apache-2.0

//! File discovery, identity and line splitting.

mod file_id;
mod finder;
mod reader;

pub use file_id::{FileId, identity, identity_async};
pub use finder::FileFinder;
pub use reader::{Line, LineReader};
