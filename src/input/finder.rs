// SPDX-License-Identifier: Apache-2.0

use glob::{Pattern, glob};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{Error, Result};

/// FileFinder resolves include patterns into regular files, minus anything
/// matched by an exclude pattern.
#[derive(Debug, Clone)]
pub struct FileFinder {
    include: Vec<String>,
    exclude: Vec<Pattern>,
}

impl FileFinder {
    /// Create a new FileFinder. Fails if an exclude pattern does not compile.
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Result<Self> {
        let exclude = exclude
            .iter()
            .map(|p| Pattern::new(p).map_err(|e| Error::InvalidGlob(format!("{}: {}", p, e))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { include, exclude })
    }

    /// Find all files matching the include patterns, in pattern order, without duplicates.
    pub fn find_files(&self) -> Result<Vec<PathBuf>> {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();

        for pattern in &self.include {
            let matches = glob(pattern).map_err(|e| Error::InvalidGlob(e.to_string()))?;

            for entry in matches {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        // Unreadable directory entry, try again next scan
                        debug!(error = %e, "Skipping unreadable glob entry");
                        continue;
                    }
                };

                if path.is_dir() {
                    continue;
                }

                if self.exclude.iter().any(|p| p.matches_path(&path)) {
                    continue;
                }

                if seen.insert(path.clone()) {
                    paths.push(path);
                }
            }
        }

        Ok(paths)
    }
}
