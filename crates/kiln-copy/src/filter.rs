use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::CopyError;

/// Include/exclude patterns applied to `/`-separated paths relative to the
/// tree root.
///
/// Patterns follow gitignore-style matching: `*` stays within one path
/// component and `**` crosses directories, so `*.txt` matches `notes.txt`
/// but not `sub/notes.txt`. Excludes always win over includes. An empty
/// include list means everything is included.
#[derive(Debug)]
pub struct CopyFilter {
    includes: GlobSet,
    has_includes: bool,
    excludes: GlobSet,
}

impl CopyFilter {
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self, CopyError> {
        Ok(CopyFilter {
            includes: build_set(includes)?,
            has_includes: !includes.is_empty(),
            excludes: build_set(excludes)?,
        })
    }

    /// Whether the file or symlink at `rel` belongs in the destination.
    pub fn includes_file(&self, rel: &str) -> bool {
        if self.excludes.is_match(rel) {
            return false;
        }
        !self.has_includes || self.includes.is_match(rel)
    }

    /// Whether the walk should descend into the directory at `rel`.
    ///
    /// Only excludes prune descent. Include patterns gate files, not the
    /// directories above them, so `src/**/*.rs` still walks through `src`.
    pub fn descends_dir(&self, rel: &str) -> bool {
        !self.excludes.is_match(rel)
    }

    pub(crate) fn has_includes(&self) -> bool {
        self.has_includes
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet, CopyError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|err| CopyError::InvalidPattern {
                pattern: pattern.clone(),
                message: err.to_string(),
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|err| CopyError::InvalidPattern {
        pattern: patterns.join(" "),
        message: err.to_string(),
    })
}
