// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! File references (spec §3) and invariant extension comparison (spec §9).

use std::path::{Path, PathBuf};

/// Fold an extension to invariant (ordinal, culture-neutral) lower case.
///
/// Only the ASCII range is folded. This deliberately does **not** use a
/// locale-aware lowercasing routine: Turkish dotted/dotless `I` must not
/// collapse onto ASCII `i`, so `.applİcation` must never equal
/// `.application`. `str::to_ascii_lowercase` already has exactly this
/// property because it only touches bytes in `b'A'..=b'Z'`.
pub fn fold_extension(extension: &str) -> String {
    extension.to_ascii_lowercase()
}

/// A file's extension, normalized for invariant comparison, e.g. `"dll"`
/// (no leading dot).
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(fold_extension)
}

/// Whether `path`'s extension (invariant-folded) matches `candidate`
/// (also compared case-insensitively, ASCII-only).
pub fn has_extension(path: &Path, candidate: &str) -> bool {
    match extension_of(path) {
        Some(ext) => ext == candidate.trim_start_matches('.').to_ascii_lowercase(),
        None => false,
    }
}

/// Whether `path`'s extension matches any of `candidates`.
pub fn has_any_extension(path: &Path, candidates: &[&str]) -> bool {
    candidates.iter().any(|c| has_extension(path, c))
}

/// A reference to a single file: an absolute path, plus its path relative
/// to whatever root it was discovered under (a container's extraction
/// directory, or the top-level input list).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileRef {
    absolute_path: PathBuf,
    relative_path: PathBuf,
}

impl FileRef {
    pub fn new(absolute_path: impl Into<PathBuf>, relative_path: impl Into<PathBuf>) -> Self {
        Self {
            absolute_path: absolute_path.into(),
            relative_path: relative_path.into(),
        }
    }

    /// A top-level file reference with no owning container; its relative
    /// path is just its file name.
    pub fn top_level(absolute_path: impl Into<PathBuf>) -> Self {
        let absolute_path = absolute_path.into();
        let relative_path = absolute_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| absolute_path.clone());
        Self {
            absolute_path,
            relative_path,
        }
    }

    pub fn absolute_path(&self) -> &Path {
        &self.absolute_path
    }

    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }

    pub fn extension(&self) -> Option<String> {
        extension_of(&self.absolute_path)
    }

    pub fn has_extension(&self, candidate: &str) -> bool {
        has_extension(&self.absolute_path, candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_fold_is_case_insensitive() {
        assert_eq!(fold_extension("ZIP"), "zip");
        assert_eq!(fold_extension("Application"), "application");
    }

    #[test]
    fn turkish_dotted_i_does_not_fold_to_ascii_i() {
        // "applİcation" contains Turkish LATIN CAPITAL LETTER I WITH DOT
        // ABOVE (U+0130), not ASCII 'I'. A locale-aware .NET-style
        // ToLower(tr-TR) would collapse this onto "i" and incorrectly
        // equal "application"; the ASCII-only fold must not.
        let turkish = "appl\u{0130}cation";
        assert_ne!(fold_extension(turkish), "application");
    }

    #[test]
    fn has_extension_matches_case_insensitively() {
        let path = Path::new("/tmp/MyApp.DLL");
        assert!(has_extension(path, "dll"));
        assert!(has_extension(path, ".dll"));
        assert!(!has_extension(path, "exe"));
    }
}
