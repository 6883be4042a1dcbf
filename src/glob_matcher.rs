// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Glob-based include/exclude matching over paths relative to a container root.
//!
//! Matching is case-insensitive across all supported filesystems (spec §6).

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// An include-only glob set, applied against container-relative paths.
///
/// Two of these compose `matcher`/`antiMatcher` in [crate::options::SigningOptions];
/// [FileMatcher] itself never distinguishes "include" from "exclude" — that
/// semantic lives at the call site (spec §4.4.2's `included \ excluded`).
#[derive(Clone, Debug)]
pub struct FileMatcher {
    set: GlobSet,
}

impl FileMatcher {
    /// Build a matcher from a list of glob patterns (e.g. `**/*.dll`).
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, globset::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(
                GlobBuilder::new(pattern.as_ref())
                    .literal_separator(false)
                    .case_insensitive(true)
                    .build()?,
            );
        }
        Ok(Self {
            set: builder.build()?,
        })
    }

    /// Split a flat pattern list into include/exclude matchers by a leading
    /// `!` (spec §6: "a `!` leading to indicate an anti-pattern (when read
    /// from a file list)"). Returns `(matcher, anti_matcher)`, either of
    /// which is `None` when its side of the list is empty.
    pub fn from_pattern_lines<I, S>(
        lines: I,
    ) -> Result<(Option<Self>, Option<Self>), globset::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut includes = Vec::new();
        let mut excludes = Vec::new();

        for line in lines {
            let line = line.as_ref();
            if let Some(pattern) = line.strip_prefix('!') {
                excludes.push(pattern.to_string());
            } else {
                includes.push(line.to_string());
            }
        }

        let matcher = if includes.is_empty() {
            None
        } else {
            Some(Self::from_patterns(includes)?)
        };
        let anti_matcher = if excludes.is_empty() {
            None
        } else {
            Some(Self::from_patterns(excludes)?)
        };

        Ok((matcher, anti_matcher))
    }

    /// Whether `relative_path` matches this set.
    pub fn is_match(&self, relative_path: &str) -> bool {
        // Normalize to forward slashes so Windows-style callers still match
        // `**`-style patterns written with `/`.
        let normalized = relative_path.replace('\\', "/");
        self.set.is_match(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_dll_and_exe_case_insensitively() {
        let m = FileMatcher::from_patterns(["**/*.dll", "**/*.exe"]).unwrap();
        assert!(m.is_match("a.dll"));
        assert!(m.is_match("b.DLL"));
        assert!(m.is_match("f/g.dll"));
        assert!(m.is_match("d.exe"));
        assert!(!m.is_match("c.txt"));
    }

    #[test]
    fn pattern_lines_split_on_leading_bang() {
        let (matcher, anti) = FileMatcher::from_pattern_lines([
            "**/*.dll",
            "**/*.exe",
            "!**/*.txt",
            "!**/DoNotSign/**/*",
        ])
        .unwrap();

        let matcher = matcher.unwrap();
        let anti = anti.unwrap();

        assert!(matcher.is_match("a.dll"));
        assert!(anti.is_match("c.txt"));
        assert!(anti.is_match("DoNotSign/j.dll"));
        assert!(!anti.is_match("a.dll"));
    }

    #[test]
    fn hardcoded_bundle_matcher_selects_packages_only() {
        let m = FileMatcher::from_patterns(["**/*.appx", "**/*.msix"]).unwrap();
        assert!(m.is_match("Dependencies/x64/lib.appx"));
        assert!(!m.is_match("Dependencies/x64/lib.dll"));
    }
}
