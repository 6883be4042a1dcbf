// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing options: the immutable record threaded through every signer call.

use {crate::glob_matcher::FileMatcher, crate::error::SigningError, url::Url};

/// Identifies a digest algorithm by its common name (e.g. `sha256`).
///
/// Kept as a string newtype rather than an enum because the set of
/// algorithms this crate needs to recognize is entirely dictated by what
/// the external signing service and the manifest-update utility accept;
/// we never compute these digests ourselves.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HashAlgorithm(String);

impl HashAlgorithm {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The lowercase token used in `-a <algo>RSA` arguments (spec §4.5.1 step 6).
    pub fn lowercase_token(&self) -> String {
        self.0.to_lowercase()
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable signing options (spec §3).
///
/// Constructed via [SigningOptionsBuilder]. Cloning is cheap; every signer
/// in the recursion tree holds its own `Arc<SigningOptions>` or clone.
#[derive(Clone, Debug)]
pub struct SigningOptions {
    application_name: Option<String>,
    publisher_name: Option<String>,
    description: Option<String>,
    description_url: Option<Url>,
    file_hash_algorithm: HashAlgorithm,
    timestamp_hash_algorithm: HashAlgorithm,
    timestamp_service_url: Option<Url>,
    matcher: Option<FileMatcher>,
    anti_matcher: Option<FileMatcher>,
    recurse_containers: bool,
}

impl SigningOptions {
    pub fn application_name(&self) -> Option<&str> {
        self.application_name.as_deref()
    }

    pub fn publisher_name(&self) -> Option<&str> {
        self.publisher_name.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn description_url(&self) -> Option<&Url> {
        self.description_url.as_ref()
    }

    pub fn file_hash_algorithm(&self) -> &HashAlgorithm {
        &self.file_hash_algorithm
    }

    pub fn timestamp_hash_algorithm(&self) -> &HashAlgorithm {
        &self.timestamp_hash_algorithm
    }

    pub fn timestamp_service_url(&self) -> Option<&Url> {
        self.timestamp_service_url.as_ref()
    }

    pub fn matcher(&self) -> Option<&FileMatcher> {
        self.matcher.as_ref()
    }

    pub fn anti_matcher(&self) -> Option<&FileMatcher> {
        self.anti_matcher.as_ref()
    }

    pub fn recurse_containers(&self) -> bool {
        self.recurse_containers
    }
}

/// Builder for [SigningOptions].
///
/// Mirrors the incremental-settings-object pattern the teacher uses for
/// `SigningSettings` (set fields one at a time, then finalize).
#[derive(Clone, Debug, Default)]
pub struct SigningOptionsBuilder {
    application_name: Option<String>,
    publisher_name: Option<String>,
    description: Option<String>,
    description_url: Option<String>,
    file_hash_algorithm: Option<String>,
    timestamp_hash_algorithm: Option<String>,
    timestamp_service_url: Option<String>,
    matcher: Option<FileMatcher>,
    anti_matcher: Option<FileMatcher>,
    recurse_containers: bool,
}

impl SigningOptionsBuilder {
    pub fn new() -> Self {
        Self {
            recurse_containers: true,
            ..Default::default()
        }
    }

    pub fn application_name(mut self, v: impl Into<String>) -> Self {
        self.application_name = Some(v.into());
        self
    }

    pub fn publisher_name(mut self, v: impl Into<String>) -> Self {
        self.publisher_name = Some(v.into());
        self
    }

    pub fn description(mut self, v: impl Into<String>) -> Self {
        self.description = Some(v.into());
        self
    }

    pub fn description_url(mut self, v: impl Into<String>) -> Self {
        self.description_url = Some(v.into());
        self
    }

    pub fn file_hash_algorithm(mut self, v: impl Into<String>) -> Self {
        self.file_hash_algorithm = Some(v.into());
        self
    }

    pub fn timestamp_hash_algorithm(mut self, v: impl Into<String>) -> Self {
        self.timestamp_hash_algorithm = Some(v.into());
        self
    }

    pub fn timestamp_service_url(mut self, v: impl Into<String>) -> Self {
        self.timestamp_service_url = Some(v.into());
        self
    }

    pub fn matcher(mut self, v: FileMatcher) -> Self {
        self.matcher = Some(v);
        self
    }

    pub fn anti_matcher(mut self, v: FileMatcher) -> Self {
        self.anti_matcher = Some(v);
        self
    }

    pub fn recurse_containers(mut self, v: bool) -> Self {
        self.recurse_containers = v;
        self
    }

    /// Validate and finalize into an immutable [SigningOptions].
    ///
    /// `descriptionUrl` is a required absolute URL whenever a description
    /// is present at all (spec §3); `timestampServiceUrl`, when set, must
    /// also be absolute.
    pub fn build(self) -> Result<SigningOptions, SigningError> {
        let description_url = self
            .description_url
            .map(|u| Url::parse(&u))
            .transpose()?;

        let timestamp_service_url = self
            .timestamp_service_url
            .map(|u| Url::parse(&u))
            .transpose()?;

        let file_hash_algorithm = HashAlgorithm::new(
            self.file_hash_algorithm
                .ok_or_else(|| SigningError::input_validation("fileHashAlgorithm is required"))?,
        );

        let timestamp_hash_algorithm = HashAlgorithm::new(
            self.timestamp_hash_algorithm
                .unwrap_or_else(|| file_hash_algorithm.to_string()),
        );

        Ok(SigningOptions {
            application_name: self.application_name,
            publisher_name: self.publisher_name,
            description: self.description,
            description_url,
            file_hash_algorithm,
            timestamp_hash_algorithm,
            timestamp_service_url,
            matcher: self.matcher,
            anti_matcher: self.anti_matcher,
            recurse_containers: self.recurse_containers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_file_hash_algorithm() {
        let err = SigningOptionsBuilder::new().build().unwrap_err();
        assert!(matches!(err, SigningError::InputValidation(_)));
    }

    #[test]
    fn defaults_timestamp_algorithm_to_file_algorithm() {
        let opts = SigningOptionsBuilder::new()
            .file_hash_algorithm("SHA256")
            .build()
            .unwrap();
        assert_eq!(opts.timestamp_hash_algorithm().to_string(), "SHA256");
    }

    #[test]
    fn rejects_non_absolute_description_url() {
        let err = SigningOptionsBuilder::new()
            .file_hash_algorithm("sha256")
            .description_url("not-a-url")
            .build()
            .unwrap_err();
        assert!(matches!(err, SigningError::Url(_)));
    }

    #[test]
    fn lowercase_token_for_mage_argument() {
        let algo = HashAlgorithm::new("SHA256");
        assert_eq!(algo.lowercase_token(), "sha256");
    }
}
