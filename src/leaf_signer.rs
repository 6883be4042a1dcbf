// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Leaf data-format signers (spec §4.3, component C3).
//!
//! A [LeafSigner] operates on a single file format and does not recurse;
//! [crate::aggregating_signer::AggregatingSigner] (C4) is what groups
//! files by owning signer and invokes these in batches.

use {
    crate::{error::SigningError, fileref::FileRef, options::SigningOptions},
    async_trait::async_trait,
    std::path::Path,
    std::sync::atomic::{AtomicUsize, Ordering},
};

/// A signer for a single leaf file format.
///
/// Implementations are expected to be cheap to clone/share (`Arc`) since
/// the dispatcher holds one instance per signer for the lifetime of a
/// top-level `sign` call and invokes it concurrently with other signers'
/// batches.
#[async_trait]
pub trait LeafSigner: Send + Sync {
    /// A human-readable name, used in logging and error messages.
    fn name(&self) -> &str;

    /// Total, pure function over the file path/extension: does this
    /// signer claim `file`?
    fn can_sign(&self, file: &Path) -> bool;

    /// Sign `files` as a batch. Returns only after all files are signed
    /// or the batch has failed; partial batch failures surface as
    /// [SigningError::Signing].
    async fn sign(
        &self,
        files: &[FileRef],
        options: &SigningOptions,
    ) -> Result<(), SigningError>;

    /// Copy any sibling files this signer requires for content addressing
    /// into `destination` (a fresh directory) — NOT `file` itself.
    async fn copy_signing_dependencies(
        &self,
        _file: &Path,
        _destination: &Path,
        _options: &SigningOptions,
    ) -> Result<(), SigningError> {
        Ok(())
    }
}

/// The designated default signer that unclaimed portable-executable files
/// are routed to (spec §4.4.2 step 3).
///
/// Spec §9 flags the source's "single or default" dispatch-time lookup as
/// possibly-buggy (it would panic given more than one default group).
/// `AggregatingSigner` sidesteps this entirely by taking exactly one
/// `default_signer` as a named constructor field rather than selecting it
/// from a list of registered signers at dispatch time — see DESIGN.md.
///
/// Primitive PE signing itself is an explicit Non-goal of spec §1 ("opaque
/// leaf signers invoked via a uniform capability"); this type logs the
/// files it was handed and reports success, standing in for whatever
/// concrete Authenticode backend a production deployment wires up.
pub struct DefaultPeSigner {
    logger: slog::Logger,
    signed_count: AtomicUsize,
}

impl DefaultPeSigner {
    pub fn new(logger: slog::Logger) -> Self {
        Self {
            logger,
            signed_count: AtomicUsize::new(0),
        }
    }

    /// Number of files this signer has processed so far. Exposed for
    /// tests that assert on dispatch fan-out rather than on a real
    /// signature.
    pub fn signed_count(&self) -> usize {
        self.signed_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeafSigner for DefaultPeSigner {
    fn name(&self) -> &str {
        "default-pe-signer"
    }

    fn can_sign(&self, _file: &Path) -> bool {
        // The default signer never claims files by its own CanSign; C4
        // routes to it explicitly for unclaimed PE files (spec §4.4.2
        // step 3), so this always returns false and is never consulted
        // during the "group files by first leaf signer that claims each"
        // scan.
        false
    }

    async fn sign(
        &self,
        files: &[FileRef],
        _options: &SigningOptions,
    ) -> Result<(), SigningError> {
        for file in files {
            slog::info!(self.logger, "signing PE file"; "path" => %file.absolute_path().display());
        }
        self.signed_count.fetch_add(files.len(), Ordering::SeqCst);
        Ok(())
    }
}

/// An opaque signer for a package-level container format — `.appx`/
/// `.msix`/`.appxbundle`/`.msixbundle`, `.nupkg`, or `.vsix` (spec §1
/// Non-goals: "primitive PE/MSIX/VSIX/NuPkg signing itself ... opaque
/// leaf signers invoked via a uniform capability").
///
/// Unlike [DefaultPeSigner], this signer does claim files through
/// `can_sign` — it is registered for the extension set a concrete
/// deployment's package-signing backend owns (e.g. an Authenticode-style
/// signature embedded in an Appx bundle, or a NuGet `.signature.p7s`
/// entry). The signing side effect itself is opaque here; a production
/// wiring in `main.rs` would substitute a real backend behind the same
/// [LeafSigner] trait.
pub struct OpaquePackageSigner {
    name: String,
    extensions: Vec<String>,
    logger: slog::Logger,
    signed_count: AtomicUsize,
}

impl OpaquePackageSigner {
    pub fn new(name: impl Into<String>, extensions: &[&str], logger: slog::Logger) -> Self {
        Self {
            name: name.into(),
            extensions: extensions.iter().map(|s| s.to_string()).collect(),
            logger,
            signed_count: AtomicUsize::new(0),
        }
    }

    pub fn signed_count(&self) -> usize {
        self.signed_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeafSigner for OpaquePackageSigner {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_sign(&self, file: &Path) -> bool {
        let extensions: Vec<&str> = self.extensions.iter().map(String::as_str).collect();
        crate::fileref::has_any_extension(file, &extensions)
    }

    async fn sign(
        &self,
        files: &[FileRef],
        _options: &SigningOptions,
    ) -> Result<(), SigningError> {
        for file in files {
            slog::info!(self.logger, "signing package"; "signer" => &self.name, "path" => %file.absolute_path().display());
        }
        self.signed_count.fetch_add(files.len(), Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_logger;

    #[tokio::test]
    async fn default_signer_never_claims_by_can_sign() {
        let signer = DefaultPeSigner::new(test_logger());
        assert!(!signer.can_sign(Path::new("a.dll")));
    }

    #[tokio::test]
    async fn default_signer_counts_signed_files() {
        let signer = DefaultPeSigner::new(test_logger());
        let options = crate::options::SigningOptionsBuilder::new()
            .file_hash_algorithm("sha256")
            .build()
            .unwrap();
        let files = vec![FileRef::top_level("/tmp/a.dll"), FileRef::top_level("/tmp/b.exe")];
        signer.sign(&files, &options).await.unwrap();
        assert_eq!(signer.signed_count(), 2);
    }

    #[tokio::test]
    async fn opaque_package_signer_claims_only_its_extensions() {
        let signer = OpaquePackageSigner::new("nuget-signer", &["nupkg"], test_logger());
        assert!(signer.can_sign(Path::new("a.nupkg")));
        assert!(!signer.can_sign(Path::new("a.vsix")));

        let options = crate::options::SigningOptionsBuilder::new()
            .file_hash_algorithm("sha256")
            .build()
            .unwrap();
        signer
            .sign(&[FileRef::top_level("/tmp/a.nupkg")], &options)
            .await
            .unwrap();
        assert_eq!(signer.signed_count(), 1);
    }
}
