// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application-manifest signer (spec §4.5, component C5).
//!
//! Runs the rename/invoke/rename/sign protocol over a `.application`/
//! `.vsto` deployment manifest and its companion per-version manifest,
//! restoring the `*.deploy` rename on every exit path. Grounded on
//! `tugger-apple-codesign/src/bundle_signing.rs`'s
//! rewrite-then-recurse-then-reseal control flow, generalized from
//! "dispose the container" to "restore the renamed files."

use {
    crate::{
        aggregating_signer::AggregatingSigner,
        capabilities::{
            CertificateProvider, ManifestSigner as XmlDsigManifestSigner, ManifestUpdateUtility,
            SignatureAlgorithmProvider,
        },
        config::RetryConfig,
        error::SigningError,
        fileref::{has_any_extension, has_extension, FileRef},
        leaf_signer::LeafSigner,
        options::SigningOptions,
    },
    async_trait::async_trait,
    std::{
        path::{Path, PathBuf},
        sync::Arc,
    },
};

/// The full protocol driver for `.application`/`.vsto` deployment
/// manifests (spec §4.5.1).
pub struct ApplicationManifestSigner {
    logger: slog::Logger,
    aggregating_signer: Arc<AggregatingSigner>,
    certificate_provider: Arc<dyn CertificateProvider>,
    key_provider: Arc<dyn SignatureAlgorithmProvider>,
    xmldsig_signer: Arc<dyn XmlDsigManifestSigner>,
    update_utility: Arc<dyn ManifestUpdateUtility>,
    retry: RetryConfig,
}

impl ApplicationManifestSigner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logger: slog::Logger,
        aggregating_signer: Arc<AggregatingSigner>,
        certificate_provider: Arc<dyn CertificateProvider>,
        key_provider: Arc<dyn SignatureAlgorithmProvider>,
        xmldsig_signer: Arc<dyn XmlDsigManifestSigner>,
        update_utility: Arc<dyn ManifestUpdateUtility>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            logger,
            aggregating_signer,
            certificate_provider,
            key_provider,
            xmldsig_signer,
            update_utility,
            retry,
        }
    }

    /// Run the full protocol (steps 1-10) against a single deployment
    /// manifest. Step 10 (rename restoration) always runs, regardless of
    /// where in steps 4-9 an error originated.
    async fn sign_one(
        &self,
        deployment_manifest: &Path,
        options: &SigningOptions,
    ) -> Result<(), SigningError> {
        let directory = deployment_manifest.parent().ok_or_else(|| {
            SigningError::input_validation("deployment manifest has no parent directory")
        })?;

        // Step 1: locate the version directory. Zero candidates is a
        // degenerate-but-legal case (spec §8 scenario 5); more than one is
        // genuinely ambiguous and fatal.
        let version_dir = locate_version_directory(directory)?;

        // Step 2: locate the companion per-version manifest, if any.
        let manifest_path = match &version_dir {
            Some(dir) => locate_version_manifest(dir)?,
            None => None,
        };

        // Step 3: rename every `*.deploy` file under the version
        // directory, recording originals for restoration.
        let renamed = match &version_dir {
            Some(dir) => rename_deploy_files(dir)?,
            None => Vec::new(),
        };

        let result = self
            .run_protocol(deployment_manifest, manifest_path.as_deref(), &renamed, options)
            .await;

        // Step 10: restore regardless of outcome.
        self.restore_deploy_files(&renamed);

        result
    }

    /// Steps 4-9.
    async fn run_protocol(
        &self,
        deployment_manifest: &Path,
        manifest_path: Option<&Path>,
        renamed: &[RenamedFile],
        options: &SigningOptions,
    ) -> Result<(), SigningError> {
        // Step 4: sign the renamed payload via the aggregating signer.
        let payload_files: Vec<FileRef> = renamed
            .iter()
            .map(|file| FileRef::top_level(&file.renamed))
            .collect();
        if !payload_files.is_empty() {
            self.aggregating_signer
                .sign(payload_files, Arc::new(options.clone()))
                .await?;
        }

        let certificate = self.certificate_provider.get_certificate().await?;
        let signing_key = self.key_provider.get_signing_key().await?;

        // Steps 5-6 only run when a companion manifest exists.
        if let Some(manifest_path) = manifest_path {
            self.xmldsig_signer
                .sign(manifest_path, &certificate, &signing_key)
                .await?;

            let manifest_arg = format!(
                "-update \"{}\" -a {}RSA -n \"{}\"",
                manifest_path.display(),
                options.file_hash_algorithm().lowercase_token(),
                options.application_name().unwrap_or_default(),
            );
            self.run_utility_with_retry(&manifest_arg).await?;
        }

        // Step 7: publisher string.
        let publisher = match options.publisher_name() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => certificate.subject().user_friendly_str().map_err(|e| {
                SigningError::signing(format!("could not render certificate subject: {e}"))
            })?,
        };

        // Step 8.
        let mut deploy_arg = format!(
            "-update \"{}\" -a {}RSA -n \"{}\" -pub \"{}\"",
            deployment_manifest.display(),
            options.file_hash_algorithm().lowercase_token(),
            options.application_name().unwrap_or_default(),
            publisher,
        );
        if let Some(manifest_path) = manifest_path {
            deploy_arg.push_str(&format!(" -appm \"{}\"", manifest_path.display()));
        }
        if let Some(url) = options.description_url() {
            deploy_arg.push_str(&format!(" -SupportURL {url}"));
        }
        self.run_utility_with_retry(&deploy_arg).await?;

        // Step 9.
        self.xmldsig_signer
            .sign(deployment_manifest, &certificate, &signing_key)
            .await?;

        Ok(())
    }

    async fn run_utility_with_retry(&self, arg_string: &str) -> Result<(), SigningError> {
        let mut attempt = 0;
        loop {
            let exit_code = self.update_utility.run(arg_string).await?;
            if exit_code == 0 {
                return Ok(());
            }

            if attempt >= self.retry.max_retries {
                return Err(SigningError::ExternalUtility {
                    utility: "mage".to_string(),
                    status: exit_code,
                    stderr: String::new(),
                });
            }

            attempt += 1;
            slog::warn!(
                self.logger,
                "manifest-update utility exited non-zero, retrying";
                "exit_code" => exit_code,
                "attempt" => attempt,
            );
            tokio::time::sleep(self.retry.delay).await;
        }
    }

    fn restore_deploy_files(&self, renamed: &[RenamedFile]) {
        for file in renamed {
            if !file.renamed.exists() {
                continue;
            }
            if let Err(e) = std::fs::rename(&file.renamed, &file.original) {
                slog::error!(
                    self.logger,
                    "failed to restore .deploy name";
                    "path" => %file.original.display(),
                    "error" => %e,
                );
            }
        }
    }
}

#[async_trait]
impl LeafSigner for ApplicationManifestSigner {
    fn name(&self) -> &str {
        "application-manifest-signer"
    }

    fn can_sign(&self, file: &Path) -> bool {
        has_any_extension(file, &["application", "vsto"])
    }

    async fn sign(
        &self,
        files: &[FileRef],
        options: &SigningOptions,
    ) -> Result<(), SigningError> {
        let futures = files
            .iter()
            .map(|file| self.sign_one(file.absolute_path(), options));
        futures::future::try_join_all(futures).await?;
        Ok(())
    }

    /// Spec §4.5.3: copy the version directory (and all its contents)
    /// into `destination`, but NOT the deployment manifest file itself.
    async fn copy_signing_dependencies(
        &self,
        file: &Path,
        destination: &Path,
        _options: &SigningOptions,
    ) -> Result<(), SigningError> {
        let directory = file.parent().ok_or_else(|| {
            SigningError::input_validation("deployment manifest has no parent directory")
        })?;

        if let Some(version_dir) = locate_version_directory(directory)? {
            let destination = destination.to_path_buf();
            tokio::task::spawn_blocking(move || copy_dir_recursive(&version_dir, &destination))
                .await??;
        }

        Ok(())
    }
}

struct RenamedFile {
    original: PathBuf,
    renamed: PathBuf,
}

/// The unique immediate subdirectory of `directory`, if any. More than
/// one candidate is ambiguous and fatal; zero is a legal degenerate case
/// (spec §8 scenario 5).
fn locate_version_directory(directory: &Path) -> Result<Option<PathBuf>, SigningError> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }

    match dirs.len() {
        0 => Ok(None),
        1 => Ok(Some(dirs.remove(0))),
        n => Err(SigningError::signing(format!(
            "ambiguous version directory under {}: found {n} candidates",
            directory.display(),
        ))),
    }
}

/// The unique `*.manifest` file within `version_dir`, if any.
fn locate_version_manifest(version_dir: &Path) -> Result<Option<PathBuf>, SigningError> {
    let mut manifests = Vec::new();
    for entry in std::fs::read_dir(version_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && has_extension(&entry.path(), "manifest") {
            manifests.push(entry.path());
        }
    }

    match manifests.len() {
        0 => Ok(None),
        1 => Ok(Some(manifests.remove(0))),
        n => Err(SigningError::signing(format!(
            "ambiguous per-version manifest under {}: found {n} candidates",
            version_dir.display(),
        ))),
    }
}

/// Rename every `*.deploy` file found anywhere under `version_dir`,
/// dropping the suffix (`MyApp.dll.deploy` -> `MyApp.dll`).
fn rename_deploy_files(version_dir: &Path) -> Result<Vec<RenamedFile>, SigningError> {
    let mut candidates = Vec::new();
    for entry in walkdir::WalkDir::new(version_dir) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() && has_extension(entry.path(), "deploy") {
            candidates.push(entry.path().to_path_buf());
        }
    }
    candidates.sort();

    let mut renamed = Vec::with_capacity(candidates.len());
    for original in candidates {
        let target = original.with_extension("");
        std::fs::rename(&original, &target)?;
        renamed.push(RenamedFile {
            original,
            renamed: target,
        });
    }
    Ok(renamed)
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir entries are rooted at src");
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregating_signer::AggregatingSigner,
        capabilities::testing::{RecordingManifestSigner, RecordingManifestUpdateUtility},
        leaf_signer::DefaultPeSigner,
        options::SigningOptionsBuilder,
        testutil::{test_certificate, test_logger, test_signing_key},
    };
    use cryptographic_message_syntax::Certificate;
    use std::time::Duration;

    struct StaticCertificateProvider(Certificate);

    #[async_trait]
    impl CertificateProvider for StaticCertificateProvider {
        async fn get_certificate(&self) -> Result<Certificate, SigningError> {
            Ok(self.0.clone())
        }
    }

    struct StaticKeyProvider;

    #[async_trait]
    impl SignatureAlgorithmProvider for StaticKeyProvider {
        async fn get_signing_key(
            &self,
        ) -> Result<cryptographic_message_syntax::SigningKey, SigningError> {
            Ok(test_signing_key())
        }
    }

    fn make_signer(
        update_utility: Arc<RecordingManifestUpdateUtility>,
        xmldsig: Arc<RecordingManifestSigner>,
        publisher_name: Option<&str>,
    ) -> (ApplicationManifestSigner, Arc<SigningOptions>) {
        let aggregating = Arc::new(AggregatingSigner::new(
            test_logger(),
            vec![],
            Arc::new(DefaultPeSigner::new(test_logger())),
        ));

        let mut builder = SigningOptionsBuilder::new()
            .application_name("ApplicationName")
            .file_hash_algorithm("sha256")
            .description_url("https://description.test");
        if let Some(name) = publisher_name {
            builder = builder.publisher_name(name);
        }
        let options = Arc::new(builder.build().unwrap());

        let signer = ApplicationManifestSigner::new(
            test_logger(),
            aggregating,
            Arc::new(StaticCertificateProvider(test_certificate())),
            Arc::new(StaticKeyProvider),
            xmldsig,
            update_utility,
            RetryConfig {
                delay: Duration::from_millis(1),
                max_retries: 1,
            },
        );

        (signer, options)
    }

    #[tokio::test]
    async fn success_path_builds_expected_argument_strings() {
        let fixture = crate::testutil::write_deploy_fixture(
            "MyApp",
            "MyApp_1_0_0_0",
            &[
                ("MyApp.dll.manifest", b"<manifest/>"),
                ("MyApp.dll.deploy", b"dll-bytes"),
                ("MyApp.exe.deploy", b"exe-bytes"),
                ("MyApp.json.deploy", b"{}"),
            ],
        );

        let utility = Arc::new(RecordingManifestUpdateUtility::succeeding());
        let xmldsig = Arc::new(RecordingManifestSigner::default());
        let (signer, options) = make_signer(utility.clone(), xmldsig.clone(), Some("PublisherName"));

        signer
            .sign_one(&fixture.manifest_path, &options)
            .await
            .unwrap();

        let calls = utility.call_args();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0],
            format!(
                "-update \"{}/MyApp.dll.manifest\" -a sha256RSA -n \"ApplicationName\"",
                fixture.version_dir.display(),
            )
        );
        assert_eq!(
            calls[1],
            format!(
                "-update \"{}\" -a sha256RSA -n \"ApplicationName\" -pub \"PublisherName\" -appm \"{}/MyApp.dll.manifest\" -SupportURL https://description.test/",
                fixture.manifest_path.display(),
                fixture.version_dir.display(),
            )
        );

        // Every *.deploy name exists again after return.
        assert!(fixture.version_dir.join("MyApp.dll.deploy").exists());
        assert!(fixture.version_dir.join("MyApp.exe.deploy").exists());
        assert!(fixture.version_dir.join("MyApp.json.deploy").exists());
        assert!(!fixture.version_dir.join("MyApp.dll").exists());
    }

    #[tokio::test]
    async fn missing_publisher_name_falls_back_to_certificate_subject() {
        let fixture = crate::testutil::write_deploy_fixture(
            "MyApp",
            "MyApp_1_0_0_0",
            &[("MyApp.dll.manifest", b"<manifest/>"), ("MyApp.dll.deploy", b"x")],
        );

        let utility = Arc::new(RecordingManifestUpdateUtility::succeeding());
        let xmldsig = Arc::new(RecordingManifestSigner::default());
        let (signer, options) = make_signer(utility.clone(), xmldsig, None);

        signer
            .sign_one(&fixture.manifest_path, &options)
            .await
            .unwrap();

        let calls = utility.call_args();
        let subject = test_certificate().subject().user_friendly_str().unwrap();
        assert!(calls[1].contains(&format!("-pub \"{subject}\"")));
    }

    #[tokio::test]
    async fn missing_version_directory_skips_manifest_steps() {
        let root = tempfile::Builder::new()
            .prefix("signbroker-deploy-")
            .tempdir()
            .unwrap();
        let manifest_path = root.path().join("MyApp.application");
        std::fs::write(&manifest_path, b"<asmv1:assembly/>").unwrap();

        let utility = Arc::new(RecordingManifestUpdateUtility::succeeding());
        let xmldsig = Arc::new(RecordingManifestSigner::default());
        let (signer, options) = make_signer(utility.clone(), xmldsig.clone(), Some("PublisherName"));

        signer.sign_one(&manifest_path, &options).await.unwrap();

        let calls = utility.call_args();
        assert_eq!(calls.len(), 1, "step 6 is skipped with no companion manifest");
        assert!(!calls[0].contains("-appm"));
        assert_eq!(xmldsig.calls.lock().unwrap().len(), 1, "only the deployment manifest is xmldsig-signed");
    }

    #[tokio::test]
    async fn utility_failure_after_retry_restores_deploy_names() {
        let fixture = crate::testutil::write_deploy_fixture(
            "MyApp",
            "MyApp_1_0_0_0",
            &[("MyApp.dll.manifest", b"<manifest/>"), ("MyApp.dll.deploy", b"x")],
        );

        let utility = Arc::new(RecordingManifestUpdateUtility::failing());
        let xmldsig = Arc::new(RecordingManifestSigner::default());
        let (signer, options) = make_signer(utility.clone(), xmldsig, Some("PublisherName"));

        let err = signer.sign_one(&fixture.manifest_path, &options).await.unwrap_err();
        assert!(matches!(err, SigningError::ExternalUtility { .. }));

        // Retried exactly once (two attempts total) before giving up.
        assert_eq!(utility.call_args().len(), 2);
        assert!(fixture.version_dir.join("MyApp.dll.deploy").exists());
        assert!(!fixture.version_dir.join("MyApp.dll").exists());
    }
}
