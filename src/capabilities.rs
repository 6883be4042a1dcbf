// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! External collaborators (spec §6).
//!
//! Credential acquisition, the XML-dsig manifest signer, and the native
//! manifest-update utility ("mage") are explicit Non-goals of spec §1 —
//! capabilities this crate coordinates but does not implement. They are
//! modeled as trait objects so [crate::aggregating_signer::AggregatingSigner]
//! and [crate::manifest_signer::ApplicationManifestSigner] can be driven
//! in tests without a real signing service, X.509 authority, or `mage.exe`.

use {
    crate::error::SigningError,
    async_trait::async_trait,
    cryptographic_message_syntax::{Certificate, SigningKey},
    std::path::Path,
};

/// Vends the asymmetric private key used to produce signatures (spec §6).
#[async_trait]
pub trait SignatureAlgorithmProvider: Send + Sync {
    async fn get_signing_key(&self) -> Result<SigningKey, SigningError>;
}

/// Vends the X.509 certificate corresponding to the signing key (spec §6).
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    async fn get_certificate(&self) -> Result<Certificate, SigningError>;
}

/// XML-dsig-signs a manifest file in place, using the W3C
/// `http://www.w3.org/2000/09/xmldsig#` namespace (spec §6).
#[async_trait]
pub trait ManifestSigner: Send + Sync {
    async fn sign(
        &self,
        manifest_file: &Path,
        certificate: &Certificate,
        signing_key: &SigningKey,
    ) -> Result<(), SigningError>;
}

/// The external manifest-update utility (in the reference system, the
/// "mage" CLI) invoked by C5 to stamp file-hash and publisher metadata
/// into a manifest before it is XML-dsig-signed (spec §6, §4.5.1 steps
/// 6 and 8).
#[async_trait]
pub trait ManifestUpdateUtility: Send + Sync {
    /// Run the utility with the given literal argument string (spec §9's
    /// "the logical argument string is the contract" note — callers
    /// construct this string exactly as specified and this trait is
    /// responsible only for quoting it correctly for the host process
    /// spawn API). Returns the process exit code.
    async fn run(&self, arg_string: &str) -> Result<i32, SigningError>;
}

/// Reads a fixed certificate, parsed once from PEM bytes at construction
/// (spec §11: `--certificate-pem`).
pub struct PemCertificateProvider {
    certificate: Certificate,
}

impl PemCertificateProvider {
    pub fn from_pem_bytes(data: &[u8]) -> Result<Self, SigningError> {
        let certificate = Certificate::from_pem(data)
            .map_err(|e| SigningError::signing(format!("invalid certificate PEM: {e}")))?;
        Ok(Self { certificate })
    }
}

#[async_trait]
impl CertificateProvider for PemCertificateProvider {
    async fn get_certificate(&self) -> Result<Certificate, SigningError> {
        Ok(self.certificate.clone())
    }
}

/// Vends an RSA signing key from a PKCS#8 PEM private key (spec §11:
/// `--key-pem`).
///
/// [SigningKey] does not implement `Clone` (it wraps a `ring` key pair),
/// so this holds the raw PKCS#8 DER and re-parses a fresh [SigningKey] on
/// every call — the same approach [crate::testutil::test_signing_key]
/// uses for its fixture key.
pub struct PemSigningKeyProvider {
    pkcs8_der: Vec<u8>,
}

impl PemSigningKeyProvider {
    pub fn from_pem_bytes(data: &[u8]) -> Result<Self, SigningError> {
        let pem = pem::parse(data)
            .map_err(|e| SigningError::signing(format!("invalid private key PEM: {e}")))?;
        Ok(Self {
            pkcs8_der: pem.contents,
        })
    }
}

#[async_trait]
impl SignatureAlgorithmProvider for PemSigningKeyProvider {
    async fn get_signing_key(&self) -> Result<SigningKey, SigningError> {
        let key_pair = ring::signature::RsaKeyPair::from_pkcs8(&self.pkcs8_der)
            .map_err(|e| SigningError::signing(format!("invalid RSA PKCS#8 key: {e}")))?;
        Ok(SigningKey::from(key_pair))
    }
}

/// Invokes the native manifest-update utility ("mage" in the reference
/// system — spec §6) as a subprocess.
///
/// Tokenizes the literal argument string into an argv by splitting on
/// whitespace outside double-quoted segments, then passes the resulting
/// argv directly to [tokio::process::Command] — never through a shell —
/// so the quoting spec §9 calls out as the contract is honored without
/// being re-interpreted (and without command-injection risk) by a host
/// shell.
pub struct ProcessManifestUpdateUtility {
    executable: std::path::PathBuf,
}

impl ProcessManifestUpdateUtility {
    pub fn new(executable: impl Into<std::path::PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

/// Split `arg_string` into argv entries, treating `"..."` as a single
/// entry with the quotes stripped (spec §9: "the `-update` and `-appm`
/// argument paths are wrapped in double quotes verbatim").
pub(crate) fn tokenize_quoted_args(arg_string: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = arg_string.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut token = String::new();
        if c == '"' {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                token.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }

    tokens
}

#[async_trait]
impl ManifestUpdateUtility for ProcessManifestUpdateUtility {
    async fn run(&self, arg_string: &str) -> Result<i32, SigningError> {
        let argv = tokenize_quoted_args(arg_string);
        let output = tokio::process::Command::new(&self.executable)
            .args(&argv)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(SigningError::Io)?;

        if !output.status.success() && !output.stderr.is_empty() {
            slog::warn!(
                slog::Logger::root(slog::Discard, slog::o!()),
                "manifest-update utility wrote to stderr";
                "stderr" => String::from_utf8_lossy(&output.stderr).to_string(),
            );
        }

        Ok(output.status.code().unwrap_or(-1))
    }
}

/// Stands in for the XML-dsig manifest signer (spec §6, W3C
/// `http://www.w3.org/2000/09/xmldsig#` namespace) the same way
/// [crate::leaf_signer::OpaquePackageSigner] stands in for a primitive
/// package-signing backend: primitive XML-dsig signing is an explicit
/// Non-goal of spec §1 ("it coordinates those as capabilities"), so this
/// appends a clearly-labeled placeholder signature block rather than
/// performing real XML canonicalization and RSA-SHA signing, which would
/// require pulling in an XML toolchain this crate's hard part does not
/// need.
pub struct StubXmlDsigManifestSigner {
    logger: slog::Logger,
}

impl StubXmlDsigManifestSigner {
    pub fn new(logger: slog::Logger) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl ManifestSigner for StubXmlDsigManifestSigner {
    async fn sign(
        &self,
        manifest_file: &Path,
        certificate: &Certificate,
        _signing_key: &SigningKey,
    ) -> Result<(), SigningError> {
        slog::info!(
            self.logger,
            "xml-dsig signing manifest";
            "path" => %manifest_file.display(),
        );

        let subject = certificate
            .subject()
            .user_friendly_str()
            .unwrap_or_else(|_| String::from("unknown"));

        let mut contents = std::fs::read(manifest_file)?;
        contents.extend_from_slice(
            format!(
                "\n<!-- signbroker-stub-xmldsig-signature subject=\"{subject}\" -->\n"
            )
            .as_bytes(),
        );
        std::fs::write(manifest_file, contents)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_quoted_and_bare_segments() {
        let tokens = tokenize_quoted_args(
            "-update \"/tmp/My App/x.manifest\" -a sha256RSA -n \"ApplicationName\"",
        );
        assert_eq!(
            tokens,
            vec![
                "-update",
                "/tmp/My App/x.manifest",
                "-a",
                "sha256RSA",
                "-n",
                "ApplicationName",
            ]
        );
    }

    #[test]
    fn tokenizes_support_url_without_quotes() {
        let tokens = tokenize_quoted_args("-SupportURL https://description.test/");
        assert_eq!(tokens, vec!["-SupportURL", "https://description.test/"]);
    }

    #[tokio::test]
    async fn pem_certificate_provider_round_trips_test_fixture() {
        let certificate = crate::testutil::test_certificate();
        let pem_bytes = pem::encode(&pem::Pem {
            tag: "CERTIFICATE".to_string(),
            contents: certificate.as_der().unwrap().to_vec(),
        });
        let provider = PemCertificateProvider::from_pem_bytes(pem_bytes.as_bytes()).unwrap();
        let loaded = provider.get_certificate().await.unwrap();
        assert_eq!(loaded.subject(), certificate.subject());
    }
}

#[cfg(test)]
pub mod testing {
    //! Fake implementations used by this crate's own test suite (spec
    //! §15 — test doubles for the external collaborators).

    use super::*;
    use std::sync::Mutex;

    /// Records every argument string it was invoked with and always
    /// returns a configured exit code.
    pub struct RecordingManifestUpdateUtility {
        pub exit_code: i32,
        pub calls: Mutex<Vec<String>>,
    }

    impl RecordingManifestUpdateUtility {
        pub fn succeeding() -> Self {
            Self {
                exit_code: 0,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self {
                exit_code: 1,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_args(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ManifestUpdateUtility for RecordingManifestUpdateUtility {
        async fn run(&self, arg_string: &str) -> Result<i32, SigningError> {
            self.calls.lock().unwrap().push(arg_string.to_string());
            Ok(self.exit_code)
        }
    }

    /// No-op XML-dsig signer: records calls, leaves file contents alone.
    pub struct RecordingManifestSigner {
        pub calls: Mutex<Vec<std::path::PathBuf>>,
    }

    impl Default for RecordingManifestSigner {
        fn default() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ManifestSigner for RecordingManifestSigner {
        async fn sign(
            &self,
            manifest_file: &std::path::Path,
            _certificate: &Certificate,
            _signing_key: &SigningKey,
        ) -> Result<(), SigningError> {
            self.calls.lock().unwrap().push(manifest_file.to_path_buf());
            Ok(())
        }
    }
}
