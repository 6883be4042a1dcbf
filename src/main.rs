// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `signbroker` — CLI entry point (spec §11).
//!
//! A thin wrapper around the `signbroker-core` library: binds flags to a
//! [SigningOptions], wires up the external collaborators (§6) from
//! `--certificate-pem`/`--key-pem` or environment variables, and drives
//! [AggregatingSigner::sign] on a `tokio` multi-thread runtime. Follows
//! the teacher's `clap` 2.33 `App`/`SubCommand` CLI shape
//! (`tugger-apple-codesign/src/main.rs`), generalized from a single flat
//! command set to one primary `sign` subcommand.

use {
    anyhow::{anyhow, Context, Result},
    clap::{App, AppSettings, Arg, ArgMatches, SubCommand},
    signbroker_core::{
        aggregating_signer::AggregatingSigner,
        capabilities::{
            CertificateProvider, PemCertificateProvider, PemSigningKeyProvider,
            ProcessManifestUpdateUtility, SignatureAlgorithmProvider, StubXmlDsigManifestSigner,
        },
        config::RetryConfig,
        fileref::FileRef,
        glob_matcher::FileMatcher,
        leaf_signer::{DefaultPeSigner, LeafSigner, OpaquePackageSigner},
        logging::logger_from_verbosity,
        manifest_signer::ApplicationManifestSigner,
        options::SigningOptionsBuilder,
    },
    std::sync::Arc,
};

const CERTIFICATE_PEM_ENV_VAR: &str = "SIGNBROKER_CERTIFICATE_PEM";
const PRIVATE_KEY_PEM_ENV_VAR: &str = "SIGNBROKER_PRIVATE_KEY_PEM";
const DEFAULT_MAGE_PATH: &str = "mage";

const SIGN_ABOUT: &str = "\
Signs the given files, recursively discovering and signing nested
container contents (zip archives, Appx/Msix packages and bundles, NuGet
and VSIX plugin packages) before re-packing their outer container, and
routing ClickOnce/VSTO deployment manifests (.application/.vsto) through
the application-manifest signing protocol.

Unclaimed files are signed as portable executables if content-sniffing
identifies them as one; all other unclaimed files are left untouched.
";

fn build_app() -> App<'static, 'static> {
    App::new("signbroker")
        .setting(AppSettings::ArgRequiredElseHelp)
        .version(env!("CARGO_PKG_VERSION"))
        .about("Recursive container dispatcher and deployment-manifest signer")
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .global(true)
                .help("Increase log verbosity (-v for info, -vv for debug)"),
        )
        .subcommand(
            SubCommand::with_name("sign")
                .about("Sign one or more files")
                .long_about(SIGN_ABOUT)
                .arg(
                    Arg::with_name("files")
                        .required(true)
                        .multiple(true)
                        .help("Paths to the files to sign"),
                )
                .arg(
                    Arg::with_name("application_name")
                        .long("application-name")
                        .takes_value(true)
                        .help("Application name embedded in deployment manifests"),
                )
                .arg(
                    Arg::with_name("publisher_name")
                        .long("publisher-name")
                        .takes_value(true)
                        .help("Publisher name; derived from the certificate subject if unset"),
                )
                .arg(
                    Arg::with_name("description")
                        .long("description")
                        .takes_value(true)
                        .help("Publisher description"),
                )
                .arg(
                    Arg::with_name("description_url")
                        .long("description-url")
                        .takes_value(true)
                        .help("Publisher support URL (absolute)"),
                )
                .arg(
                    Arg::with_name("file_hash_algorithm")
                        .long("file-hash-algorithm")
                        .takes_value(true)
                        .default_value("sha256")
                        .help("Digest algorithm used for file hashes"),
                )
                .arg(
                    Arg::with_name("timestamp_hash_algorithm")
                        .long("timestamp-hash-algorithm")
                        .takes_value(true)
                        .help("Digest algorithm used for timestamp tokens; defaults to --file-hash-algorithm"),
                )
                .arg(
                    Arg::with_name("timestamp_service_url")
                        .long("timestamp-service-url")
                        .takes_value(true)
                        .help("Trusted timestamp authority URL"),
                )
                .arg(
                    Arg::with_name("pattern")
                        .long("pattern")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1)
                        .help(
                            "Glob pattern selecting files inside containers to sign; repeat to \
                             add more. Prefix with ! to exclude (e.g. !**/*.txt)",
                        ),
                )
                .arg(
                    Arg::with_name("no_recurse_containers")
                        .long("no-recurse-containers")
                        .help("Treat containers as opaque leaves instead of recursing into them"),
                )
                .arg(
                    Arg::with_name("certificate_pem")
                        .long("certificate-pem")
                        .takes_value(true)
                        .help(
                            "Path to a PEM-encoded X.509 certificate; falls back to the \
                             SIGNBROKER_CERTIFICATE_PEM environment variable",
                        ),
                )
                .arg(
                    Arg::with_name("key_pem")
                        .long("key-pem")
                        .takes_value(true)
                        .help(
                            "Path to a PEM-encoded PKCS#8 private key; falls back to the \
                             SIGNBROKER_PRIVATE_KEY_PEM environment variable",
                        ),
                )
                .arg(
                    Arg::with_name("mage_path")
                        .long("mage-path")
                        .takes_value(true)
                        .default_value(DEFAULT_MAGE_PATH)
                        .help("Path to the external manifest-update utility binary"),
                ),
        )
}

fn load_certificate_provider(args: &ArgMatches) -> Result<Arc<dyn CertificateProvider>> {
    let pem_bytes = match args.value_of("certificate_pem") {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("reading certificate PEM from {path}"))?,
        None => std::env::var(CERTIFICATE_PEM_ENV_VAR)
            .map(String::into_bytes)
            .map_err(|_| {
                anyhow!(
                    "no certificate provided: pass --certificate-pem or set {}",
                    CERTIFICATE_PEM_ENV_VAR
                )
            })?,
    };

    Ok(Arc::new(
        PemCertificateProvider::from_pem_bytes(&pem_bytes).context("parsing certificate PEM")?,
    ))
}

fn load_key_provider(args: &ArgMatches) -> Result<Arc<dyn SignatureAlgorithmProvider>> {
    let pem_bytes = match args.value_of("key_pem") {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("reading private key PEM from {path}"))?
        }
        None => std::env::var(PRIVATE_KEY_PEM_ENV_VAR)
            .map(String::into_bytes)
            .map_err(|_| {
                anyhow!(
                    "no private key provided: pass --key-pem or set {}",
                    PRIVATE_KEY_PEM_ENV_VAR
                )
            })?,
    };

    Ok(Arc::new(
        PemSigningKeyProvider::from_pem_bytes(&pem_bytes).context("parsing private key PEM")?,
    ))
}

/// Package-format leaf signers routed to by dispatch (spec §4.4.2 step 3):
/// stand-ins for the opaque Appx/Msix, NuGet, and VSIX signing backends
/// spec §1 lists as Non-goals ("primitive ... signing itself").
fn package_leaf_signers(logger: &slog::Logger) -> Vec<Arc<dyn LeafSigner>> {
    vec![
        Arc::new(OpaquePackageSigner::new(
            "appx-msix-signer",
            &["appx", "msix", "appxbundle", "msixbundle"],
            logger.clone(),
        )),
        Arc::new(OpaquePackageSigner::new(
            "nuget-signer",
            &["nupkg"],
            logger.clone(),
        )),
        Arc::new(OpaquePackageSigner::new(
            "vsix-signer",
            &["vsix"],
            logger.clone(),
        )),
    ]
}

async fn run_sign(args: &ArgMatches<'_>, logger: slog::Logger) -> Result<()> {
    let mut builder = SigningOptionsBuilder::new()
        .file_hash_algorithm(args.value_of("file_hash_algorithm").unwrap())
        .recurse_containers(!args.is_present("no_recurse_containers"));

    if let Some(v) = args.value_of("application_name") {
        builder = builder.application_name(v);
    }
    if let Some(v) = args.value_of("publisher_name") {
        builder = builder.publisher_name(v);
    }
    if let Some(v) = args.value_of("description") {
        builder = builder.description(v);
    }
    if let Some(v) = args.value_of("description_url") {
        builder = builder.description_url(v);
    }
    if let Some(v) = args.value_of("timestamp_hash_algorithm") {
        builder = builder.timestamp_hash_algorithm(v);
    }
    if let Some(v) = args.value_of("timestamp_service_url") {
        builder = builder.timestamp_service_url(v);
    }

    if let Some(patterns) = args.values_of("pattern") {
        let (matcher, anti_matcher) = FileMatcher::from_pattern_lines(patterns)
            .context("parsing --pattern glob list")?;
        if let Some(matcher) = matcher {
            builder = builder.matcher(matcher);
        }
        if let Some(anti_matcher) = anti_matcher {
            builder = builder.anti_matcher(anti_matcher);
        }
    }

    let options = Arc::new(builder.build().context("building signing options")?);

    let certificate_provider = load_certificate_provider(args)?;
    let key_provider = load_key_provider(args)?;
    let update_utility = Arc::new(ProcessManifestUpdateUtility::new(
        args.value_of("mage_path").unwrap_or(DEFAULT_MAGE_PATH),
    ));
    let xmldsig_signer = Arc::new(StubXmlDsigManifestSigner::new(logger.clone()));

    let default_signer = Arc::new(DefaultPeSigner::new(logger.clone()));

    // C5 recurses the renamed deploy payload through C4's container/
    // package signers (spec §4.5.1 step 4); those payload files are never
    // themselves `.application`/`.vsto`, so building this inner instance
    // without the manifest signer in its own leaf-signer list avoids a
    // circular `Arc<AggregatingSigner>` while preserving spec semantics.
    let payload_signer = Arc::new(AggregatingSigner::new(
        logger.clone(),
        package_leaf_signers(&logger),
        default_signer.clone(),
    ));

    let manifest_signer = Arc::new(ApplicationManifestSigner::new(
        logger.clone(),
        payload_signer,
        certificate_provider,
        key_provider,
        xmldsig_signer,
        update_utility,
        RetryConfig::from_env(),
    ));

    let mut leaf_signers = package_leaf_signers(&logger);
    leaf_signers.push(manifest_signer as Arc<dyn LeafSigner>);

    let top_level_signer = AggregatingSigner::new(logger, leaf_signers, default_signer);

    let files: Vec<FileRef> = args
        .values_of("files")
        .expect("files is a required argument")
        .map(|path| FileRef::top_level(path))
        .collect();

    top_level_signer
        .sign(files, options)
        .await
        .context("signing failed")
}

async fn main_impl() -> Result<()> {
    let app = build_app();
    let matches = app.get_matches();

    let verbosity = matches.occurrences_of("verbose");
    let logger_context = logger_from_verbosity(verbosity);

    match matches.subcommand() {
        ("sign", Some(args)) => run_sign(args, logger_context.logger.clone()).await,
        _ => Err(anyhow!("no subcommand given; see --help")),
    }
}

fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start tokio runtime");

    let exit_code = match runtime.block_on(main_impl()) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err:#}");
            1
        }
    };

    std::process::exit(exit_code)
}
