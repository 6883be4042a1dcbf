// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Container provider / Container (spec §4.2, component C2).
//!
//! A [Container] opens a zip-format archive into a private temporary
//! workspace, enumerates its regular files, and re-packs the workspace
//! back over the original file on [Container::save]. All four recognized
//! container kinds (generic archives, NuGet/VSIX plugin packages,
//! application packages, application-package bundles) are zip archives at
//! the storage-format level; what differs between them is how the
//! dispatcher treats their contents (spec §4.4.2) and, for `.nupkg`, what
//! gets stripped on re-pack.

use {
    crate::{
        fileref::{has_any_extension, has_extension, FileRef},
        glob_matcher::FileMatcher,
    },
    std::{
        fs::File,
        io::{Read, Write},
        path::{Path, PathBuf},
    },
    tempfile::TempDir,
    thiserror::Error,
};

/// Error opening a file as a container (spec §7 `UnknownContainerError`).
#[derive(Debug, Error)]
pub enum ContainerOpenError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("container task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The recognized container kinds (spec §3), by extension, invariant
/// case-insensitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerKind {
    /// `.zip`, `.appxupload`, `.msixupload`, `.vsix` — generic zip-format
    /// archives with no special re-pack handling.
    Zip,
    /// `.nupkg` — a zip-format archive whose re-pack strips any prior
    /// package signature.
    NuGet,
    /// `.appx`, `.msix` — application packages.
    Appx,
    /// `.appxbundle`, `.msixbundle` — application-package bundles.
    AppxBundle,
}

/// Recognizes container kinds by extension and opens [Container] handles.
pub struct ContainerProvider;

impl ContainerProvider {
    pub fn is_zip_container(path: impl AsRef<Path>) -> bool {
        has_any_extension(path.as_ref(), &["zip", "appxupload", "msixupload", "vsix"])
    }

    pub fn is_nuget_container(path: impl AsRef<Path>) -> bool {
        has_extension(path.as_ref(), "nupkg")
    }

    pub fn is_appx_container(path: impl AsRef<Path>) -> bool {
        has_any_extension(path.as_ref(), &["appx", "msix"])
    }

    pub fn is_appx_bundle_container(path: impl AsRef<Path>) -> bool {
        has_any_extension(path.as_ref(), &["appxbundle", "msixbundle"])
    }

    /// Whether `path` is any recognized container kind.
    pub fn is_container(path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        Self::is_zip_container(path)
            || Self::is_nuget_container(path)
            || Self::is_appx_container(path)
            || Self::is_appx_bundle_container(path)
    }

    /// Classify `path`'s container kind, if any.
    pub fn kind_of(path: impl AsRef<Path>) -> Option<ContainerKind> {
        let path = path.as_ref();
        if Self::is_nuget_container(path) {
            Some(ContainerKind::NuGet)
        } else if Self::is_zip_container(path) {
            Some(ContainerKind::Zip)
        } else if Self::is_appx_bundle_container(path) {
            Some(ContainerKind::AppxBundle)
        } else if Self::is_appx_container(path) {
            Some(ContainerKind::Appx)
        } else {
            None
        }
    }

    /// Construct a new, unopened [Container] bound to `path`.
    pub fn get_container(path: impl Into<PathBuf>) -> Option<Container> {
        let path = path.into();
        Self::kind_of(&path).map(|kind| Container::new(path, kind))
    }
}

enum ContainerState {
    Closed,
    Open(TempDir),
    Disposed,
}

/// A handle to an opened, on-disk container (spec §4.2).
///
/// Lifecycle: `Closed` --`open()`--> `Open` --`save()`--> `Open` (repeatable)
/// --`dispose()`--> `Disposed` (idempotent, reachable from any state).
pub struct Container {
    path: PathBuf,
    kind: ContainerKind,
    state: ContainerState,
}

impl Container {
    pub fn new(path: PathBuf, kind: ContainerKind) -> Self {
        Self {
            path,
            kind,
            state: ContainerState::Closed,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, ContainerState::Open(_))
    }

    /// Extract the package into a private temporary directory.
    ///
    /// The extraction itself is blocking (`zip` is a synchronous crate),
    /// so it runs on the blocking thread pool and the calling task
    /// suspends, per spec §5's "container open/save" suspension point.
    pub async fn open(&mut self) -> Result<(), ContainerOpenError> {
        assert!(
            matches!(self.state, ContainerState::Closed),
            "Container::open called outside the Closed state"
        );

        let path = self.path.clone();
        let workdir = tokio::task::spawn_blocking(move || extract_zip(&path)).await??;
        self.state = ContainerState::Open(workdir);
        Ok(())
    }

    fn workdir(&self) -> &Path {
        match &self.state {
            ContainerState::Open(dir) => dir.path(),
            _ => panic!("Container method called outside the Open state"),
        }
    }

    /// All regular files within, in deterministic (lexicographic by
    /// relative path) order.
    pub fn get_files(&self) -> std::io::Result<Vec<FileRef>> {
        let root = self.workdir();
        let mut files = Vec::new();

        for entry in walkdir::WalkDir::new(root) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(root)
                .expect("walkdir entries are rooted at the workdir")
                .to_path_buf();

            files.push(FileRef::new(entry.path().to_path_buf(), relative));
        }

        files.sort_by(|a, b| {
            a.relative_path()
                .to_string_lossy()
                .cmp(&b.relative_path().to_string_lossy())
        });

        Ok(files)
    }

    /// Files matching an include-only glob matcher, applied against paths
    /// relative to the container root.
    pub fn get_files_matching(&self, matcher: &FileMatcher) -> std::io::Result<Vec<FileRef>> {
        Ok(self
            .get_files()?
            .into_iter()
            .filter(|f| matcher.is_match(&f.relative_path().to_string_lossy()))
            .collect())
    }

    /// Re-pack the working directory back over the original file,
    /// atomically (write to a sibling temp file, then rename).
    ///
    /// For `.nupkg`, strips any prior package signature file so the outer
    /// signing pass re-signs a clean package.
    pub async fn save(&mut self) -> Result<(), ContainerOpenError> {
        let root = self.workdir().to_path_buf();
        let original = self.path.clone();
        let kind = self.kind;

        tokio::task::spawn_blocking(move || repack_zip(&root, &original, kind)).await??;
        Ok(())
    }

    /// Release temporary storage. Idempotent; subsequent operations other
    /// than `dispose` are undefined once called.
    pub fn dispose(&mut self) -> std::io::Result<()> {
        match std::mem::replace(&mut self.state, ContainerState::Disposed) {
            ContainerState::Open(dir) => dir.close(),
            _ => Ok(()),
        }
    }
}

/// The name NuGet writes its package signature under, at the package root.
const NUGET_SIGNATURE_ENTRY: &str = ".signature.p7s";

fn extract_zip(path: &Path) -> Result<TempDir, ContainerOpenError> {
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let workdir = tempfile::Builder::new()
        .prefix("signbroker-container-")
        .tempdir()?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(enclosed) = entry.enclosed_name().map(|p| p.to_owned()) else {
            // Reject paths that would escape the extraction root (e.g.
            // `../../etc/passwd`) rather than letting them through; the
            // `zip` crate's `enclosed_name` already performs this check.
            continue;
        };
        let dest = workdir.path().join(&enclosed);

        if entry.is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;
        std::fs::write(&dest, buf)?;
    }

    Ok(workdir)
}

fn repack_zip(
    workdir: &Path,
    original: &Path,
    kind: ContainerKind,
) -> Result<(), ContainerOpenError> {
    let tmp_path = original.with_extension(format!(
        "{}.signbroker-tmp",
        original
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
    ));

    {
        let file = File::create(&tmp_path)?;
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(workdir) {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_file() {
                entries.push(entry.path().to_path_buf());
            }
        }
        entries.sort();

        for path in entries {
            let relative = path
                .strip_prefix(workdir)
                .expect("walkdir entries are rooted at workdir");

            if kind == ContainerKind::NuGet
                && relative.to_string_lossy() == NUGET_SIGNATURE_ENTRY
            {
                continue;
            }

            let name = relative.to_string_lossy().replace('\\', "/");
            writer.start_file(name, options)?;
            let data = std::fs::read(&path)?;
            writer.write_all(&data)?;
        }

        writer.finish()?;
    }

    std::fs::rename(&tmp_path, original)?;
    Ok(())
}
