//! Assembly of the boot-time RAM filesystem archive.
//!
//! The archive carries the main binary as `/main`, a guest init program as
//! `/init` (or a symlink to `/main` in standalone mode), additional files
//! under `/data`, kernel modules under `/lib/modules`, and the shared
//! libraries the binaries are linked against under `/lib`.

pub mod cpio;
pub mod vfs;

use std::fs::File;
use std::io::{BufWriter, Read};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::{debug, info};

use crate::arch::Arch;
use crate::initramfs::vfs::Tree;
use crate::sys::libs::{self, LibCollection};
use crate::sys::elf;

const DATA_DIR: &str = "data";
const LIBS_DIR: &str = "lib";
const MODULES_DIR: &str = "lib/modules";

/// What goes into the archive.
#[derive(Debug, Clone, Default)]
pub struct InitramfsSpec {
    /// The main binary, placed at `/main`. Its architecture selects the
    /// bundled init program.
    pub binary: Utf8PathBuf,

    /// Additional files, placed under `/data` by basename.
    pub files: Vec<Utf8PathBuf>,

    /// Kernel module files, placed under `/lib/modules` by basename.
    pub modules: Vec<Utf8PathBuf>,

    /// Run the main binary directly as PID 1 instead of the bundled init
    /// program. The binary is then responsible for a clean shutdown.
    pub standalone_init: bool,

    /// Keep the archive file on disposal instead of deleting it.
    pub keep: bool,
}

/// A built archive on disk together with its disposal action.
///
/// Dropping the handle removes the file unless `keep` was requested; call
/// [`InitramfsArchive::cleanup`] to observe removal errors.
#[derive(Debug)]
pub struct InitramfsArchive {
    path: Utf8PathBuf,
    keep: bool,
    disposed: bool,
}

impl InitramfsArchive {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Run the disposal action: delete the archive file, or keep it and
    /// report its path.
    pub fn cleanup(mut self) -> Result<()> {
        self.dispose()
    }

    fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        if self.keep {
            info!("Keeping initramfs archive: {}", self.path);
            return Ok(());
        }

        debug!("Removing initramfs archive: {}", self.path);
        std::fs::remove_file(&self.path)
            .with_context(|| format!("Failed to remove initramfs archive {}", self.path))
    }
}

impl Drop for InitramfsArchive {
    fn drop(&mut self) {
        // Last resort on panic or early-return paths.
        let _ = self.dispose();
    }
}

/// Build the archive for the given spec and write it to a temporary file.
pub fn build(spec: &InitramfsSpec) -> Result<InitramfsArchive> {
    let arch = elf::read_arch(&spec.binary).context("Reading main binary architecture")?;

    let inputs = std::iter::once(&spec.binary)
        .chain(spec.files.iter())
        .map(Utf8PathBuf::as_path);
    let collected = libs::collect_libs(inputs).context("Collecting shared libraries")?;

    let tree = build_tree(spec, arch, &collected)?;

    let mut tmp = tempfile::Builder::new()
        .prefix("initramfs")
        .tempfile()
        .context("Failed to create initramfs archive file")?;

    cpio::Writer::new(BufWriter::new(tmp.as_file_mut()))
        .write_tree(&tree)
        .context("Failed to write initramfs archive")?;

    let (_, path) = tmp.keep().context("Failed to persist initramfs archive")?;
    let path = Utf8PathBuf::try_from(path)?;
    debug!("Initramfs archive created: {path}");

    Ok(InitramfsArchive {
        path,
        keep: spec.keep,
        disposed: false,
    })
}

/// Populate the file tree. No file content is read here; regular files
/// carry open functions consumed during serialization.
fn build_tree(spec: &InitramfsSpec, arch: Arch, libs: &LibCollection) -> Result<Tree> {
    let mut tree = Tree::new();

    add_host_file(&mut tree, Utf8Path::new("main"), &spec.binary, Some(0o755))?;

    if spec.standalone_init {
        tree.add_symlink(Utf8Path::new("init"), "main")
            .map_err(|err| eyre!("Failed to add init symlink: {err}"))?;
    } else {
        let init = init_program_for(arch)?;
        add_host_file(&mut tree, Utf8Path::new("init"), &init, Some(0o755))?;
    }

    // The fixed guest layout exists even when its directories stay empty.
    for dir in [DATA_DIR, LIBS_DIR, MODULES_DIR] {
        tree.add_dir(Utf8Path::new(dir))
            .map_err(|err| eyre!("Failed to add directory {dir}: {err}"))?;
    }

    add_files_to(&mut tree, DATA_DIR, &spec.files, None)?;
    add_files_to(&mut tree, MODULES_DIR, &spec.modules, None)?;

    for lib in libs.libs() {
        let name = lib
            .file_name()
            .ok_or_else(|| eyre!("library path {lib} has no file name"))?;
        add_host_file(
            &mut tree,
            &Utf8Path::new(LIBS_DIR).join(name),
            lib,
            Some(0o755),
        )?;
    }

    let libs_root = format!("/{LIBS_DIR}");
    for search_path in libs.search_paths() {
        // The libraries' own directory is the symlink target.
        if search_path.as_str() == libs_root {
            continue;
        }
        tree.add_symlink(search_path, &libs_root)
            .map_err(|err| eyre!("Failed to link search path {search_path}: {err}"))?;
    }

    Ok(tree)
}

/// Add each source file below `dir` using its basename.
fn add_files_to(
    tree: &mut Tree,
    dir: &str,
    files: &[Utf8PathBuf],
    mode: Option<u32>,
) -> Result<()> {
    for file in files {
        let name = file
            .file_name()
            .ok_or_else(|| eyre!("file path {file} has no file name"))?;
        add_host_file(tree, &Utf8Path::new(dir).join(name), file, mode)?;
    }
    Ok(())
}

/// Add a host file at `dest`, deferring content reads to serialization.
///
/// Without an explicit mode the host's permission bits are kept.
fn add_host_file(
    tree: &mut Tree,
    dest: &Utf8Path,
    src: &Utf8Path,
    mode: Option<u32>,
) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = src
        .metadata()
        .with_context(|| format!("Failed to stat {src}"))?;
    let mode = mode.unwrap_or(metadata.permissions().mode() & 0o777);

    let source = src.to_owned();
    let open: vfs::OpenFn = Box::new(move || {
        File::open(&source).map(|file| Box::new(file) as Box<dyn Read + Send>)
    });

    tree.add_file(dest, open, metadata.len(), mode)
        .map_err(|err| eyre!("Failed to add {src} as {dest}: {err}"))
}

/// Locate the bundled guest init program for the architecture.
///
/// Searched in order: `$VIRTRUN_INIT_DIR`, the directory of the running
/// executable, `/usr/share/virtrun`.
fn init_program_for(arch: Arch) -> Result<Utf8PathBuf> {
    let name = format!("virtrun-init-{arch}");
    let mut candidates = Vec::new();

    if let Ok(dir) = std::env::var("VIRTRUN_INIT_DIR") {
        candidates.push(Utf8PathBuf::from(dir).join(&name));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Ok(dir) = Utf8PathBuf::try_from(dir.to_path_buf()) {
                candidates.push(dir.join(&name));
            }
        }
    }

    candidates.push(Utf8Path::new("/usr/share/virtrun").join(&name));

    candidates
        .iter()
        .find(|path| path.is_file())
        .cloned()
        .ok_or_else(|| {
            eyre!(
                "guest init program {name} not found (searched: {})",
                candidates
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testelf::minimal_elf;
    use ::elf::abi::EM_X86_64;

    fn collect_paths(tree: &Tree) -> Vec<String> {
        let mut paths = Vec::new();
        tree.walk::<std::convert::Infallible, _>(&mut |path, _| {
            paths.push(path.to_owned());
            Ok(())
        })
        .unwrap();
        paths
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
            Self { _dir: dir, root }
        }

        fn file(&self, name: &str, content: &[u8]) -> Utf8PathBuf {
            let path = self.root.join(name);
            std::fs::write(&path, content).unwrap();
            path
        }

        fn static_binary(&self, name: &str) -> Utf8PathBuf {
            self.file(name, &minimal_elf(EM_X86_64))
        }
    }

    fn standalone_spec(fixture: &Fixture) -> InitramfsSpec {
        InitramfsSpec {
            binary: fixture.static_binary("app.test"),
            standalone_init: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_tree_layout() {
        let fixture = Fixture::new();
        let mut spec = standalone_spec(&fixture);
        spec.files = vec![fixture.file("input.txt", b"text")];
        spec.modules = vec![fixture.file("dummy.ko", b"module")];

        let tree = build_tree(&spec, Arch::Amd64, &LibCollection::default()).unwrap();

        assert_eq!(
            collect_paths(&tree),
            vec![
                "main",
                "init",
                "data",
                "data/input.txt",
                "lib",
                "lib/modules",
                "lib/modules/dummy.ko",
            ]
        );
    }

    #[test]
    fn test_tree_links_search_paths() {
        let fixture = Fixture::new();
        let spec = standalone_spec(&fixture);

        let lib = fixture.file("libgreet.so.1", b"lib");
        let mut libs = LibCollection::default();
        libs.add(&lib).unwrap();

        let tree = build_tree(&spec, Arch::Amd64, &libs).unwrap();
        let paths = collect_paths(&tree);

        assert!(paths.contains(&"lib/libgreet.so.1".to_owned()));

        // The directory the library was found in points at /lib.
        let search_path = lib.parent().unwrap().as_str().trim_start_matches('/');
        assert!(paths.contains(&search_path.to_owned()), "{paths:?}");
    }

    #[test]
    fn test_file_name_conflict() {
        let fixture = Fixture::new();
        let mut spec = standalone_spec(&fixture);
        let other = tempfile::tempdir().unwrap();
        let conflicting = Utf8PathBuf::try_from(other.path().join("input.txt")).unwrap();
        std::fs::write(&conflicting, b"other").unwrap();
        spec.files = vec![fixture.file("input.txt", b"text"), conflicting];

        assert!(build_tree(&spec, Arch::Amd64, &LibCollection::default()).is_err());
    }

    #[test]
    fn test_build_and_cleanup() {
        let fixture = Fixture::new();
        let spec = standalone_spec(&fixture);

        let archive = build(&spec).unwrap();
        let path = archive.path().to_owned();

        let content = std::fs::read(&path).unwrap();
        assert!(content.starts_with(b"070701"));
        assert_eq!(content.len() % 512, 0);

        archive.cleanup().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_build_keeps_archive_on_request() {
        let fixture = Fixture::new();
        let mut spec = standalone_spec(&fixture);
        spec.keep = true;

        let archive = build(&spec).unwrap();
        let path = archive.path().to_owned();

        archive.cleanup().unwrap();
        assert!(path.exists());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_drop_removes_archive() {
        let fixture = Fixture::new();
        let archive = build(&standalone_spec(&fixture)).unwrap();
        let path = archive.path().to_owned();

        drop(archive);
        assert!(!path.exists());
    }

    #[test]
    fn test_build_fails_for_non_elf_binary() {
        let fixture = Fixture::new();
        let spec = InitramfsSpec {
            binary: fixture.file("script.sh", b"#!/bin/sh\n"),
            standalone_init: true,
            ..Default::default()
        };

        assert!(build(&spec).is_err());
    }

    #[test]
    fn test_init_program_lookup() {
        let fixture = Fixture::new();
        let init = fixture.file("virtrun-init-amd64", b"init");

        std::env::set_var("VIRTRUN_INIT_DIR", fixture.root.as_str());
        let found = init_program_for(Arch::Amd64);
        std::env::remove_var("VIRTRUN_INIT_DIR");

        assert_eq!(found.unwrap(), init);
    }
}
