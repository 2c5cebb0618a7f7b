//! Shared library collection for dynamically linked guest binaries.
//!
//! The platform's dynamic linker is asked (in trace mode, via `ldd`) which
//! shared objects it would load for each input. The collected canonical
//! paths end up in the guest's `/lib`, and every directory a library was
//! resolved from becomes a guest symlink to `/lib` so lookups through any
//! of the original search paths keep working.

use std::collections::{BTreeMap, BTreeSet};
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::{debug, warn};

use super::elf;

/// Shared libraries resolved for a set of input binaries.
///
/// Maps the canonical absolute path of each library to the directory the
/// dynamic linker reported it from.
#[derive(Debug, Default)]
pub struct LibCollection {
    libs: BTreeMap<Utf8PathBuf, Utf8PathBuf>,
    search_paths: BTreeSet<Utf8PathBuf>,
}

impl LibCollection {
    /// Canonical paths of all collected libraries.
    pub fn libs(&self) -> impl Iterator<Item = &Utf8Path> {
        self.libs.keys().map(Utf8PathBuf::as_path)
    }

    /// Directories the libraries were resolved from.
    pub fn search_paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.search_paths.iter().map(Utf8PathBuf::as_path)
    }

    pub fn is_empty(&self) -> bool {
        self.libs.is_empty()
    }

    pub(crate) fn add(&mut self, reported: &Utf8Path) -> Result<()> {
        let canonical = reported
            .canonicalize_utf8()
            .with_context(|| format!("Failed to canonicalize library path {reported}"))?;
        let search_path = reported
            .parent()
            .ok_or_else(|| eyre!("library path {reported} has no parent directory"))?;

        self.search_paths.insert(search_path.to_owned());
        self.libs.insert(canonical, search_path.to_owned());

        Ok(())
    }
}

/// Collect the dynamic libraries required by the given input files.
///
/// Statically linked and non-ELF inputs contribute nothing. Duplicate
/// libraries across inputs collapse to a single entry.
pub fn collect_libs<'a>(
    inputs: impl IntoIterator<Item = &'a Utf8Path>,
) -> Result<LibCollection> {
    let mut collection = LibCollection::default();

    for input in inputs {
        if !elf::is_dynamic(input)? {
            debug!("Not dynamically linked, no libraries to collect: {input}");
            continue;
        }

        for reported in trace_loaded_objects(input)? {
            collection.add(&reported)?;
        }
    }

    Ok(collection)
}

/// Run the dynamic linker in trace mode for a single input file and return
/// the library paths it reports.
fn trace_loaded_objects(input: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let output = Command::new("ldd")
        .arg(input)
        .output()
        .with_context(|| format!("Failed to invoke dynamic linker for {input}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(eyre!(
            "dynamic linker failed for {input}: {}",
            stderr.trim()
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut paths = Vec::new();

    for line in stdout.lines() {
        match parse_linker_line(line) {
            Some(path) => paths.push(Utf8PathBuf::from(path)),
            None => {
                // Virtual entries like linux-vdso carry no path. Anything
                // else unparseable would break the guest, so make it
                // visible.
                if line.contains("not found") {
                    warn!("Unresolved library for {input}: {}", line.trim());
                }
            }
        }
    }

    debug!("Collected {} libraries for {input}", paths.len());

    Ok(paths)
}

/// Extract the host path from one line of linker trace output.
///
/// Lines look like one of:
/// ```text
///     linux-vdso.so.1 (0x00007ffe5a7d2000)
///     libc.so.6 => /usr/lib/libc.so.6 (0x00007f2d8c000000)
///     /lib64/ld-linux-x86-64.so.2 (0x00007f2d8c2f1000)
/// ```
fn parse_linker_line(line: &str) -> Option<&str> {
    let candidate = match line.split_once("=>") {
        Some((_, rest)) => rest.split_whitespace().next()?,
        None => line.split_whitespace().next()?,
    };

    candidate.starts_with('/').then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_linker_line() {
        let cases = [
            ("\tlinux-vdso.so.1 (0x00007ffe5a7d2000)", None),
            (
                "\tlibc.so.6 => /usr/lib/libc.so.6 (0x00007f2d8c000000)",
                Some("/usr/lib/libc.so.6"),
            ),
            (
                "\t/lib64/ld-linux-x86-64.so.2 (0x00007f2d8c2f1000)",
                Some("/lib64/ld-linux-x86-64.so.2"),
            ),
            ("\tlibmissing.so => not found", None),
            ("", None),
        ];

        for (line, expected) in cases {
            assert_eq!(parse_linker_line(line), expected, "line: {line:?}");
        }
    }

    #[test]
    fn test_collection_dedups_and_tracks_search_paths() {
        let dir = tempfile::tempdir().unwrap();
        let lib = camino::Utf8PathBuf::try_from(dir.path().join("libfoo.so.1")).unwrap();
        std::fs::write(&lib, b"lib").unwrap();

        let mut collection = LibCollection::default();
        collection.add(&lib).unwrap();
        collection.add(&lib).unwrap();

        assert_eq!(collection.libs().count(), 1);
        assert_eq!(
            collection.search_paths().collect::<Vec<_>>(),
            vec![lib.parent().unwrap()]
        );
    }

    #[test]
    fn test_collect_libs_skips_static_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::try_from(dir.path().join("script")).unwrap();
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();

        let collection = collect_libs([path.as_path()]).unwrap();
        assert!(collection.is_empty());
    }
}
