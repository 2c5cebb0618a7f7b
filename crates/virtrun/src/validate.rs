//! Up-front validation of everything a run needs from the host.

use camino::Utf8Path;
use color_eyre::eyre::{bail, eyre, Context};
use color_eyre::Result;

use crate::initramfs::InitramfsSpec;
use crate::qemu::CommandSpec;

/// Check that all referenced host files exist and the QEMU binary is
/// available before any work is done.
pub fn validate(command_spec: &CommandSpec, initramfs_spec: &InitramfsSpec) -> Result<()> {
    which::which(&command_spec.executable)
        .map_err(|err| eyre!("QEMU binary {}: {err}", command_spec.executable))?;

    readable_file(&command_spec.kernel).context("kernel file")?;
    readable_file(&initramfs_spec.binary).context("main binary")?;

    for file in &initramfs_spec.files {
        readable_file(file).context("additional file")?;
    }

    for module in &initramfs_spec.modules {
        readable_file(module).context("kernel module")?;
    }

    Ok(())
}

fn readable_file(path: &Utf8Path) -> Result<()> {
    let metadata = path
        .metadata()
        .with_context(|| format!("Failed to stat {path}"))?;

    if !metadata.is_file() {
        bail!("{path} is not a regular file");
    }

    std::fs::File::open(path).with_context(|| format!("Failed to open {path}"))?;

    Ok(())
}
