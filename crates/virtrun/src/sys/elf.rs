//! ELF inspection for the main binary and any additional files.
//!
//! Only the pieces of the format relevant here are interrogated: the
//! machine field of the header, and the presence of `DT_NEEDED` entries in
//! the dynamic section.

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use elf::abi;
use elf::endian::AnyEndian;
use elf::ElfBytes;

use crate::arch::Arch;

/// Read the target architecture from the ELF header of the file at `path`.
///
/// Fails if the file cannot be read, is not an ELF, or its machine field
/// is not one of the supported architectures.
pub fn read_arch(path: &Utf8Path) -> Result<Arch> {
    let data =
        std::fs::read(path).with_context(|| format!("Failed to read ELF file {path}"))?;
    let file = ElfBytes::<AnyEndian>::minimal_parse(&data)
        .map_err(|err| eyre!("{path} is not a valid ELF file: {err}"))?;

    match file.ehdr.e_machine {
        abi::EM_X86_64 => Ok(Arch::Amd64),
        abi::EM_AARCH64 => Ok(Arch::Arm64),
        abi::EM_RISCV => Ok(Arch::Riscv64),
        machine => Err(eyre!(
            "{path}: unsupported ELF machine type {machine:#06x}"
        )),
    }
}

/// Whether the file at `path` is a dynamically linked ELF.
///
/// Non-ELF files and ELF files without `DT_NEEDED` entries are not
/// dynamically linked. Read errors are surfaced.
pub fn is_dynamic(path: &Utf8Path) -> Result<bool> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read file {path}"))?;

    let Ok(file) = ElfBytes::<AnyEndian>::minimal_parse(&data) else {
        return Ok(false);
    };

    let dynamic = match file.dynamic() {
        Ok(Some(table)) => table,
        Ok(None) => return Ok(false),
        Err(err) => {
            return Err(eyre!("{path}: reading dynamic section: {err}"));
        }
    };

    Ok(dynamic.iter().any(|d| d.d_tag == abi::DT_NEEDED))
}
