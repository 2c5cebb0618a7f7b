//! Test helper building minimal ELF images.

/// Build a minimal but valid 64-bit little-endian ELF file with the given
/// machine field and no program or section headers.
pub fn minimal_elf(machine: u16) -> Vec<u8> {
    let mut elf = Vec::with_capacity(64);
    elf.extend_from_slice(&[0x7f, b'E', b'L', b'F']); // magic
    elf.push(2); // EI_CLASS: 64-bit
    elf.push(1); // EI_DATA: little-endian
    elf.push(1); // EI_VERSION
    elf.extend_from_slice(&[0; 9]); // OS ABI + padding
    elf.extend_from_slice(&2u16.to_le_bytes()); // e_type: ET_EXEC
    elf.extend_from_slice(&machine.to_le_bytes()); // e_machine
    elf.extend_from_slice(&1u32.to_le_bytes()); // e_version
    elf.extend_from_slice(&0u64.to_le_bytes()); // e_entry
    elf.extend_from_slice(&0u64.to_le_bytes()); // e_phoff
    elf.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    elf.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
    elf.extend_from_slice(&[0; 10]); // phentsize/phnum/shentsize/shnum/shstrndx
    assert_eq!(elf.len(), 64);
    elf
}
