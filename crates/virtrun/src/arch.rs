//! Guest architecture tags and the per-architecture QEMU defaults.

use std::fmt;
use std::fs::OpenOptions;

use crate::qemu::transport::TransportType;

/// CPU architectures a guest can be run for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
    Riscv64,
}

impl Arch {
    /// The architecture of the host this process runs on, if supported.
    pub fn native() -> Option<Arch> {
        match std::env::consts::ARCH {
            "x86_64" => Some(Arch::Amd64),
            "aarch64" => Some(Arch::Arm64),
            "riscv64" => Some(Arch::Riscv64),
            _ => None,
        }
    }

    /// Whether this is the host's own architecture.
    pub fn is_native(self) -> bool {
        Arch::native() == Some(self)
    }

    /// KVM acceleration requires the native architecture and write access
    /// to /dev/kvm.
    pub fn kvm_available(self) -> bool {
        self.is_native()
            && OpenOptions::new()
                .write(true)
                .open("/dev/kvm")
                .is_ok()
    }

    /// Name of the QEMU system emulator binary for this architecture.
    pub fn qemu_executable(self) -> &'static str {
        match self {
            Arch::Amd64 => "qemu-system-x86_64",
            Arch::Arm64 => "qemu-system-aarch64",
            Arch::Riscv64 => "qemu-system-riscv64",
        }
    }

    /// Default QEMU machine type for this architecture.
    pub fn default_machine(self) -> &'static str {
        match self {
            Arch::Amd64 => "q35",
            Arch::Arm64 => "virt",
            Arch::Riscv64 => "virt",
        }
    }

    /// Default IO transport family for this architecture.
    pub fn default_transport(self) -> TransportType {
        match self {
            Arch::Amd64 => TransportType::Pci,
            Arch::Arm64 => TransportType::Mmio,
            Arch::Riscv64 => TransportType::Mmio,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Riscv64 => "riscv64",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        for arch in [Arch::Amd64, Arch::Arm64, Arch::Riscv64] {
            let (executable, machine, transport) = match arch {
                Arch::Amd64 => ("qemu-system-x86_64", "q35", TransportType::Pci),
                Arch::Arm64 => ("qemu-system-aarch64", "virt", TransportType::Mmio),
                Arch::Riscv64 => ("qemu-system-riscv64", "virt", TransportType::Mmio),
            };
            assert_eq!(arch.qemu_executable(), executable);
            assert_eq!(arch.default_machine(), machine);
            assert_eq!(arch.default_transport(), transport);
        }
    }

    #[test]
    fn test_non_native_has_no_kvm() {
        for arch in [Arch::Amd64, Arch::Arm64, Arch::Riscv64] {
            if !arch.is_native() {
                assert!(!arch.kvm_available());
            }
        }
    }
}
