//! Guest IO transport families and console device wiring.

use std::fmt;

use clap::ValueEnum;

use super::args::Argument;

/// How character devices and consoles are attached to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportType {
    /// Legacy ISA serial. Works for amd64 in any case, but machine types
    /// like microvm provide only a single console.
    Isa,
    /// VirtIO PCI. Requires a kernel built with CONFIG_VIRTIO_PCI.
    Pci,
    /// VirtIO MMIO. Requires a kernel built with CONFIG_VIRTIO_MMIO.
    Mmio,
}

impl TransportType {
    /// Name of the console device in the guest.
    pub fn console_device_name(self, num: u32) -> String {
        match self {
            TransportType::Isa => format!("ttyS{num}"),
            TransportType::Pci | TransportType::Mmio => format!("hvc{num}"),
        }
    }

    /// The virtio-serial bus device shared by all consoles, if the
    /// transport needs one.
    fn shared_device(self) -> Option<&'static str> {
        match self {
            TransportType::Isa => None,
            TransportType::Pci => Some("virtio-serial-pci,max_ports=8"),
            TransportType::Mmio => Some("virtio-serial-device,max_ports=8"),
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportType::Isa => "isa",
            TransportType::Pci => "pci",
            TransportType::Mmio => "mmio",
        };
        write!(f, "{}", s)
    }
}

/// Builds the per-console argument groups for one transport, numbering
/// consoles con0, con1, ... in the order they are added.
pub struct ConsoleBuilder {
    transport: TransportType,
    next_id: u32,
}

impl ConsoleBuilder {
    pub fn new(transport: TransportType) -> Self {
        Self {
            transport,
            next_id: 0,
        }
    }

    /// Arguments attaching a console backed by the file descriptor `fd` of
    /// the QEMU process.
    pub fn add_console(&mut self, fd: i32) -> Vec<Argument> {
        let id = self.next_id;
        self.next_id += 1;

        let path = fd_path(fd);

        match self.transport {
            TransportType::Isa => {
                vec![Argument::repeatable("serial", format!("file:{path}"))]
            }
            TransportType::Pci | TransportType::Mmio => {
                let mut args = Vec::with_capacity(3);
                if id == 0 {
                    let shared = self.transport.shared_device().unwrap();
                    args.push(Argument::repeatable("device", shared));
                }
                args.push(Argument::repeatable(
                    "chardev",
                    format!("file,id=con{id},path={path}"),
                ));
                args.push(Argument::repeatable(
                    "device",
                    format!("virtconsole,chardev=con{id}"),
                ));
                args
            }
        }
    }
}

fn fd_path(fd: i32) -> String {
    format!("/dev/fd/{fd}")
}
