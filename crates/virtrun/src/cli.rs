//! Command line surface and the translation into the run specs.

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use color_eyre::eyre::{bail, Context};
use color_eyre::Result;
use tracing::debug;

use crate::initramfs::InitramfsSpec;
use crate::qemu::transport::TransportType;
use crate::qemu::CommandSpec;
use crate::sys::elf;

/// Env var with additional arguments prepended before flag parsing.
pub const ARGS_ENV: &str = "VIRTRUN_ARGS";

/// Test binary flags whose file output is redirected through an
/// additional guest console.
const PROFILE_FLAGS: [&str; 6] = [
    "coverprofile",
    "cpuprofile",
    "memprofile",
    "blockprofile",
    "mutexprofile",
    "trace",
];

/// Run a binary as init in an ephemeral QEMU virtual machine.
///
/// The binary is packed into an initramfs archive together with its
/// dynamically linked libraries. The guest's exit code becomes this
/// program's exit code.
#[derive(Parser, Debug)]
#[command(name = "virtrun", version)]
pub struct Cli {
    /// Kernel image to boot
    #[arg(long)]
    pub kernel: Utf8PathBuf,

    /// QEMU cpu model [default: max]
    #[arg(long)]
    pub cpu: Option<String>,

    /// QEMU machine type [default: depends on binary architecture]
    #[arg(long)]
    pub machine: Option<String>,

    /// IO transport for the guest consoles [default: depends on binary
    /// architecture]
    #[arg(long, value_enum)]
    pub transport: Option<TransportType>,

    /// Guest memory (e.g. 256, 512M, 1G) [default: 256]
    #[arg(long, value_parser = parse_memory_to_mib)]
    pub memory: Option<u32>,

    /// Number of guest CPUs [default: 1]
    #[arg(long)]
    pub smp: Option<u32>,

    /// Disable KVM acceleration even if available
    #[arg(long)]
    pub no_kvm: bool,

    /// Keep the guest kernel's log output
    #[arg(long)]
    pub verbose: bool,

    /// Enable debug logging of this program
    #[arg(long)]
    pub debug: bool,

    /// Run the binary directly as PID 1 without the bundled init program
    #[arg(long)]
    pub standalone: bool,

    /// Do not rewrite well-known test binary flags
    #[arg(long)]
    pub no_test_flag_rewrite: bool,

    /// Keep the initramfs archive file instead of deleting it
    #[arg(long)]
    pub keep_initramfs: bool,

    /// Additional file to place in the guest's /data directory
    #[arg(long = "add-file", value_name = "PATH")]
    pub add_files: Vec<Utf8PathBuf>,

    /// Kernel module to place in the guest's /lib/modules directory
    #[arg(long = "add-module", value_name = "PATH")]
    pub add_modules: Vec<Utf8PathBuf>,

    /// Binary to run in the guest
    pub binary: Utf8PathBuf,

    /// Arguments passed to the guest init verbatim
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub init_args: Vec<String>,
}

impl Cli {
    /// Translate the parsed flags into the initramfs and QEMU specs.
    ///
    /// All file paths are made absolute here; the guest init arguments are
    /// kept verbatim.
    pub fn into_specs(self) -> Result<(CommandSpec, InitramfsSpec)> {
        for path in self.add_files.iter().chain(self.add_modules.iter()) {
            if path.as_str().is_empty() {
                bail!("file path must not be empty");
            }
        }

        let binary = absolute(&self.binary)?;
        let arch = elf::read_arch(&binary).context("Reading main binary")?;

        let mut command_spec = CommandSpec::with_defaults(arch, absolute(&self.kernel)?);
        if let Some(cpu) = self.cpu {
            command_spec.cpu = cpu;
        }
        if let Some(machine) = self.machine {
            command_spec.machine = machine;
        }
        if let Some(transport) = self.transport {
            command_spec.transport = transport;
        }
        if let Some(memory) = self.memory {
            command_spec.memory = memory;
        }
        if let Some(smp) = self.smp {
            command_spec.smp = smp;
        }
        command_spec.no_kvm |= self.no_kvm;
        command_spec.verbose = self.verbose;
        command_spec.no_test_flag_rewrite = self.no_test_flag_rewrite;
        command_spec.init_args = self.init_args;

        let initramfs_spec = InitramfsSpec {
            binary,
            files: absolute_all(self.add_files)?,
            modules: absolute_all(self.add_modules)?,
            standalone_init: self.standalone,
            keep: self.keep_initramfs,
        };

        Ok((command_spec, initramfs_spec))
    }
}

/// Prepend arguments from [`ARGS_ENV`] after the program name.
pub fn prepend_env_args(args: Vec<String>) -> Vec<String> {
    let Ok(env_args) = std::env::var(ARGS_ENV) else {
        return args;
    };

    let mut combined = Vec::with_capacity(args.len() + 4);
    let mut args = args.into_iter();
    combined.extend(args.next());
    combined.extend(env_args.split_whitespace().map(str::to_owned));
    combined.extend(args);
    combined
}

/// Redirect test binary profile output through additional guest consoles.
///
/// Flags like `-test.coverprofile=/host/path` point at host paths the
/// guest cannot reach. The host file becomes an extra console backing
/// file and the flag value is replaced with the matching guest device, so
/// the profile ends up on the host path anyway.
pub fn rewrite_test_flags(spec: &mut CommandSpec) {
    if spec.no_test_flag_rewrite {
        return;
    }

    let mut init_args = std::mem::take(&mut spec.init_args);

    for arg in &mut init_args {
        let Some(rest) = arg.strip_prefix("-test.") else {
            continue;
        };
        let Some((kind, path)) = rest.split_once('=') else {
            continue;
        };
        if !PROFILE_FLAGS.contains(&kind) || path.is_empty() {
            continue;
        }

        // Consoles are numbered from 1; 0 is the primary console.
        let console = spec.extra_files.len() as u32 + 1;
        let device = spec.transport.console_device_name(console);
        spec.extra_files.push(Utf8PathBuf::from(path));

        debug!("Rewriting {arg} to /dev/{device}");
        *arg = format!("-test.{kind}=/dev/{device}");
    }

    spec.init_args = init_args;
}

/// Parse a memory size (plain MiB, or K/M/G suffixed) to MiB.
fn parse_memory_to_mib(memory_str: &str) -> Result<u32, String> {
    let memory_str = memory_str.trim();
    if memory_str.is_empty() {
        return Err("memory specification must not be empty".to_owned());
    }

    let (number_str, multiplier) = if let Some(number) = memory_str.strip_suffix(['G', 'g']) {
        (number, 1024.0)
    } else if let Some(number) = memory_str.strip_suffix(['M', 'm']) {
        (number, 1.0)
    } else if let Some(number) = memory_str.strip_suffix(['K', 'k']) {
        (number, 1.0 / 1024.0)
    } else {
        (memory_str, 1.0)
    };

    let number: f64 = number_str
        .parse()
        .map_err(|_| format!("invalid number in memory specification: {memory_str}"))?;

    let mib = number * multiplier;
    if !(1.0..=u32::MAX as f64).contains(&mib) {
        return Err(format!("memory size out of range: {memory_str}"));
    }

    Ok(mib as u32)
}

fn absolute(path: &Utf8Path) -> Result<Utf8PathBuf> {
    let path = std::path::absolute(path)
        .with_context(|| format!("Failed to make path {path} absolute"))?;
    Ok(Utf8PathBuf::try_from(path)?)
}

fn absolute_all(paths: Vec<Utf8PathBuf>) -> Result<Vec<Utf8PathBuf>> {
    paths.iter().map(|path| absolute(path)).collect()
}
