//! QEMU command composition and guest supervision.
//!
//! The guest's primary console is bound to the QEMU process's stdout.
//! Guest stdout lines are forwarded to the host's stdout, except for the
//! exit-code line the guest init prints right before shutdown, which is
//! captured and turned into this process's result.

pub mod args;
pub mod transport;

use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, warn};

use crate::arch::Arch;
use self::args::{build_argument_strings, Argument};
use self::transport::{ConsoleBuilder, TransportType};

/// Line prefix the guest init prints on its primary console to
/// communicate the exit code of the guest workload.
pub const EXIT_CODE_PREFIX: &str = "GO_PIDONETEST_RC:";

pub const CPU_DEFAULT: &str = "max";
pub const MEMORY_DEFAULT: u32 = 256;
pub const SMP_DEFAULT: u32 = 1;

/// Grace period between SIGTERM and SIGKILL when tearing down the guest.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Everything needed to launch the virtual machine, except the initramfs
/// archive which is built separately.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub executable: String,
    pub kernel: Utf8PathBuf,
    pub machine: String,
    pub cpu: String,
    pub transport: TransportType,
    /// Guest memory in MiB.
    pub memory: u32,
    pub smp: u32,
    pub no_kvm: bool,
    /// Keep the guest kernel's log output instead of silencing it.
    pub verbose: bool,
    /// Host files exposed to the guest as additional consoles, mapped to
    /// child file descriptors 3, 4, ...
    pub extra_files: Vec<Utf8PathBuf>,
    /// Arguments passed to the guest init program verbatim.
    pub init_args: Vec<String>,
    /// Leave well-known test binary flags in `init_args` untouched.
    pub no_test_flag_rewrite: bool,
}

impl CommandSpec {
    /// A spec with the defaults for the given guest architecture.
    pub fn with_defaults(arch: Arch, kernel: Utf8PathBuf) -> Self {
        Self {
            executable: arch.qemu_executable().to_owned(),
            kernel,
            machine: arch.default_machine().to_owned(),
            cpu: CPU_DEFAULT.to_owned(),
            transport: arch.default_transport(),
            memory: MEMORY_DEFAULT,
            smp: SMP_DEFAULT,
            no_kvm: !arch.kvm_available(),
            verbose: false,
            extra_files: Vec::new(),
            init_args: Vec::new(),
            no_test_flag_rewrite: false,
        }
    }
}

/// Failure modes of a supervised run, in the order they take precedence.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    /// A host signal interrupted the run.
    #[error("run cancelled by {0}")]
    Cancelled(&'static str),

    /// The QEMU process itself failed.
    #[error("QEMU exited with code {0}")]
    Qemu(i32),

    /// The QEMU process was killed by a signal.
    #[error("QEMU was killed by signal {0}")]
    Killed(i32),

    /// The guest never printed an exit code line. Most likely the guest
    /// workload crashed or the kernel panicked.
    #[error("guest did not communicate an exit code")]
    NoExitCode,

    /// The guest ran to completion and reported a non-zero exit code.
    #[error("guest exited with code {0}")]
    GuestNonZero(i32),
}

impl CommandError {
    /// The exit code the wrapper should terminate with.
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::GuestNonZero(code) => *code,
            CommandError::Qemu(code) if *code != 0 => *code,
            _ => -1,
        }
    }
}

/// Compose the QEMU argument vector for the spec and initramfs archive.
pub fn build_qemu_arguments(spec: &CommandSpec, initramfs: &Utf8Path) -> Result<Vec<String>> {
    let mut arguments = vec![
        Argument::unique("machine", spec.machine.as_str()),
        Argument::unique("cpu", spec.cpu.as_str()),
        Argument::unique("smp", spec.smp.to_string()),
        Argument::unique("m", spec.memory.to_string()),
        Argument::unique("kernel", spec.kernel.as_str()),
        Argument::unique("initrd", initramfs.as_str()),
        Argument::unique("display", "none"),
        Argument::unique("monitor", "none"),
        Argument::unique_flag("no-reboot"),
        Argument::unique_flag("nodefaults"),
    ];

    // With a virtio console the default ISA serial device must not exist.
    if spec.transport != TransportType::Isa {
        arguments.push(Argument::unique("serial", "none"));
    }

    if !spec.no_kvm {
        arguments.push(Argument::unique_flag("enable-kvm"));
    }

    let mut consoles = ConsoleBuilder::new(spec.transport);
    // Primary console on the child's stdout.
    arguments.extend(consoles.add_console(1));
    // Additional consoles on the descriptors passed to the child.
    for idx in 0..spec.extra_files.len() {
        arguments.extend(consoles.add_console(3 + idx as i32));
    }

    arguments.push(Argument::unique("append", kernel_cmdline(spec)));

    let strings = build_argument_strings(&arguments)?;
    Ok(strings)
}

/// The guest kernel command line, ending in the init arguments.
fn kernel_cmdline(spec: &CommandSpec) -> String {
    let mut parts = vec![
        format!("console={}", spec.transport.console_device_name(0)),
        "panic=-1".to_owned(),
    ];

    if !spec.verbose {
        parts.push("loglevel=0".to_owned());
    }

    parts.push("--".to_owned());
    parts.extend(spec.init_args.iter().cloned());

    parts.join(" ")
}

/// Extract the guest exit code from a single console line.
fn parse_exit_code(line: &str) -> Option<i32> {
    let rest = line.strip_prefix(EXIT_CODE_PREFIX)?;
    rest.split_whitespace().next()?.parse().ok()
}

/// Run QEMU for the spec and supervise it until the guest communicates an
/// exit code, the process fails, or a host signal cancels the run.
///
/// Guest stdout and stderr lines are forwarded to the host's stdout and
/// stderr. Success means the guest explicitly reported exit code 0; every
/// other outcome is a [`CommandError`].
pub async fn run(spec: &CommandSpec, initramfs: &Utf8Path) -> Result<()> {
    let arguments = build_qemu_arguments(spec, initramfs)?;
    debug!("QEMU command: {} {}", spec.executable, arguments.join(" "));

    // Host files backing the additional guest consoles. Lifted above the
    // descriptor range they are mapped into so dup2 cannot clobber a
    // source descriptor.
    let extra_count = spec.extra_files.len();
    let mut extra_fds: Vec<OwnedFd> = Vec::with_capacity(extra_count);
    for path in &spec.extra_files {
        let file = File::create(path)
            .with_context(|| format!("Failed to create console output file {path}"))?;
        let fd = rustix::io::fcntl_dupfd_cloexec(&file, 3 + extra_count as i32)
            .with_context(|| format!("Failed to duplicate descriptor for {path}"))?;
        extra_fds.push(fd);
    }

    let mut command = Command::new(&spec.executable);
    command
        .args(&arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if !extra_fds.is_empty() {
        let raw_fds: Vec<i32> = extra_fds.iter().map(|fd| fd.as_raw_fd()).collect();
        // SAFETY: only async-signal-safe calls between fork and exec.
        // dup2 clears CLOEXEC on the target descriptor.
        unsafe {
            command.pre_exec(move || {
                for (idx, fd) in raw_fds.iter().enumerate() {
                    if libc::dup2(*fd, 3 + idx as i32) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to start {}", spec.executable))?;
    drop(extra_fds);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| eyre!("QEMU stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| eyre!("QEMU stderr not captured"))?;

    let stdout_task = tokio::spawn(forward_stdout(stdout));
    let stderr_task = tokio::spawn(forward_stderr(stderr));

    // Install handlers before waiting so no signal can slip through.
    let mut signals = CancelSignals::new()?;

    let status: Result<std::process::ExitStatus, &'static str> = tokio::select! {
        status = child.wait() => Ok(status.context("Waiting for QEMU")?),
        name = signals.recv() => {
            warn!("Received {name}, terminating the virtual machine");
            terminate(&mut child).await;
            Err(name)
        }
    };

    // Drain both streams so no buffered guest output is lost.
    let guest_exit_code = stdout_task.await.context("Guest stdout reader")?;
    stderr_task.await.context("Guest stderr reader")?;

    let status = match status {
        Ok(status) => status,
        Err(name) => return Err(CommandError::Cancelled(name).into()),
    };

    if !status.success() {
        let err = match status.code() {
            Some(code) => CommandError::Qemu(code),
            None => CommandError::Killed(status.signal().unwrap_or(0)),
        };
        return Err(err.into());
    }

    match guest_exit_code {
        None => Err(CommandError::NoExitCode.into()),
        Some(0) => Ok(()),
        Some(code) => Err(CommandError::GuestNonZero(code).into()),
    }
}

/// Forward guest stdout and capture the first exit code line.
///
/// Exit code lines are consumed, never forwarded; only the first one
/// counts. Invalid UTF-8 is forwarded lossily.
async fn forward_stdout(stdout: ChildStdout) -> Option<i32> {
    let mut segments = BufReader::new(stdout).split(b'\n');
    let mut exit_code = None;

    loop {
        match segments.next_segment().await {
            Ok(Some(segment)) => {
                let line = String::from_utf8_lossy(&segment);
                let line = line.trim_end_matches('\r');
                match parse_exit_code(line) {
                    Some(code) => {
                        if exit_code.is_none() {
                            exit_code = Some(code);
                        }
                    }
                    None => println!("{line}"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!("Reading guest stdout: {err}");
                break;
            }
        }
    }

    exit_code
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut segments = BufReader::new(stderr).split(b'\n');

    loop {
        match segments.next_segment().await {
            Ok(Some(segment)) => {
                let line = String::from_utf8_lossy(&segment);
                eprintln!("{}", line.trim_end_matches('\r'));
            }
            Ok(None) => break,
            Err(err) => {
                warn!("Reading guest stderr: {err}");
                break;
            }
        }
    }
}

/// Ask the child to terminate, escalating to SIGKILL after a grace period.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        debug!("Sending SIGTERM to QEMU (pid {pid})");
        // SAFETY: plain kill(2) on the child's pid.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    if tokio::time::timeout(TERMINATE_GRACE, child.wait())
        .await
        .is_err()
    {
        warn!("QEMU did not terminate in time, killing it");
        let _ = child.kill().await;
    }
}

/// The signals that cancel a run.
struct CancelSignals {
    abort: Signal,
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
    hangup: Signal,
}

impl CancelSignals {
    fn new() -> Result<Self> {
        Ok(Self {
            abort: signal(SignalKind::from_raw(libc::SIGABRT))
                .context("Failed to install SIGABRT handler")?,
            interrupt: signal(SignalKind::interrupt())
                .context("Failed to install SIGINT handler")?,
            terminate: signal(SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?,
            quit: signal(SignalKind::quit()).context("Failed to install SIGQUIT handler")?,
            hangup: signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.abort.recv() => "SIGABRT",
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.quit.recv() => "SIGQUIT",
            _ = self.hangup.recv() => "SIGHUP",
        }
    }
}
