//! Integration tests for virtrun
//!
//! These run the real binary, and optionally a real QEMU guest. Set
//! VIRTRUN_PATH to the binary under test. Guest boot tests additionally
//! need VIRTRUN_TEST_KERNEL (a bootable kernel image) and
//! VIRTRUN_TEST_BINARY (a statically linked test binary that prints the
//! exit code line); they are reported as ignored when the environment
//! does not provide those.

use std::process::Output;

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};

/// Get the path to the virtrun binary under test from VIRTRUN_PATH,
/// falling back to "virtrun" on PATH.
fn get_virtrun_command() -> String {
    std::env::var("VIRTRUN_PATH").unwrap_or_else(|_| "virtrun".to_owned())
}

/// Captured output from a command with decoded stdout/stderr strings
struct CapturedOutput {
    output: Output,
    stdout: String,
    stderr: String,
}

impl CapturedOutput {
    fn new(output: Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Self {
            output,
            stdout,
            stderr,
        }
    }

    fn exit_code(&self) -> Option<i32> {
        self.output.status.code()
    }
}

/// Run the virtrun command, capturing output
fn run_virtrun(args: &[&str]) -> Result<CapturedOutput> {
    let virtrun = get_virtrun_command();
    let output = std::process::Command::new(&virtrun)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run {virtrun}"))?;
    Ok(CapturedOutput::new(output))
}

fn test_help_exits_zero() -> Result<()> {
    let result = run_virtrun(&["--help"])?;
    if result.exit_code() != Some(0) {
        return Err(eyre!("--help exited with {:?}", result.exit_code()));
    }
    if !result.stdout.contains("--kernel") {
        return Err(eyre!("help text does not mention --kernel"));
    }
    Ok(())
}

fn test_version_exits_zero() -> Result<()> {
    let result = run_virtrun(&["--version"])?;
    if result.exit_code() != Some(0) {
        return Err(eyre!("--version exited with {:?}", result.exit_code()));
    }
    Ok(())
}

fn test_missing_kernel_flag_fails() -> Result<()> {
    let result = run_virtrun(&["/bin/true"])?;
    if result.exit_code() != Some(255) {
        return Err(eyre!(
            "expected exit code 255, got {:?}",
            result.exit_code()
        ));
    }
    Ok(())
}

fn test_invalid_binary_fails_with_banner() -> Result<()> {
    let result = run_virtrun(&["--kernel=/boot/does-not-exist", "/dev/null"])?;
    if result.exit_code() != Some(255) {
        return Err(eyre!(
            "expected exit code 255, got {:?}",
            result.exit_code()
        ));
    }
    if !result.stderr.contains("Error:") {
        return Err(eyre!("missing error banner, stderr: {}", result.stderr));
    }
    Ok(())
}

/// Boot a real guest and check the exit code round trip.
fn test_guest_exit_code_round_trip(kernel: &str, binary: &str) -> Result<()> {
    let sh = xshell::Shell::new()?;
    let virtrun = get_virtrun_command();

    let output = xshell::cmd!(sh, "{virtrun} --kernel={kernel} --standalone {binary}")
        .ignore_status()
        .output()?;

    let code = output.status.code();
    if code != Some(0) {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(eyre!("guest run exited with {code:?}: {stderr}"));
    }
    Ok(())
}

fn main() {
    // The pipeline builds Linux guests only.
    if std::env::consts::OS != "linux" {
        eprintln!(
            "Integration tests are only supported on Linux (current OS: {})",
            std::env::consts::OS
        );
        eprintln!("Skipping all integration tests.");
        std::process::exit(0);
    }

    let args = Arguments::from_args();

    let mut tests = vec![
        Trial::test("help_exits_zero", || {
            test_help_exits_zero().map_err(|e| format!("{e:?}").into())
        }),
        Trial::test("version_exits_zero", || {
            test_version_exits_zero().map_err(|e| format!("{e:?}").into())
        }),
        Trial::test("missing_kernel_flag_fails", || {
            test_missing_kernel_flag_fails().map_err(|e| format!("{e:?}").into())
        }),
        Trial::test("invalid_binary_fails_with_banner", || {
            test_invalid_binary_fails_with_banner().map_err(|e| format!("{e:?}").into())
        }),
    ];

    let kernel = std::env::var("VIRTRUN_TEST_KERNEL").ok();
    let binary = std::env::var("VIRTRUN_TEST_BINARY").ok();
    let guest_ready = kernel.is_some() && binary.is_some();
    tests.push(
        Trial::test("guest_exit_code_round_trip", move || {
            let (kernel, binary) = (kernel.unwrap(), binary.unwrap());
            test_guest_exit_code_round_trip(&kernel, &binary)
                .map_err(|e| format!("{e:?}").into())
        })
        .with_ignored_flag(!guest_ready),
    );

    libtest_mimic::run(&args, tests).exit();
}
