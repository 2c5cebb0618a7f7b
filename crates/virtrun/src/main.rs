//! virtrun - run a binary as init in an ephemeral QEMU virtual machine.

use clap::Parser;
use color_eyre::eyre::Context;
use color_eyre::{Report, Result};

mod arch;
mod cli;
mod initramfs;
mod qemu;
mod sys;
#[cfg(test)]
mod testelf;
mod validate;

/// Install and configure the tracing/logging system.
///
/// Logs go to stderr in a compact format. The level comes from the
/// RUST_LOG environment variable, defaulting to 'warn'; the --debug flag
/// forces 'debug'.
fn install_tracing(debug: bool) {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("warn"))
            .unwrap()
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

/// The whole pipeline for a single run: translate flags, validate, build
/// the initramfs archive, run QEMU, dispose of the archive.
fn run(cli: cli::Cli) -> Result<()> {
    let (mut command_spec, initramfs_spec) = cli.into_specs()?;

    validate::validate(&command_spec, &initramfs_spec)?;
    cli::rewrite_test_flags(&mut command_spec);

    let archive = initramfs::build(&initramfs_spec)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Init tokio runtime")?;

    let result = runtime.block_on(qemu::run(&command_spec, archive.path()));
    runtime.shutdown_background();

    if let Err(err) = archive.cleanup() {
        eprintln!("Error: cleanup initramfs archive: {err:#}");
    }

    result
}

/// Map a run error to the process exit code, printing a diagnostic for
/// everything except a guest that properly communicated a non-zero code.
fn handle_run_error(err: &Report) -> i32 {
    if let Some(command_err) = err.downcast_ref::<qemu::CommandError>() {
        // The guest already printed its own diagnostics.
        if matches!(command_err, qemu::CommandError::GuestNonZero(_)) {
            return command_err.exit_code();
        }

        eprintln!("Error: {err:#}");
        return command_err.exit_code();
    }

    eprintln!("Error: {err:#}");
    -1
}

fn main() {
    let args = cli::prepend_env_args(std::env::args().collect());

    let cli = match cli::Cli::try_parse_from(&args) {
        Ok(cli) => cli,
        Err(err) => {
            // clap renders help, version and usage errors itself. Usage
            // errors must not exit with the reserved clap code though.
            let exit_code = if err.use_stderr() { -1 } else { 0 };
            let _ = err.print();
            std::process::exit(exit_code);
        }
    };

    install_tracing(cli.debug);
    if let Err(err) = color_eyre::install() {
        eprintln!("Error: {err:#}");
        std::process::exit(-1);
    }

    let exit_code = match run(cli) {
        Ok(()) => 0,
        Err(err) => handle_run_error(&err),
    };

    std::process::exit(exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::eyre;

    #[test]
    fn test_guest_non_zero_maps_to_guest_code() {
        let err = Report::from(qemu::CommandError::GuestNonZero(42));
        assert_eq!(handle_run_error(&err), 42);
    }

    #[test]
    fn test_qemu_failure_maps_to_qemu_code() {
        let err = Report::from(qemu::CommandError::Qemu(3));
        assert_eq!(handle_run_error(&err), 3);
    }

    #[test]
    fn test_missing_exit_code_maps_to_minus_one() {
        let err = Report::from(qemu::CommandError::NoExitCode);
        assert_eq!(handle_run_error(&err), -1);
    }

    #[test]
    fn test_other_errors_map_to_minus_one() {
        let err = eyre!("some setup failure");
        assert_eq!(handle_run_error(&err), -1);
    }
}
