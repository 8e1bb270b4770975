//! Binary entry point: flag parsing and parent/child mode dispatch.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use simplevisor::secrets::ClientOptions;
use simplevisor::{child, Supervisor};

#[derive(Parser)]
#[command(
    name = "simplevisor",
    version,
    about = "Minimal PID-1 process supervisor for containers"
)]
struct Cli {
    /// Mode in which to run (`parent` or `child`); `child` is internal
    /// use only.
    #[arg(long, default_value = "parent")]
    mode: String,

    /// Config file location.
    #[arg(long, default_value = "simplevisor.json")]
    config: PathBuf,

    /// Run with a no-op secret client instead of a real secret store.
    #[arg(long)]
    no_vault: bool,

    /// Resolve the secret-store address via DNS SRV before connecting.
    #[arg(long)]
    discover_vault: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.mode.as_str() {
        "parent" => run_parent(&cli),
        "child" => child::run(),
        other => {
            eprintln!("simplevisor: invalid mode {other:?}");
            ExitCode::FAILURE
        }
    }
}

fn run_parent(cli: &Cli) -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("simplevisor: unable to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    let opts = ClientOptions {
        enabled: !cli.no_vault,
        discover: cli.discover_vault,
    };
    let code = runtime.block_on(Supervisor::new().run(&cli.config, &opts));
    ExitCode::from(code.clamp(0, u8::MAX as i32) as u8)
}
