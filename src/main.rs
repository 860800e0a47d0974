//! dosvisor - A minimal KVM-based supervisor for real-mode DOS `.com`
//! programs.
//!
//! This VMM requires Linux with KVM support. It will not run on other
//! platforms.

#[cfg(target_os = "linux")]
mod dos;
#[cfg(target_os = "linux")]
mod error;
#[cfg(target_os = "linux")]
mod ivt;
#[cfg(target_os = "linux")]
mod kvm;
#[cfg(target_os = "linux")]
mod memory;
#[cfg(target_os = "linux")]
mod psp;
#[cfg(target_os = "linux")]
mod registers;
#[cfg(target_os = "linux")]
mod supervisor;

use clap::Parser;
use std::process::ExitCode;

/// `<program> <guest-image> [<dos-arg> ...]` (spec.md §6). `image` is
/// optional, rather than a required positional, so the "fewer than one
/// guest argument" case can be reported through the same
/// `SupervisorError::Usage` → exit-252 path as every other fatal setup
/// error, instead of clap's own exit(2) usage failure.
#[derive(Parser, Debug)]
#[command(name = "dosvisor")]
#[command(about = "Run a real-mode DOS .com program under KVM")]
struct Args {
    /// Path to the guest `.com` image.
    image: Option<String>,

    /// Arguments passed through to the guest as its DOS command-line tail.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    dos_args: Vec<String>,
}

#[cfg(target_os = "linux")]
const FATAL_EXIT_CODE: u8 = error::FATAL_EXIT_CODE;
#[cfg(not(target_os = "linux"))]
const FATAL_EXIT_CODE: u8 = 252;

fn main() -> ExitCode {
    let args = Args::parse();

    match run(args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("dosvisor: {e}");
            ExitCode::from(FATAL_EXIT_CODE)
        }
    }
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<u8, error::SupervisorError> {
    use dos::StdFds;
    use error::SupervisorError;
    use memory::GuestMemory;

    let Some(image_path) = args.image else {
        return Err(SupervisorError::Usage("dosvisor".to_string()));
    };

    let memory = GuestMemory::new()?;
    ivt::install(&memory)?;
    psp::build_psp(&memory, &args.dos_args)?;
    psp::load_image(&image_path, &memory)?;

    let vm = kvm::create_vm()?;
    let vcpu = supervisor::prepare_vm(&vm, &memory)?;

    let mut streams = StdFds;
    let mut sup = supervisor::Supervisor::new(&memory, vcpu, &mut streams);
    sup.run_until_exit()
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<u8, Box<dyn std::error::Error>> {
    Err("dosvisor requires Linux with KVM support. This platform is not supported.".into())
}
