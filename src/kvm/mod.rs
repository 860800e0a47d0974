//! KVM (Kernel-based Virtual Machine) wrapper module.
//!
//! This module provides a safe Rust interface to the slice of Linux KVM this
//! supervisor needs: open `/dev/kvm`, create a VM, register guest memory,
//! create a single vCPU, and run it. The VMM (us) talks to KVM through
//! ioctls on:
//!
//! - `/dev/kvm` - system-level operations (create VMs)
//! - VM file descriptor - VM-level operations (create vCPUs, set memory)
//! - vCPU file descriptor - vCPU-level operations (run, get/set registers)
//!
//! Unlike a general-purpose VMM booting a Linux kernel, this supervisor runs
//! its guest in 16-bit real mode from the very first instruction and never
//! enables interrupts, paging, or protected mode. That means none of the
//! usual x86 boot scaffolding is needed: no in-kernel IRQ chip, no PIT, no
//! TSS address, no CPUID shaping, no boot MSRs. Skipping the IRQ chip is not
//! just an optimization here — it's load-bearing: without it, a guest `hlt`
//! always exits to userspace immediately instead of KVM parking the vCPU
//! until an interrupt arrives, which is exactly the behavior the interrupt
//! trap mechanism (see the `ivt` module) depends on. The guest's only way to
//! talk to the outside world is that synthetic interrupt table.
//!
//! # VM Execution Model
//!
//! The vCPU runs in a loop:
//!
//! 1. VMM calls `vcpu.run()` - control transfers to guest
//! 2. Guest executes until a VM exit occurs
//! 3. KVM returns control to the VMM with an exit reason
//! 4. VMM handles the exit (trapped interrupt, or a fatal condition)
//! 5. VMM calls `vcpu.run()` again (unless it decided to terminate)

mod vcpu;
mod vm;

pub use vcpu::{VcpuExit, VcpuFd};
pub use vm::VmFd;

use kvm_ioctls::Kvm;
use thiserror::Error;

/// Errors that can occur during KVM operations.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open /dev/kvm device.
    ///
    /// This usually means KVM is not available (not running on Linux, or the
    /// KVM module is not loaded), the user lacks permission (not in the
    /// `kvm` group), or the host is itself a VM without nested
    /// virtualization enabled.
    #[error("failed to open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    /// Failed to create a new VM.
    #[error("failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    /// Failed to create a vCPU.
    #[error("failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    /// Failed to register guest memory with KVM.
    #[error("failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    /// Failed to set CPU registers.
    #[error("failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    /// Failed to get CPU registers.
    #[error("failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    /// Failed to run vCPU.
    #[error("failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),
}

/// Open the KVM device and create a new virtual machine.
///
/// # Errors
///
/// Returns an error if KVM is not available/accessible or VM creation fails.
pub fn create_vm() -> Result<VmFd, KvmError> {
    let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;
    let vm = kvm.create_vm().map_err(KvmError::CreateVm)?;
    Ok(VmFd::new(vm))
}
