//! Virtual CPU management and execution.
//!
//! A vCPU represents a virtual processor running guest code under hardware
//! virtualization. `VcpuFd::run` blocks until the guest exits back to
//! userspace and reports why; the caller is expected to snapshot registers
//! and segment registers itself right afterwards (spec.md §4.5 step 2) since
//! that's needed for every exit reason, not just `Halted`.
//!
//! # VM Exits
//!
//! This supervisor cares about exactly one "successful" exit: `Halted`.
//! Every other variant is either a benign no-op (`PortIo`, which the
//! dispatch loop resumes unconditionally) or fatal (`Shutdown`, `Mmio`,
//! `Other`) per spec.md §4.5. There is no `IoHandler`/`MmioHandler` device
//! bus here: this system emulates no hardware devices, only DOS software
//! interrupts, so the exit itself carries just enough data for a
//! debug-build diagnostic.

use super::KvmError;
use kvm_bindings::{kvm_regs, kvm_sregs};
use kvm_ioctls::VcpuExit as KvmVcpuExit;

/// Wrapper around the KVM vCPU file descriptor.
pub struct VcpuFd {
    vcpu: kvm_ioctls::VcpuFd,
}

/// Exit reasons from vCPU execution.
#[derive(Debug)]
pub enum VcpuExit {
    /// Guest executed `hlt`. Whether this is a synthetic trap (see the
    /// `ivt` module) is decided by the caller from the post-exit cs:ip.
    Halted,

    /// Guest performed an `in`/`out` on an I/O port. Always ignored by the
    /// dispatch loop (spec.md §4.5); carried only for debug logging.
    PortIo { port: u16, is_write: bool, size: u8 },

    /// Guest accessed an address outside any registered memory region (most
    /// notably: a write into the read-only interrupt table). Fatal.
    Mmio { addr: u64, size: u8, is_write: bool },

    /// Guest requested shutdown (e.g. triple fault). Fatal.
    Shutdown,

    /// Any other KVM exit reason this supervisor does not expect. Fatal.
    Other(&'static str),
}

impl VcpuFd {
    /// Wrap a freshly created KVM vCPU file descriptor.
    pub fn new(vcpu: kvm_ioctls::VcpuFd) -> Self {
        Self { vcpu }
    }

    /// Get the current general-purpose registers.
    pub fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.vcpu.get_regs().map_err(KvmError::GetRegisters)
    }

    /// Set the general-purpose registers.
    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.vcpu.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    /// Get the current special (segment + control) registers.
    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu.get_sregs().map_err(KvmError::GetRegisters)
    }

    /// Set the special (segment + control) registers.
    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.vcpu.set_sregs(sregs).map_err(KvmError::SetRegisters)
    }

    /// Run the vCPU until it exits.
    pub fn run(&mut self) -> Result<VcpuExit, KvmError> {
        match self.vcpu.run().map_err(KvmError::Run)? {
            KvmVcpuExit::Hlt => Ok(VcpuExit::Halted),
            KvmVcpuExit::IoIn(port, data) => Ok(VcpuExit::PortIo {
                port,
                is_write: false,
                size: data.len() as u8,
            }),
            KvmVcpuExit::IoOut(port, data) => Ok(VcpuExit::PortIo {
                port,
                is_write: true,
                size: data.len() as u8,
            }),
            KvmVcpuExit::MmioRead(addr, data) => Ok(VcpuExit::Mmio {
                addr,
                size: data.len() as u8,
                is_write: false,
            }),
            KvmVcpuExit::MmioWrite(addr, data) => Ok(VcpuExit::Mmio {
                addr,
                size: data.len() as u8,
                is_write: true,
            }),
            KvmVcpuExit::Shutdown => Ok(VcpuExit::Shutdown),
            KvmVcpuExit::InternalError => Ok(VcpuExit::Other("InternalError")),
            KvmVcpuExit::FailEntry(..) => Ok(VcpuExit::Other("FailEntry")),
            KvmVcpuExit::SystemEvent(..) => Ok(VcpuExit::Other("SystemEvent")),
            _ => Ok(VcpuExit::Other("Unknown")),
        }
    }
}
