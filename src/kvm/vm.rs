//! Virtual Machine creation and memory management.
//!
//! This module handles VM-level KVM operations: registering guest memory
//! regions and creating the (single) vCPU.
//!
//! # Memory Regions
//!
//! Guest memory is managed through "memory slots". Each slot maps a range of
//! guest physical addresses to host virtual addresses:
//!
//! ```text
//! Guest Physical          Host Virtual
//! ┌──────────────┐       ┌──────────────┐
//! │ 0x00000000   │ ────► │ mmap'd region│
//! │ 0x00000FFF   │       │ (read-only)  │
//! ├──────────────┤       ├──────────────┤
//! │ 0x00001000   │ ────► │ mmap'd region│
//! │ ...          │       │ (read-write) │
//! └──────────────┘       └──────────────┘
//! ```
//!
//! This supervisor always registers exactly two regions: a read-only slot
//! covering the magic interrupt table (see the `ivt` module) and a
//! read-write slot covering the rest of guest RAM. The read-only flag is
//! what turns a wild guest write into the IVT into a fatal MMIO exit instead
//! of silently corrupting the dispatch table (spec: interrupt-trap
//! mechanism design note).

use super::{KvmError, VcpuFd};
use kvm_bindings::{kvm_userspace_memory_region, KVM_MEM_READONLY};

/// Wrapper around the KVM VM file descriptor.
///
/// Provides methods for registering guest memory regions and creating the
/// virtual CPU.
pub struct VmFd {
    /// The underlying KVM VM file descriptor.
    vm: kvm_ioctls::VmFd,
}

impl VmFd {
    /// Wrap a freshly created KVM VM file descriptor.
    pub fn new(vm: kvm_ioctls::VmFd) -> Self {
        Self { vm }
    }

    /// Register a guest memory region with KVM.
    ///
    /// Maps a range of guest physical addresses to a region of host virtual
    /// memory. After registration, guest accesses to these physical
    /// addresses transparently access the host memory. When `readonly` is
    /// set, guest writes into the region fault through a `KVM_EXIT_MMIO`
    /// instead of being applied.
    ///
    /// # Safety
    ///
    /// The caller must ensure the host memory region remains valid and is
    /// not freed or reallocated for the lifetime of the VM, and that it does
    /// not overlap with any other registered region.
    pub unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
        readonly: bool,
    ) -> Result<(), KvmError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size,
            userspace_addr,
            flags: if readonly { KVM_MEM_READONLY } else { 0 },
        };

        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(KvmError::SetMemoryRegion)
        }
    }

    /// Create the (single) virtual CPU.
    ///
    /// No CPUID shaping, no MSR setup: a 16-bit real-mode DOS program never
    /// executes `cpuid` and has no use for the paravirt MSRs a Linux kernel
    /// would expect during boot.
    pub fn create_vcpu(&self, id: u64) -> Result<VcpuFd, KvmError> {
        let vcpu = self.vm.create_vcpu(id).map_err(KvmError::CreateVcpu)?;
        Ok(VcpuFd::new(vcpu))
    }
}
