//! The dispatch loop: runs the vCPU, recognizes trapped software
//! interrupts, and turns them into DOS service calls (spec.md §4.4, §4.5).

use kvm_bindings::kvm_regs;

use crate::dos::{self, HostStreams, Outcome};
use crate::error::SupervisorError;
use crate::ivt;
use crate::kvm::{VcpuExit, VcpuFd, VmFd};
use crate::memory::GuestMemory;
use crate::registers::RegisterSnapshot;

/// Number of bytes popped off the stack on a trap return: ip, cs, flags
/// (spec.md §4.4 return protocol).
const RETURN_FRAME_SIZE: u16 = 6;

/// Emit a diagnostic only in debug builds, mirroring the compile-time
/// `DEBUG` toggle the original reference implementation used instead of a
/// runtime environment variable (spec.md §6).
macro_rules! debug_log {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            eprintln!($($arg)*);
        }
    };
}

/// Owns the guest address space and the running vCPU, and drives it to
/// completion.
pub struct Supervisor<'a> {
    memory: &'a GuestMemory,
    vcpu: VcpuFd,
    streams: &'a mut dyn HostStreams,
}

impl<'a> Supervisor<'a> {
    pub fn new(memory: &'a GuestMemory, vcpu: VcpuFd, streams: &'a mut dyn HostStreams) -> Self {
        Self {
            memory,
            vcpu,
            streams,
        }
    }

    /// Run the guest until it issues a terminating DOS service or a
    /// structural error occurs. Returns the process exit code.
    pub fn run_until_exit(&mut self) -> Result<u8, SupervisorError> {
        loop {
            let exit = self.vcpu.run()?;
            let mut regs = RegisterSnapshot::new(self.vcpu.get_regs()?, self.vcpu.get_sregs()?);

            match exit {
                VcpuExit::PortIo { port, is_write, size } => {
                    debug_log!(
                        "[dosvisor] ignoring port I/O: port={port:#x} write={is_write} size={size}"
                    );
                    // No device emulation exists to act on; just resume. A
                    // short sleep in debug builds keeps a misbehaving guest
                    // that busy-loops on an I/O port from pinning a host
                    // core while stepping through it under a debugger.
                    if cfg!(debug_assertions) {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                }

                VcpuExit::Mmio { addr, size, is_write } => {
                    return Err(SupervisorError::FatalExit(format!(
                        "unexpected MMIO exit at {addr:#x} (size={size}, write={is_write})"
                    )));
                }

                VcpuExit::Shutdown => {
                    return Err(SupervisorError::FatalExit(
                        "guest requested shutdown".to_string(),
                    ));
                }

                VcpuExit::Other(reason) => {
                    return Err(SupervisorError::FatalExit(format!(
                        "unexpected vCPU exit: {reason}"
                    )));
                }

                VcpuExit::Halted => {
                    let Some(int_num) = ivt::decode_trap(regs.cs(), regs.ip()) else {
                        return Err(SupervisorError::FatalExit(format!(
                            "guest halted outside the trap table at {:#06x}:{:#06x}",
                            regs.cs(),
                            regs.ip()
                        )));
                    };

                    complete_trap(self.memory, &mut regs)?;

                    match dos::dispatch(int_num, &mut regs, self.memory, self.streams)? {
                        Outcome::Resume => {}
                        Outcome::Terminate(code) => return Ok(code),
                    }

                    // complete_trap rewrites cs (selector + shadow base),
                    // so sregs must go back too, not just the GP registers.
                    self.vcpu.set_sregs(regs.sregs())?;
                    self.vcpu.set_regs(regs.regs())?;
                }
            }
        }
    }
}

/// Emulate the CPU's `iret` bookkeeping for a trapped interrupt (spec.md
/// §4.4 return protocol, §9 flags write-back note).
///
/// Pops `(ip, cs, flags)` off the guest stack, restores cs:ip to the
/// address the `int` instruction would have returned to, and advances sp —
/// all *before* the DOS service itself runs, since the service's outcome
/// (in particular the carry flag) is applied to the live flags register
/// afterwards, never written back to the stack image.
fn complete_trap(memory: &GuestMemory, regs: &mut RegisterSnapshot) -> Result<(), SupervisorError> {
    let ss = regs.ss();
    let sp = regs.sp();

    let mut ip_bytes = [0u8; 2];
    let mut cs_bytes = [0u8; 2];
    memory.read(GuestMemory::phys_addr(ss, sp), &mut ip_bytes)?;
    memory.read(GuestMemory::phys_addr(ss, sp.wrapping_add(2)), &mut cs_bytes)?;

    let ret_ip = u16::from_le_bytes(ip_bytes);
    let ret_cs = u16::from_le_bytes(cs_bytes);

    regs.set_cs(crate::registers::SegmentValue::new(ret_cs));
    regs.set_ip(ret_ip);
    regs.set_sp(sp.wrapping_add(RETURN_FRAME_SIZE));

    Ok(())
}

/// Set up the guest's initial general-purpose registers: sp at the top of
/// the program's stack (with the zero word convention handled separately
/// by the caller, since it's a memory write, not a register), and rip at
/// the `.com` entry point (spec.md §6).
pub fn initial_registers() -> kvm_regs {
    let mut regs: kvm_regs = unsafe { std::mem::zeroed() };
    regs.rip = 0x0100;
    regs.rsp = 0xFFFE;
    // Real mode starts with interrupts conceptually enabled (bit 9) and the
    // reserved bit 1 of flags always set.
    regs.rflags = 0x0002;
    regs
}

/// Register every KVM memory region and create the vCPU with its initial
/// register state, ready to run.
pub fn prepare_vm(vm: &VmFd, memory: &GuestMemory) -> Result<VcpuFd, SupervisorError> {
    use crate::memory::BASE_PARA;
    use crate::registers::SegmentValue;

    for region in memory.kvm_regions() {
        unsafe {
            vm.set_user_memory_region(
                region.slot,
                region.guest_addr,
                region.size,
                region.host_addr,
                region.readonly,
            )?;
        }
    }

    let vcpu = vm.create_vcpu(0)?;

    let regs = initial_registers();
    vcpu.set_regs(&regs)?;

    let mut sregs = vcpu.get_sregs()?;
    let seg = SegmentValue::new(BASE_PARA);
    sregs.cs = seg.to_kvm_code_segment();
    sregs.ds = seg.to_kvm_data_segment();
    sregs.es = seg.to_kvm_data_segment();
    sregs.fs = seg.to_kvm_data_segment();
    sregs.gs = seg.to_kvm_data_segment();
    sregs.ss = seg.to_kvm_data_segment();
    vcpu.set_sregs(&sregs)?;

    // Push the 16-bit zero word the `.com` entry-point convention expects
    // at the top of the stack (spec.md §6).
    let ss = seg.selector;
    memory.write_u16(GuestMemory::phys_addr(ss, 0xFFFE), 0)?;

    Ok(vcpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_registers_match_the_com_entry_convention() {
        let regs = initial_registers();
        assert_eq!(regs.rip, 0x0100);
        assert_eq!(regs.rsp, 0xFFFE);
        assert_eq!(regs.rflags & 0x0002, 0x0002);
    }

    #[test]
    fn complete_trap_pops_return_frame_and_advances_sp() {
        let memory = GuestMemory::new().unwrap();
        // A zeroed snapshot has ss selector 0, so ss:sp is a plain physical
        // address here.
        let sp = 0x2000u16;
        let phys = GuestMemory::phys_addr(0, sp);
        // Push order on a real `int` is flags, cs, ip, with sp left
        // pointing at ip.
        memory.write_u16(phys, 0x0050).unwrap(); // ret ip
        memory.write_u16(phys + 2, 0x0060).unwrap(); // ret cs
        memory.write_u16(phys + 4, 0x0202).unwrap(); // pushed flags (ignored)

        let mut regs = RegisterSnapshot::new(
            unsafe { std::mem::zeroed::<kvm_bindings::kvm_regs>() },
            unsafe { std::mem::zeroed::<kvm_bindings::kvm_sregs>() },
        );
        regs.set_sp(sp);
        regs.set_flags(0);

        complete_trap(&memory, &mut regs).unwrap();

        assert_eq!(regs.ip(), 0x0050);
        assert_eq!(regs.cs(), 0x0060);
        assert_eq!(regs.sp(), sp.wrapping_add(RETURN_FRAME_SIZE));
    }
}
