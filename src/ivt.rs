//! The magic interrupt table: turning every software interrupt into a
//! recoverable VM exit.
//!
//! Real DOS programs talk to the operating system by executing `int n`.
//! Normally the CPU would consult the interrupt vector table (IVT) at
//! physical address 0 and jump to whatever handler is installed there. This
//! supervisor has no real handler to jump to — instead it installs 256
//! identical far pointers, all pointing into a table of 256 `hlt`
//! instructions, one per interrupt vector (spec.md §3, §4.4):
//!
//! ```text
//! IVT[n]            = far pointer (cs=0x0040, ip=n)     for n in 0..256
//! 0x0400 + n         = 0xF4 ("hlt")                      for n in 0..256
//! ```
//!
//! Executing `int n` therefore always ends with the guest halting at
//! `0x0040:(n+1)` (one past the `hlt` it just executed), and halting always
//! exits the VM back to the supervisor (see `kvm::vm` for why — no in-kernel
//! IRQ chip is created). The interrupt number is recovered purely from where
//! the halt happened: `decode_trap` is the inverse of this table's
//! construction.

use crate::error::SupervisorError;
use crate::memory::GuestMemory;

/// Code segment selector every IVT entry points into.
pub const TRAP_CS: u16 = 0x0040;

/// Physical address of the halt table (256 `hlt` opcodes, one per vector).
const HALT_TABLE_BASE: u64 = 0x0400;

/// Opcode for the `hlt` instruction.
const HLT_OPCODE: u8 = 0xF4;

/// Install the magic interrupt table into guest memory: 256 far pointers at
/// physical `0x000`-`0x3FF`, followed by 256 `hlt` opcodes at `0x400`-`0x4FF`.
pub fn install(memory: &GuestMemory) -> Result<(), SupervisorError> {
    for n in 0u16..256 {
        let entry_addr = (n as u64) * 4;
        // A far pointer is stored offset-then-segment in memory.
        memory.write_u16(entry_addr, n)?;
        memory.write_u16(entry_addr + 2, TRAP_CS)?;
    }
    memory.write(HALT_TABLE_BASE, &[HLT_OPCODE; 256])?;
    Ok(())
}

/// Recover the interrupt number from a halt exit's `(cs, ip)`, if it was
/// caused by this table rather than a real `hlt` in guest code (spec.md
/// §4.4 recovery rule).
pub fn decode_trap(cs: u16, ip: u16) -> Option<u8> {
    if cs == TRAP_CS && (1..=0x100).contains(&ip) {
        Some((ip - 1) as u8)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installed_table_matches_the_byte_pattern_spec_requires() {
        let mem = GuestMemory::new().unwrap();
        install(&mem).unwrap();

        for n in 0u16..256 {
            let mut entry = [0u8; 4];
            mem.read(n as u64 * 4, &mut entry).unwrap();
            assert_eq!(u16::from_le_bytes([entry[0], entry[1]]), n);
            assert_eq!(u16::from_le_bytes([entry[2], entry[3]]), TRAP_CS);
        }

        let halts = mem.read_vec(HALT_TABLE_BASE, 256).unwrap();
        assert!(halts.iter().all(|&b| b == HLT_OPCODE));
    }

    #[test]
    fn decodes_traps_in_range() {
        assert_eq!(decode_trap(TRAP_CS, 1), Some(0));
        assert_eq!(decode_trap(TRAP_CS, 0x100), Some(0xff));
        assert_eq!(decode_trap(TRAP_CS, 0x21 + 1), Some(0x21));
    }

    #[test]
    fn rejects_real_halts() {
        assert_eq!(decode_trap(TRAP_CS, 0), None);
        assert_eq!(decode_trap(TRAP_CS, 0x101), None);
        assert_eq!(decode_trap(0x1234, 5), None);
    }
}
