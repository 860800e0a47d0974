//! Guest physical memory.
//!
//! A flat 2 MiB guest-physical address space (spec.md §3, §4.1), backed by
//! `vm_memory::GuestMemoryMmap` the same way `carbon`'s `boot::memory`
//! module is, but split into the two ranges spec.md's memory map calls for:
//!
//! | Range | Content | Protection |
//! |---|---|---|
//! | `0x00000`-`0x00FFF` | IVT + halt table + reserved | read-only |
//! | `0x01000`-end | PSP, program image, stack/heap | read-write |
//!
//! The split exists so the low range can be registered with KVM as its own,
//! read-only memory slot (see `kvm::vm::VmFd::set_user_memory_region`): a
//! guest that wild-writes into the interrupt table faults through
//! `KVM_EXIT_MMIO` rather than corrupting the dispatch table that makes the
//! interrupt-trap mechanism work at all.
//!
//! This system does not model the 20-bit address wrap real hardware (or an
//! un-gated A20 line) would apply: guest pointers are `(segment, offset)`
//! pairs decoded as `(segment << 4) + offset` and clamped only against the 2
//! MiB bound, never wrapped. Programs relying on A20 wraparound are out of
//! scope (spec.md §9 open question).

use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

use crate::error::SupervisorError;

/// Total guest physical memory, in bytes (spec.md §3: "a flat 2 MiB byte
/// buffer").
pub const MEM_SIZE: u64 = 2 << 20;

/// Size of the read-only low region: IVT (0x000-0x3FF) + halt table
/// (0x400-0x4FF) + reserved (0x500-0xFFF), rounded up to a page.
pub const IVT_REGION_SIZE: u64 = 0x1000;

/// Paragraph at which the guest program segment begins. The PSP occupies
/// `BASE_PARA:0000`-`BASE_PARA:00FF`; the loaded image starts at
/// `BASE_PARA:0100`.
pub const BASE_PARA: u16 = 0x0100;

/// Physical address of the start of the program segment.
pub fn base_addr() -> u64 {
    (BASE_PARA as u64) << 4
}

/// Value DOS programs see at PSP offset 0x02: top-of-memory paragraph.
pub const TOP_OF_MEMORY_PARA: u16 = 0xA000;

/// One memory slot to register with KVM: `(slot, guest_addr, size,
/// host_addr, readonly)`.
pub struct KvmRegion {
    pub slot: u32,
    pub guest_addr: u64,
    pub size: u64,
    pub host_addr: u64,
    pub readonly: bool,
}

/// Guest physical memory, owning the two backing mmap'd regions.
pub struct GuestMemory {
    inner: GuestMemoryMmap,
}

impl GuestMemory {
    /// Allocate a fresh, zeroed 2 MiB guest memory space.
    pub fn new() -> Result<Self, SupervisorError> {
        let regions = vec![
            (GuestAddress(0), IVT_REGION_SIZE as usize),
            (
                GuestAddress(IVT_REGION_SIZE),
                (MEM_SIZE - IVT_REGION_SIZE) as usize,
            ),
        ];
        let inner = GuestMemoryMmap::from_ranges(&regions).map_err(|e| {
            SupervisorError::FatalExit(format!("failed to allocate guest memory: {e}"))
        })?;
        Ok(Self { inner })
    }

    /// The two KVM memory slots this address space registers as: slot 0 is
    /// the read-only interrupt-table range, slot 1 is the read-write
    /// remainder.
    pub fn kvm_regions(&self) -> Vec<KvmRegion> {
        self.inner
            .iter()
            .enumerate()
            .map(|(slot, region)| KvmRegion {
                slot: slot as u32,
                guest_addr: region.start_addr().0,
                size: region.len(),
                host_addr: region.as_ptr() as u64,
                readonly: slot == 0,
            })
            .collect()
    }

    /// Whether `[addr, addr+len)` lies entirely within guest RAM. Every DOS
    /// service that dereferences a caller-supplied `(segment, offset,
    /// length)` must call this before touching memory (spec.md §4.6, §9).
    pub fn in_bounds(&self, addr: u64, len: usize) -> bool {
        match addr.checked_add(len as u64) {
            Some(end) => end <= MEM_SIZE,
            None => false,
        }
    }

    /// Real-mode physical address for a `(segment, offset)` pair. Not
    /// wrapped at 1 MiB/2^20 (spec.md §9 open question) and not bounds
    /// checked by itself; callers must still use `in_bounds`.
    pub fn phys_addr(segment: u16, offset: u16) -> u64 {
        ((segment as u64) << 4) + offset as u64
    }

    /// Write `data` at guest physical address `addr`. Used by setup code
    /// (image loading, PSP construction, IVT initialization) where an
    /// out-of-range write is a fatal supervisor error, not a guest-visible
    /// DOS error.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), SupervisorError> {
        if !self.in_bounds(addr, data.len()) {
            return Err(SupervisorError::FatalExit(format!(
                "write of {} bytes at {addr:#x} exceeds guest memory",
                data.len()
            )));
        }
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|e| SupervisorError::FatalExit(format!("guest memory write failed: {e}")))
    }

    /// Read `data.len()` bytes from guest physical address `addr`.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), SupervisorError> {
        if !self.in_bounds(addr, data.len()) {
            return Err(SupervisorError::FatalExit(format!(
                "read of {} bytes at {addr:#x} exceeds guest memory",
                data.len()
            )));
        }
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|e| SupervisorError::FatalExit(format!("guest memory read failed: {e}")))
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), SupervisorError> {
        self.write(addr, &[value])
    }

    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), SupervisorError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn read_u16(&self, addr: u64, data: &mut [u8; 2]) -> Result<(), SupervisorError> {
        self.read(addr, data)
    }

    /// Read a slice of guest memory into a fresh `Vec`, for DOS service
    /// reads/writes that have already passed an `in_bounds` check.
    pub fn read_vec(&self, addr: u64, len: usize) -> Result<Vec<u8>, SupervisorError> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }
}
