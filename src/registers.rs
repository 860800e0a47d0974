//! Register snapshot and real-mode segment register discipline.
//!
//! The DOS service layer (`dos`) and the dispatch loop (`supervisor`) never
//! touch raw `kvm_regs`/`kvm_sregs` fields directly; they go through
//! `RegisterSnapshot`, which exposes the 16-bit register view spec.md §3
//! describes (ax/al/ah, flags, segment selectors) and keeps the real-mode
//! invariant `base == selector << 4` (spec.md §3, §9) impossible to violate:
//! the only way to write a segment register is through `SegmentValue`, which
//! always derives `base` from `selector`.

use kvm_bindings::{kvm_regs, kvm_segment, kvm_sregs};

/// Bit 0 of the flags register: the carry flag.
const CF: u16 = 1 << 0;

/// A real-mode segment register value: selector plus its derived shadow
/// base. There is no way to construct one with `base != selector << 4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentValue {
    pub selector: u16,
}

impl SegmentValue {
    pub fn new(selector: u16) -> Self {
        Self { selector }
    }

    pub fn base(self) -> u32 {
        (self.selector as u32) << 4
    }

    /// Build a `kvm_segment` for a real-mode *data* segment (DS/ES/FS/GS/SS).
    pub fn to_kvm_data_segment(self) -> kvm_segment {
        real_mode_segment(self.selector, SEG_TYPE_DATA_WRITABLE_ACCESSED)
    }

    /// Build a `kvm_segment` for a real-mode *code* segment (CS).
    pub fn to_kvm_code_segment(self) -> kvm_segment {
        real_mode_segment(self.selector, SEG_TYPE_CODE_READABLE_ACCESSED)
    }
}

// Intel SDM Vol. 3A, 3.4.5.1 ("Code- and Data-Segment Descriptor Types").
const SEG_TYPE_DATA_WRITABLE_ACCESSED: u8 = 0b0011;
const SEG_TYPE_CODE_READABLE_ACCESSED: u8 = 0b1011;

/// Build a real-mode segment descriptor: byte-granular, 64 KiB limit,
/// present, a normal (non-system) code/data segment, 16-bit (db=0, l=0).
fn real_mode_segment(selector: u16, type_: u8) -> kvm_segment {
    kvm_segment {
        base: (selector as u64) << 4,
        limit: 0xffff,
        selector,
        type_,
        present: 1,
        dpl: 0,
        db: 0,
        s: 1,
        l: 0,
        g: 0,
        avl: 0,
        unusable: 0,
        padding: 0,
    }
}

/// The 16-bit register file and segment selectors carried across a VCPU
/// exit, per spec.md §3.
#[derive(Debug, Clone, Copy)]
pub struct RegisterSnapshot {
    regs: kvm_regs,
    sregs: kvm_sregs,
}

impl RegisterSnapshot {
    pub fn new(regs: kvm_regs, sregs: kvm_sregs) -> Self {
        Self { regs, sregs }
    }

    pub fn regs(&self) -> &kvm_regs {
        &self.regs
    }

    pub fn sregs(&self) -> &kvm_sregs {
        &self.sregs
    }

    // -- General-purpose 16-bit registers --

    pub fn ax(&self) -> u16 {
        self.regs.rax as u16
    }
    pub fn set_ax(&mut self, v: u16) {
        self.regs.rax = (self.regs.rax & !0xffff) | v as u64;
    }
    pub fn al(&self) -> u8 {
        self.ax() as u8
    }
    pub fn set_al(&mut self, v: u8) {
        self.set_ax((self.ax() & 0xff00) | v as u16);
    }
    pub fn ah(&self) -> u8 {
        (self.ax() >> 8) as u8
    }
    pub fn set_ah(&mut self, v: u8) {
        self.set_ax((self.ax() & 0x00ff) | ((v as u16) << 8));
    }

    pub fn bx(&self) -> u16 {
        self.regs.rbx as u16
    }
    pub fn set_bx(&mut self, v: u16) {
        self.regs.rbx = (self.regs.rbx & !0xffff) | v as u64;
    }

    pub fn cx(&self) -> u16 {
        self.regs.rcx as u16
    }
    pub fn set_cx(&mut self, v: u16) {
        self.regs.rcx = (self.regs.rcx & !0xffff) | v as u64;
    }

    pub fn dx(&self) -> u16 {
        self.regs.rdx as u16
    }
    pub fn set_dx(&mut self, v: u16) {
        self.regs.rdx = (self.regs.rdx & !0xffff) | v as u64;
    }
    pub fn dl(&self) -> u8 {
        self.dx() as u8
    }

    pub fn sp(&self) -> u16 {
        self.regs.rsp as u16
    }
    pub fn set_sp(&mut self, v: u16) {
        self.regs.rsp = (self.regs.rsp & !0xffff) | v as u64;
    }

    pub fn ip(&self) -> u16 {
        self.regs.rip as u16
    }
    pub fn set_ip(&mut self, v: u16) {
        self.regs.rip = (self.regs.rip & !0xffff) | v as u64;
    }

    pub fn flags(&self) -> u16 {
        self.regs.rflags as u16
    }
    pub fn set_flags(&mut self, v: u16) {
        self.regs.rflags = (self.regs.rflags & !0xffff) | v as u64;
    }

    pub fn carry(&self) -> bool {
        self.flags() & CF != 0
    }
    pub fn set_carry(&mut self) {
        self.set_flags(self.flags() | CF);
    }
    pub fn clear_carry(&mut self) {
        self.set_flags(self.flags() & !CF);
    }

    // -- Segment selectors --

    pub fn cs(&self) -> u16 {
        self.sregs.cs.selector
    }
    pub fn ds(&self) -> u16 {
        self.sregs.ds.selector
    }
    pub fn ss(&self) -> u16 {
        self.sregs.ss.selector
    }

    /// Set cs to `value`, updating both the selector and its shadow base
    /// (spec.md §3, §9: this cannot be left implicit).
    pub fn set_cs(&mut self, value: SegmentValue) {
        self.sregs.cs = value.to_kvm_code_segment();
    }
}
