//! DOS service emulation (spec.md §4.6).
//!
//! Each function is dispatched by `(int_num, ah)` and operates on a
//! `RegisterSnapshot` already popped off the trap (see `supervisor`) plus
//! guest memory and the host standard streams. Guest-visible failures
//! (invalid handle, bounds violation) are written into the register
//! snapshot and the guest is resumed; anything this layer cannot express
//! back to the guest is a `SupervisorError` that terminates the whole
//! process (spec.md §7 kinds 2 vs. 3).

use crate::error::SupervisorError;
use crate::memory::GuestMemory;
use crate::registers::RegisterSnapshot;

/// Raw host file descriptors the guest's handle space maps onto. The
/// supervisor never opens its own stdio streams; it reads and writes the
/// same 0/1/2 descriptors the host process inherited, the same way
/// `kvikdos.c` calls `read(2)`/`write(2)` directly rather than going through
/// buffered C stdio.
pub trait HostStreams {
    fn write_fd(&mut self, fd: i32, data: &[u8]) -> std::io::Result<usize>;
    fn read_fd(&mut self, fd: i32, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// `HostStreams` backed by the process's real stdin/stdout/stderr.
pub struct StdFds;

impl HostStreams for StdFds {
    fn write_fd(&mut self, fd: i32, data: &[u8]) -> std::io::Result<usize> {
        let ret = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if ret < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }

    fn read_fd(&mut self, fd: i32, buf: &mut [u8]) -> std::io::Result<usize> {
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if ret < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }
}

const FD_STDIN: i32 = 0;
const FD_STDOUT: i32 = 1;
const FD_STDERR: i32 = 2;

/// DOS invalid-handle / I/O-fault return code (AX value, not a host errno).
const AX_INVALID_HANDLE: u16 = 6;
const AX_WRITE_FAULT: u16 = 0x1D;
const AX_READ_FAULT: u16 = 0x1E;

/// What the dispatch loop should do after a service returns.
pub enum Outcome {
    /// Resume the guest; `regs` has already been updated in place.
    Resume,
    /// Terminate the whole process with this exit code.
    Terminate(u8),
}

/// Dispatch a trapped software interrupt to the DOS service it names.
///
/// `regs` is mutated in place with the service's return values; the caller
/// is responsible for the interrupt-return bookkeeping (spec.md §4.4).
pub fn dispatch(
    int_num: u8,
    regs: &mut RegisterSnapshot,
    memory: &GuestMemory,
    streams: &mut dyn HostStreams,
) -> Result<Outcome, SupervisorError> {
    match int_num {
        0x20 => Ok(Outcome::Terminate(0)),
        0x21 => dispatch_21h(regs, memory, streams),
        0x29 => {
            write_or_fatal(streams, FD_STDOUT, regs.al())?;
            Ok(Outcome::Resume)
        }
        0x10 if regs.ah() == 0x0E => {
            write_or_fatal(streams, FD_STDOUT, regs.al())?;
            Ok(Outcome::Resume)
        }
        _ => Err(unsupported(int_num, regs.ah())),
    }
}

fn dispatch_21h(
    regs: &mut RegisterSnapshot,
    memory: &GuestMemory,
    streams: &mut dyn HostStreams,
) -> Result<Outcome, SupervisorError> {
    match regs.ah() {
        0x4C => Ok(Outcome::Terminate(regs.al())),

        0x30 => {
            regs.set_ax(0x0005);
            regs.set_bx(0xFF00);
            regs.set_cx(0);
            Ok(Outcome::Resume)
        }

        // Direct console I/O. Only the output side (DL != 0xFF) is
        // implemented; a guest polling for console input (DL == 0xFF) is
        // resumed as a no-op rather than terminated, matching kvikdos.c's
        // shared fall-through to the interrupt-return path.
        0x06 => {
            let dl = regs.dl();
            if dl != 0xFF {
                write_or_fatal(streams, FD_STDOUT, dl)?;
            }
            Ok(Outcome::Resume)
        }

        0x04 => {
            write_or_fatal(streams, FD_STDERR, regs.dl())?;
            Ok(Outcome::Resume)
        }

        0x05 => {
            write_or_fatal(streams, FD_STDOUT, regs.dl())?;
            Ok(Outcome::Resume)
        }

        0x09 => print_dollar_string(regs, memory, streams),

        0x40 => handle_write(regs, memory, streams),
        0x3F => handle_read(regs, memory, streams),

        ah => Err(unsupported(0x21, ah)),
    }
}

fn unsupported(int_num: u8, ah: u8) -> SupervisorError {
    SupervisorError::FatalExit(format!(
        "unsupported DOS service: int {int_num:#04x} ah={ah:#04x}"
    ))
}

fn write_or_fatal(
    streams: &mut dyn HostStreams,
    fd: i32,
    byte: u8,
) -> Result<(), SupervisorError> {
    streams
        .write_fd(fd, &[byte])
        .map(|_| ())
        .map_err(|e| SupervisorError::FatalExit(format!("write to fd {fd} failed: {e}")))
}

/// Write handle (BX) to host fd, for AH=40h.
fn write_fd_for_handle(handle: u16) -> Option<i32> {
    match handle {
        0 => Some(FD_STDIN),
        1 => Some(FD_STDOUT),
        2 | 3 => Some(FD_STDERR),
        4 => Some(FD_STDOUT),
        _ => None,
    }
}

/// Read handle (BX) to host fd, for AH=3Fh.
fn read_fd_for_handle(handle: u16) -> Option<i32> {
    match handle {
        0 => Some(FD_STDIN),
        1 => Some(FD_STDOUT),
        2 | 3 => Some(FD_STDERR),
        4 => Some(FD_STDIN),
        _ => None,
    }
}

fn handle_write(
    regs: &mut RegisterSnapshot,
    memory: &GuestMemory,
    streams: &mut dyn HostStreams,
) -> Result<Outcome, SupervisorError> {
    let Some(fd) = write_fd_for_handle(regs.bx()) else {
        return Ok(invalid_handle(regs));
    };

    let addr = GuestMemory::phys_addr(regs.ds(), regs.dx());
    let len = regs.cx() as usize;
    if !memory.in_bounds(addr, len) {
        return Ok(invalid_handle(regs));
    }
    let data = memory.read_vec(addr, len)?;

    match streams.write_fd(fd, &data) {
        Ok(n) => {
            regs.set_ax(n as u16);
            regs.clear_carry();
        }
        Err(_) => {
            regs.set_ax(AX_WRITE_FAULT);
            regs.set_carry();
        }
    }
    Ok(Outcome::Resume)
}

fn handle_read(
    regs: &mut RegisterSnapshot,
    memory: &GuestMemory,
    streams: &mut dyn HostStreams,
) -> Result<Outcome, SupervisorError> {
    let Some(fd) = read_fd_for_handle(regs.bx()) else {
        return Ok(invalid_handle(regs));
    };

    let addr = GuestMemory::phys_addr(regs.ds(), regs.dx());
    let len = regs.cx() as usize;
    if !memory.in_bounds(addr, len) {
        return Ok(invalid_handle(regs));
    }

    let mut buf = vec![0u8; len];
    match streams.read_fd(fd, &mut buf) {
        Ok(n) => {
            memory.write(addr, &buf[..n])?;
            regs.set_ax(n as u16);
            regs.clear_carry();
        }
        Err(_) => {
            regs.set_ax(AX_READ_FAULT);
            regs.set_carry();
        }
    }
    Ok(Outcome::Resume)
}

fn invalid_handle(regs: &mut RegisterSnapshot) -> Outcome {
    regs.set_ax(AX_INVALID_HANDLE);
    regs.set_carry();
    Outcome::Resume
}

/// AH=09h: print bytes at DS:DX up to (excluding) the first `$`.
///
/// Scans forward from DX only as far as offset 0xFFFF; the scan does not
/// implement wraparound (spec.md §4.6 explicitly forbids it). The instant
/// the 16-bit offset would wrap past 0xFFFF back to 0, the guest has no way
/// to recover and this is a fatal supervisor error (spec.md §4.6, §8
/// boundary case), matching kvikdos.c:308-314's `++dx; if (dx == 0)` check
/// rather than scanning back down through `[0, start)`.
fn print_dollar_string(
    regs: &mut RegisterSnapshot,
    memory: &GuestMemory,
    streams: &mut dyn HostStreams,
) -> Result<Outcome, SupervisorError> {
    let ds = regs.ds();
    let mut offset = regs.dx();
    let mut out = Vec::new();

    loop {
        let addr = GuestMemory::phys_addr(ds, offset);
        if !memory.in_bounds(addr, 1) {
            return Ok(invalid_handle(regs));
        }
        let byte = memory.read_vec(addr, 1)?[0];
        if byte == b'$' {
            break;
        }
        out.push(byte);
        offset = offset.wrapping_add(1);
        if offset == 0 {
            return Err(SupervisorError::FatalExit(
                "AH=09h string has no terminating '$' within the segment".to_string(),
            ));
        }
    }

    streams
        .write_fd(FD_STDOUT, &out)
        .map_err(|e| SupervisorError::FatalExit(format!("write to fd {FD_STDOUT} failed: {e}")))?;
    Ok(Outcome::Resume)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_bindings::{kvm_regs, kvm_sregs};
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockStreams {
        written: HashMap<i32, Vec<u8>>,
        to_read: HashMap<i32, Vec<u8>>,
    }

    impl HostStreams for MockStreams {
        fn write_fd(&mut self, fd: i32, data: &[u8]) -> std::io::Result<usize> {
            self.written.entry(fd).or_default().extend_from_slice(data);
            Ok(data.len())
        }

        fn read_fd(&mut self, fd: i32, buf: &mut [u8]) -> std::io::Result<usize> {
            let queue = self.to_read.entry(fd).or_default();
            let n = queue.len().min(buf.len());
            buf[..n].copy_from_slice(&queue[..n]);
            queue.drain(..n);
            Ok(n)
        }
    }

    fn blank_regs() -> RegisterSnapshot {
        RegisterSnapshot::new(
            unsafe { std::mem::zeroed::<kvm_regs>() },
            unsafe { std::mem::zeroed::<kvm_sregs>() },
        )
    }

    #[test]
    fn int_20h_terminates_with_code_zero() {
        let mem = GuestMemory::new().unwrap();
        let mut streams = MockStreams::default();
        let mut regs = blank_regs();
        let outcome = dispatch(0x20, &mut regs, &mem, &mut streams).unwrap();
        assert!(matches!(outcome, Outcome::Terminate(0)));
    }

    #[test]
    fn ah_4c_exit_propagates_al() {
        let mem = GuestMemory::new().unwrap();
        let mut streams = MockStreams::default();
        let mut regs = blank_regs();
        regs.set_ax(0x4C2A);
        let outcome = dispatch(0x21, &mut regs, &mem, &mut streams).unwrap();
        assert!(matches!(outcome, Outcome::Terminate(42)));
    }

    #[test]
    fn ah_30_reports_dos_version_5() {
        let mem = GuestMemory::new().unwrap();
        let mut streams = MockStreams::default();
        let mut regs = blank_regs();
        regs.set_ah(0x30);
        dispatch(0x21, &mut regs, &mem, &mut streams).unwrap();
        assert_eq!(regs.ax(), 0x0005);
        assert_eq!(regs.bx(), 0xFF00);
        assert_eq!(regs.cx(), 0);
    }

    #[test]
    fn ah_09_prints_up_to_dollar() {
        // ds defaults to selector 0 in a zeroed snapshot, so dx is a
        // physical address directly; place the message there.
        let mem = GuestMemory::new().unwrap();
        mem.write(0x2000, b"Hi$garbage").unwrap();
        let mut streams = MockStreams::default();
        let mut regs = blank_regs();
        regs.set_ah(0x09);
        regs.set_dx(0x2000);
        let outcome = dispatch(0x21, &mut regs, &mem, &mut streams).unwrap();
        assert!(matches!(outcome, Outcome::Resume));
        assert_eq!(streams.written.get(&FD_STDOUT).unwrap(), b"Hi");
    }

    #[test]
    fn handle_write_to_stdout_reports_bytes_transferred() {
        let mem = GuestMemory::new().unwrap();
        mem.write(0x2000, b"Hello").unwrap();
        let mut streams = MockStreams::default();
        let mut regs = blank_regs();
        regs.set_ah(0x40);
        regs.set_bx(1);
        regs.set_cx(5);
        regs.set_dx(0x2000);
        let outcome = handle_write(&mut regs, &mem, &mut streams).unwrap();
        assert!(matches!(outcome, Outcome::Resume));
        assert_eq!(regs.ax(), 5);
        assert!(!regs.carry());
        assert_eq!(streams.written.get(&FD_STDOUT).unwrap(), b"Hello");
    }

    #[test]
    fn handle_write_with_invalid_handle_sets_ax_6_and_carry() {
        let mem = GuestMemory::new().unwrap();
        let mut streams = MockStreams::default();
        let mut regs = blank_regs();
        regs.set_bx(99);
        regs.set_cx(5);
        let outcome = handle_write(&mut regs, &mem, &mut streams).unwrap();
        assert!(matches!(outcome, Outcome::Resume));
        assert_eq!(regs.ax(), AX_INVALID_HANDLE);
        assert!(regs.carry());
    }

    #[test]
    fn handle_write_out_of_bounds_is_invalid_handle_not_fatal() {
        let mem = GuestMemory::new().unwrap();
        let mut streams = MockStreams::default();
        let mut regs = blank_regs();
        regs.set_bx(1);
        regs.set_dx(0xFFFE);
        regs.set_cx(0xFFFF);
        let outcome = handle_write(&mut regs, &mem, &mut streams).unwrap();
        assert!(matches!(outcome, Outcome::Resume));
        assert_eq!(regs.ax(), AX_INVALID_HANDLE);
        assert!(regs.carry());
    }

    #[test]
    fn unsupported_service_is_fatal() {
        let mem = GuestMemory::new().unwrap();
        let mut streams = MockStreams::default();
        let mut regs = blank_regs();
        regs.set_ah(0xFF);
        assert!(dispatch(0x21, &mut regs, &mem, &mut streams).is_err());
    }

    #[test]
    fn unknown_vector_is_fatal() {
        let mem = GuestMemory::new().unwrap();
        let mut streams = MockStreams::default();
        let mut regs = blank_regs();
        assert!(dispatch(0x13, &mut regs, &mem, &mut streams).is_err());
    }

    #[test]
    fn ah_0e_teletype_writes_al_to_stdout() {
        let mem = GuestMemory::new().unwrap();
        let mut streams = MockStreams::default();
        let mut regs = blank_regs();
        regs.set_ah(0x0E);
        regs.set_al(b'X');
        dispatch(0x10, &mut regs, &mem, &mut streams).unwrap();
        assert_eq!(streams.written.get(&FD_STDOUT).unwrap(), b"X");
    }

    #[test]
    fn int_29_fast_console_output_writes_al() {
        let mem = GuestMemory::new().unwrap();
        let mut streams = MockStreams::default();
        let mut regs = blank_regs();
        regs.set_al(b'Z');
        dispatch(0x29, &mut regs, &mem, &mut streams).unwrap();
        assert_eq!(streams.written.get(&FD_STDOUT).unwrap(), b"Z");
    }

    #[test]
    fn ah_06_writes_dl_when_not_an_input_poll() {
        let mem = GuestMemory::new().unwrap();
        let mut streams = MockStreams::default();
        let mut regs = blank_regs();
        regs.set_ah(0x06);
        regs.set_dx(b'Q' as u16);
        let outcome = dispatch(0x21, &mut regs, &mem, &mut streams).unwrap();
        assert!(matches!(outcome, Outcome::Resume));
        assert_eq!(streams.written.get(&FD_STDOUT).unwrap(), b"Q");
    }

    #[test]
    fn ah_06_with_dl_ff_is_a_resumed_no_op_not_fatal() {
        let mem = GuestMemory::new().unwrap();
        let mut streams = MockStreams::default();
        let mut regs = blank_regs();
        regs.set_ah(0x06);
        regs.set_dx(0xFF);
        let outcome = dispatch(0x21, &mut regs, &mem, &mut streams).unwrap();
        assert!(matches!(outcome, Outcome::Resume));
        assert!(streams.written.get(&FD_STDOUT).is_none());
    }

    #[test]
    fn ah_09_is_fatal_on_offset_wrap_rather_than_scanning_below_dx() {
        // Place a '$' at a low offset that a wrapping scan would reach, but
        // that the non-wrapping scan required by spec.md must never see.
        let mem = GuestMemory::new().unwrap();
        mem.write(0x2000, b"$").unwrap();
        let mut streams = MockStreams::default();
        let mut regs = blank_regs();
        regs.set_ah(0x09);
        regs.set_dx(0xFFFF);
        let outcome = dispatch(0x21, &mut regs, &mem, &mut streams);
        assert!(outcome.is_err());
        assert!(streams.written.get(&FD_STDOUT).is_none());
    }
}
