//! Guest image loading and Program Segment Prefix construction (spec.md
//! §4.3).
//!
//! The guest image is a raw `.com` file: an unbounded byte sequence loaded
//! verbatim at `BASE_PARA:0100`, with no header parsing or relocation. The
//! PSP occupies the 256 bytes immediately before it, `BASE_PARA:0000`-
//! `BASE_PARA:00FF`.

use std::fs;

use crate::error::SupervisorError;
use crate::memory::{base_addr, GuestMemory, MEM_SIZE, TOP_OF_MEMORY_PARA};

/// Offset of the `.com` entry point within the program segment.
const IMAGE_OFFSET: u64 = 0x100;

/// Offset of the command-tail length byte within the PSP.
const COMMAND_TAIL_OFFSET: u64 = 0x80;

/// Maximum content bytes (leading spaces + argument text) the command tail
/// can hold: the tail field spans PSP offsets 0x80-0xFF (128 bytes) — one
/// length byte, up to 126 content bytes, and a trailing `\r` that must still
/// land inside the PSP rather than overwriting the loaded image at offset
/// 0x100.
const MAX_TAIL_LEN: usize = 126;

/// Load a raw `.com` image into guest memory at `BASE_PARA:0100`.
///
/// Fails if the file cannot be opened or read, or if it would overflow the
/// memory available after the PSP (spec.md §4.3, §8 boundary case).
pub fn load_image(path: &str, memory: &GuestMemory) -> Result<(), SupervisorError> {
    let bytes = fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            SupervisorError::OpenImage {
                path: path.to_string(),
                source,
            }
        } else {
            SupervisorError::ReadImage {
                path: path.to_string(),
                source,
            }
        }
    })?;

    let load_addr = base_addr() + IMAGE_OFFSET;
    let available = MEM_SIZE - load_addr;
    if bytes.len() as u64 > available {
        return Err(SupervisorError::ImageTooLarge {
            size: bytes.len() as u64,
            available,
        });
    }

    memory.write(load_addr, &bytes)
}

/// Build the Program Segment Prefix at `BASE_PARA:0000`.
///
/// Writes the `INT 20h` termination opcode at offset 0, the top-of-memory
/// paragraph at offset 2, and the DOS command-line tail at offset 0x80,
/// constructed from `args` by prefixing every argument with a single space
/// (MS-DOS convention: the byte before the first argument is also a space).
pub fn build_psp(memory: &GuestMemory, args: &[String]) -> Result<(), SupervisorError> {
    let psp = base_addr();

    // `CD 20`, the `int 0x20` opcode, stored low-byte first.
    memory.write_u16(psp, 0x20_CD)?;
    memory.write_u16(psp + 2, TOP_OF_MEMORY_PARA)?;

    let mut tail = Vec::new();
    for arg in args {
        tail.push(b' ');
        tail.extend_from_slice(arg.as_bytes());
    }
    if tail.len() > MAX_TAIL_LEN {
        return Err(SupervisorError::CommandLineTooLong { len: tail.len() });
    }

    memory.write_u8(psp + COMMAND_TAIL_OFFSET, tail.len() as u8)?;
    memory.write(psp + COMMAND_TAIL_OFFSET + 1, &tail)?;
    memory.write_u8(psp + COMMAND_TAIL_OFFSET + 1 + tail.len() as u64, b'\r')?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_args_give_a_zero_length_tail() {
        let mem = GuestMemory::new().unwrap();
        build_psp(&mem, &[]).unwrap();
        let mut len = [0u8; 1];
        mem.read(base_addr() + COMMAND_TAIL_OFFSET, &mut len).unwrap();
        assert_eq!(len[0], 0);
        let mut cr = [0u8; 1];
        mem.read(base_addr() + COMMAND_TAIL_OFFSET + 1, &mut cr).unwrap();
        assert_eq!(cr[0], b'\r');
    }

    #[test]
    fn two_args_match_the_spec_scenario() {
        let mem = GuestMemory::new().unwrap();
        build_psp(&mem, &["foo".to_string(), "bar".to_string()]).unwrap();

        let mut len = [0u8; 1];
        mem.read(base_addr() + COMMAND_TAIL_OFFSET, &mut len).unwrap();
        assert_eq!(len[0], 8);

        let tail = mem.read_vec(base_addr() + COMMAND_TAIL_OFFSET + 1, 8).unwrap();
        assert_eq!(tail, b" foo bar");

        let mut cr = [0u8; 1];
        mem.read(base_addr() + COMMAND_TAIL_OFFSET + 1 + 8, &mut cr)
            .unwrap();
        assert_eq!(cr[0], b'\r');
    }

    #[test]
    fn termination_opcode_and_top_of_memory_are_set() {
        let mem = GuestMemory::new().unwrap();
        build_psp(&mem, &[]).unwrap();
        let mut opcode = [0u8; 2];
        mem.read(base_addr(), &mut opcode).unwrap();
        assert_eq!(opcode, [0xCD, 0x20]);
        let mut top = [0u8; 2];
        mem.read(base_addr() + 2, &mut top).unwrap();
        assert_eq!(u16::from_le_bytes(top), TOP_OF_MEMORY_PARA);
    }

    #[test]
    fn tail_of_126_content_bytes_succeeds() {
        let mem = GuestMemory::new().unwrap();
        let arg = "x".repeat(125);
        build_psp(&mem, &[arg]).unwrap();
    }

    #[test]
    fn tail_of_127_content_bytes_is_fatal() {
        let mem = GuestMemory::new().unwrap();
        let arg = "x".repeat(126);
        assert!(build_psp(&mem, &[arg]).is_err());
    }

    #[test]
    fn image_one_byte_over_the_limit_is_fatal() {
        let mem = GuestMemory::new().unwrap();
        let available = (MEM_SIZE - base_addr() - IMAGE_OFFSET) as usize;
        let path = std::env::temp_dir().join(format!(
            "dosvisor-test-{}-{}.com",
            std::process::id(),
            "oversize"
        ));
        std::fs::write(&path, vec![0u8; available + 1]).unwrap();
        let result = load_image(path.to_str().unwrap(), &mem);
        let _ = std::fs::remove_file(&path);
        assert!(result.is_err());
    }

    #[test]
    fn image_exactly_at_the_limit_succeeds() {
        let mem = GuestMemory::new().unwrap();
        let available = (MEM_SIZE - base_addr() - IMAGE_OFFSET) as usize;
        let path = std::env::temp_dir().join(format!(
            "dosvisor-test-{}-{}.com",
            std::process::id(),
            "exact"
        ));
        std::fs::write(&path, vec![0u8; available]).unwrap();
        let result = load_image(path.to_str().unwrap(), &mem);
        let _ = std::fs::remove_file(&path);
        assert!(result.is_ok());
    }
}
