//! x86_64 architecture backend.
//!
//! Relocation formulas as defined in the System V AMD64 psABI.
//! Reference: <https://gitlab.com/x86-psABIs/x86-64-ABI>

use object::elf;

use super::Architecture;
use crate::error::{ErrorKind, LinkError, Result};

/// The x86_64 backend.
#[derive(Debug, Clone, Copy)]
pub struct X86_64;

impl Architecture for X86_64 {
    fn needs_got_entry(r_type: u32) -> bool {
        matches!(
            r_type,
            elf::R_X86_64_GOT32
                | elf::R_X86_64_GOT64
                | elf::R_X86_64_GOTPCREL
                | elf::R_X86_64_GOTPCREL64
                | elf::R_X86_64_GOTPCRELX
                | elf::R_X86_64_REX_GOTPCRELX
        )
    }

    fn relocation_value(
        r_type: u32,
        s: u64,
        sym_value: u64,
        addend: i64,
        p: u64,
        got: u64,
    ) -> Result<(u64, usize)> {
        let s_a = s.wrapping_add_signed(addend);
        // G is the symbol's byte offset into the GOT; SIZE relocations carry
        // the symbol size in the same slot.
        let g = sym_value;

        let (value, size) = match r_type {
            elf::R_X86_64_NONE => (0, 0),
            elf::R_X86_64_64 => (s_a, 8),
            // There is no procedure linkage table; in a fixed-address
            // executable the branch target is known directly.
            elf::R_X86_64_PC32 | elf::R_X86_64_PLT32 => (s_a.wrapping_sub(p), 4),
            elf::R_X86_64_GOT32 => (g.wrapping_add_signed(addend), 4),
            elf::R_X86_64_GLOB_DAT | elf::R_X86_64_JUMP_SLOT => (s, 8),
            elf::R_X86_64_GOTPCREL | elf::R_X86_64_GOTPCRELX | elf::R_X86_64_REX_GOTPCRELX => {
                (g.wrapping_add(got).wrapping_add_signed(addend).wrapping_sub(p), 4)
            }
            elf::R_X86_64_32 | elf::R_X86_64_32S => (s_a, 4),
            elf::R_X86_64_16 => (s_a, 2),
            elf::R_X86_64_PC16 => (s_a.wrapping_sub(p), 2),
            elf::R_X86_64_8 => (s_a, 1),
            elf::R_X86_64_PC8 => (s_a.wrapping_sub(p), 1),
            elf::R_X86_64_PC64 => (s_a.wrapping_sub(p), 8),
            elf::R_X86_64_GOTOFF64 => (s_a.wrapping_sub(got), 8),
            elf::R_X86_64_GOTPC32 => (got.wrapping_add_signed(addend).wrapping_sub(p), 4),
            elf::R_X86_64_GOT64 => (g.wrapping_add_signed(addend), 8),
            elf::R_X86_64_GOTPCREL64 => {
                (g.wrapping_add(got).wrapping_add_signed(addend).wrapping_sub(p), 8)
            }
            elf::R_X86_64_GOTPC64 => (got.wrapping_add_signed(addend).wrapping_sub(p), 8),
            elf::R_X86_64_SIZE32 => (sym_value.wrapping_add_signed(addend), 4),
            elf::R_X86_64_SIZE64 => (sym_value.wrapping_add_signed(addend), 8),
            _ => {
                return Err(LinkError::report(
                    ErrorKind::NotOk,
                    format!("unsupported relocation type {r_type}"),
                ))
            }
        };
        Ok((value, size))
    }
}
