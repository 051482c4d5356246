//! ELF file writer.
//!
//! The output file is truncated to its final size and memory-mapped; content
//! is memcpied in. Each output section owns a disjoint slice of the mapping,
//! so section bodies and their relocations are written in parallel without
//! locks. The file is left executable on disk.

use memmap2::MmapMut;
use object::elf;
use object::pod::{bytes_of, bytes_of_slice};
use object::LittleEndian;
use rayon::prelude::*;
use std::fs::OpenOptions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::arch::Architecture;
use crate::error::{ErrorKind, LinkError, Result};
use crate::input::ElfInput;
use crate::layout::LoadedLayout;
use crate::relocs::{ProcessedRela, RelaNote};
use crate::sections::{OutputPlan, SectionCopies};

pub struct WriteParams<'a, 'data> {
    pub output_path: &'a Path,
    pub inputs: &'a [ElfInput<'data>],
    pub plan: &'a OutputPlan<'data>,
    pub layout: &'a LoadedLayout,
    pub file_header: &'a elf::FileHeader64<LittleEndian>,
    pub section_headers: &'a [elf::SectionHeader64<LittleEndian>],
    pub relocations: &'a [Vec<ProcessedRela>],
    pub got_address: u64,
}

/// Writes the linked executable to disk.
pub fn write_executable<A: Architecture>(p: WriteParams<'_, '_>) -> Result<()> {
    let e = LittleEndian;
    let shoff = p.file_header.e_shoff.get(e);
    let file_size = shoff + (p.section_headers.len() * std::mem::size_of::<elf::SectionHeader64<LittleEndian>>()) as u64;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(p.output_path)
        .map_err(|err| {
            LinkError::report(
                ErrorKind::SystemFailure,
                format!("could not open {} for writing: {err}", p.output_path.display()),
            )
        })?;
    file.set_len(file_size).map_err(|err| {
        LinkError::report(
            ErrorKind::SystemFailure,
            format!("could not resize output to {file_size} bytes: {err}"),
        )
    })?;
    let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(|err| {
        LinkError::report(ErrorKind::SystemFailure, format!("could not map output file: {err}"))
    })?;

    let ehdr_size = std::mem::size_of::<elf::FileHeader64<LittleEndian>>();
    map[..ehdr_size].copy_from_slice(bytes_of(p.file_header));
    let phdr_bytes = bytes_of_slice(&p.layout.program_headers);
    map[ehdr_size..ehdr_size + phdr_bytes.len()].copy_from_slice(phdr_bytes);

    // Carve the mapping into one disjoint slice per section with content;
    // each parallel task owns exactly its own bytes.
    let mut jobs: Vec<(usize, u64, u64)> = (0..p.plan.names.len())
        .filter(|&id| p.plan.sizes[id] > 0 && p.plan.types[id] != elf::SHT_NOBITS)
        .map(|id| (id, p.layout.file_offsets[id], p.plan.sizes[id]))
        .collect();
    jobs.sort_by_key(|&(_, offset, _)| offset);

    let mut tasks = Vec::with_capacity(jobs.len());
    let mut rest = &mut map[..];
    let mut consumed = 0u64;
    for (out_id, offset, size) in jobs {
        let gap = offset.checked_sub(consumed).ok_or_else(|| {
            LinkError::report(ErrorKind::NotOk, "output sections overlap in the file")
        })?;
        let (_, tail) = rest.split_at_mut(gap as usize);
        let (body, tail) = tail.split_at_mut(size as usize);
        rest = tail;
        consumed = offset + size;
        tasks.push((out_id, body));
    }

    let results: Vec<Result<()>> = tasks
        .into_par_iter()
        .map(|(out_id, body)| write_section::<A>(&p, out_id, body))
        .collect();
    let mut status = crate::error::FirstError::default();
    for result in results {
        if let Err(err) = result {
            status.record(err);
        }
    }
    status.into_result()?;

    map[shoff as usize..].copy_from_slice(bytes_of_slice(p.section_headers));
    map.flush().map_err(|err| {
        LinkError::report(ErrorKind::SystemFailure, format!("could not flush output file: {err}"))
    })?;
    drop(map);

    // Make the file immediately executable.
    let mut permissions = file
        .metadata()
        .map_err(|err| LinkError::report(ErrorKind::SystemFailure, err.to_string()))?
        .permissions();
    permissions.set_mode(0o755);
    file.set_permissions(permissions)
        .map_err(|err| LinkError::report(ErrorKind::SystemFailure, err.to_string()))?;
    Ok(())
}

/// Reconstructs one output section's bytes and applies its relocations.
fn write_section<A: Architecture>(
    p: &WriteParams<'_, '_>,
    out_id: usize,
    body: &mut [u8],
) -> Result<()> {
    if let Some(view) = &p.plan.materialized[out_id] {
        body[..view.len()].copy_from_slice(view);
    } else {
        for sec_ref in &p.plan.inputs[out_id] {
            let input = &p.inputs[sec_ref.elf_index];
            let data = input.section_data(&input.shdrs[sec_ref.header_index]);
            match &p.plan.copies[sec_ref.elf_index][sec_ref.header_index] {
                SectionCopies::Single(cmd) => {
                    body[cmd.dst_offset as usize..][..data.len()].copy_from_slice(data);
                }
                SectionCopies::Parts(cmds) => {
                    let mut cursor = 0usize;
                    for cmd in cmds {
                        body[cmd.dst_offset as usize..][..cmd.size as usize]
                            .copy_from_slice(&data[cursor..cursor + cmd.size as usize]);
                        cursor += cmd.size as usize;
                    }
                }
                SectionCopies::None => {}
            }
        }
    }

    let section_address = p.layout.addresses[out_id];
    for rela in &p.relocations[out_id] {
        apply_relocation::<A>(p, rela, section_address, body)?;
    }
    Ok(())
}

fn apply_relocation<A: Architecture>(
    p: &WriteParams<'_, '_>,
    rela: &ProcessedRela,
    section_address: u64,
    body: &mut [u8],
) -> Result<()> {
    let s = match rela.note {
        RelaNote::UndefinedWeak => 0,
        RelaNote::AbsoluteValue => rela.symbol_value,
        RelaNote::None => {
            p.layout.addresses[rela.symbol_section as usize].wrapping_add(rela.symbol_value)
        }
    };
    let place = section_address + rela.output_section_offset;
    let (value, size) =
        A::relocation_value(rela.r_type, s, rela.symbol_value, rela.addend, place, p.got_address)?;
    if size == 0 {
        return Ok(());
    }

    let offset = rela.output_section_offset as usize;
    if offset + size > body.len() {
        return Err(LinkError::report(
            ErrorKind::BadInputFile,
            "relocation does not fit inside its output section",
        ));
    }
    body[offset..offset + size].copy_from_slice(&value.to_le_bytes()[..size]);
    Ok(())
}
