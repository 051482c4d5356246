//! Relocation preprocessing.
//!
//! Every RELA record is resolved to an output-section-relative form while
//! the section layer is still address-free: offsets and symbol values are
//! pushed through copy commands, GOT entries are allocated, and the result
//! carries everything the writer needs so the original relocation tables are
//! never revisited.

use std::collections::HashMap;

use object::elf;
use object::pod;
use object::LittleEndian;

use crate::arch::Architecture;
use crate::error::{ErrorKind, FirstError, LinkError, Result};
use crate::input::{ElfInput, SectionRef};
use crate::sections::{OutSectionId, OutputPlan, NOT_AN_OUTPUT_SECTION};
use crate::symbol::{is_local, is_weak, SymbolTable};
use crate::utils::cstr_at;

/// The psABI reserves the first three global-offset-table entries.
pub const NUM_RESERVED_GOT_ENTRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaNote {
    None,
    /// The symbol is weak and has no definition; it resolves to zero.
    UndefinedWeak,
    /// The symbol carries an absolute value rather than a section offset.
    AbsoluteValue,
}

/// A relocation resolved far enough that applying it is pure arithmetic.
#[derive(Debug, Clone, Copy)]
pub struct ProcessedRela {
    pub addend: i64,
    /// Where to write, relative to the owning output section.
    pub output_section_offset: u64,
    /// Symbol value relative to `symbol_section`; the GOT byte offset for
    /// GOT-indirect types; the symbol size for SIZE types.
    pub symbol_value: u64,
    pub r_type: u32,
    pub symbol_section: OutSectionId,
    pub note: RelaNote,
}

/// Everything needed to fill one GOT slot once addresses are assigned.
#[derive(Debug, Clone, Copy)]
pub enum GotPatch {
    /// The slot stays zero: the symbol is weak and undefined.
    Zero,
    /// The slot holds an absolute symbol's value directly.
    Absolute(u64),
    /// The slot holds a defined symbol's final address, computed from its
    /// output section's address plus its mapped offset.
    Section {
        elf_id: usize,
        header_id: usize,
        symbol_value: u64,
    },
}

/// Per-output-section processed relocations plus the GOT fill list.
pub struct ProcessedRelocations {
    pub per_section: Vec<Vec<ProcessedRela>>,
    pub got_patches: Vec<GotPatch>,
}

/// Walks every RELA section whose owner reaches the output.
pub fn preprocess_relocations<'data, A: Architecture>(
    inputs: &[ElfInput<'data>],
    symbol_table: &SymbolTable<'data>,
    plan: &OutputPlan<'data>,
    got_id: OutSectionId,
) -> Result<ProcessedRelocations> {
    let e = LittleEndian;
    let mut processed = ProcessedRelocations {
        per_section: vec![Vec::new(); plan.names.len()],
        got_patches: Vec::new(),
    };
    let mut got_indices: HashMap<&'data [u8], usize> = HashMap::with_capacity(symbol_table.len());
    let mut status = FirstError::default();

    for (elf_id, input) in inputs.iter().enumerate() {
        for shdr in input.shdrs {
            if shdr.sh_type.get(e) != elf::SHT_RELA {
                continue;
            }
            let entsize = std::mem::size_of::<elf::Rela64<LittleEndian>>() as u64;
            if shdr.sh_entsize.get(e) != entsize {
                status.record(LinkError::report(
                    ErrorKind::NotOk,
                    "relocation records are not of the right size",
                ));
                continue;
            }

            let owner = shdr.sh_info.get(e) as usize;
            let out_id = plan.input_to_output[elf_id]
                .get(owner)
                .copied()
                .unwrap_or(NOT_AN_OUTPUT_SECTION);
            if out_id == NOT_AN_OUTPUT_SECTION {
                // Relocations for a section that is not part of the output.
                continue;
            }

            let symtab_hdr = input.linked_section(shdr)?;
            let linked_symbols = input.symbols(symtab_hdr)?;
            let sym_strings = input.section_data(input.linked_section(symtab_hdr)?);

            let count = (shdr.sh_size.get(e) / entsize) as usize;
            let offset = shdr.sh_offset.get(e) as usize;
            let (relas, _) = pod::slice_from_bytes::<elf::Rela64<LittleEndian>>(
                &input.data[offset..],
                count,
            )
            .map_err(|()| {
                LinkError::report(ErrorKind::BadInputFile, "misaligned relocation table")
            })?;

            process_section_relas::<A>(ProcessSectionRelas {
                elf_id,
                owner,
                out_id,
                relas,
                linked_symbols,
                sym_strings,
                inputs,
                symbol_table,
                plan,
                got_id,
                got_indices: &mut got_indices,
                processed: &mut processed,
                status: &mut status,
            })?;
        }
    }

    status.into_result()?;
    Ok(processed)
}

struct ProcessSectionRelas<'a, 'data> {
    elf_id: usize,
    owner: usize,
    out_id: OutSectionId,
    relas: &'data [elf::Rela64<LittleEndian>],
    linked_symbols: &'data [elf::Sym64<LittleEndian>],
    sym_strings: &'data [u8],
    inputs: &'a [ElfInput<'data>],
    symbol_table: &'a SymbolTable<'data>,
    plan: &'a OutputPlan<'data>,
    got_id: OutSectionId,
    got_indices: &'a mut HashMap<&'data [u8], usize>,
    processed: &'a mut ProcessedRelocations,
    status: &'a mut FirstError,
}

fn process_section_relas<A: Architecture>(p: ProcessSectionRelas<'_, '_>) -> Result<()> {
    let ProcessSectionRelas {
        elf_id,
        owner,
        out_id,
        relas,
        linked_symbols,
        sym_strings,
        inputs,
        symbol_table,
        plan,
        got_id,
        got_indices,
        processed,
        status,
    } = p;
    let e = LittleEndian;
    let owner_ref = SectionRef { elf_index: elf_id, header_index: owner };

    for rela in relas {
        let r_info = rela.r_info.get(e);
        let r_type = r_info as u32;
        let sym_index = (r_info >> 32) as usize;
        let Some(sym) = linked_symbols.get(sym_index) else {
            status.record(LinkError::report(
                ErrorKind::BadInputFile,
                "relocation symbol index out of range",
            ));
            continue;
        };
        let shndx = sym.st_shndx.get(e);
        if shndx == elf::SHN_XINDEX {
            status.record(LinkError::report(
                ErrorKind::BadInputFile,
                "symbol points at a section with a too-high index",
            ));
            continue;
        }

        let addend = rela.r_addend.get(e);
        let output_section_offset = plan.map_input_offset(owner_ref, rela.r_offset.get(e))?;

        if shndx == elf::SHN_ABS {
            processed.per_section[out_id as usize].push(ProcessedRela {
                addend,
                output_section_offset,
                symbol_value: sym.st_value.get(e),
                r_type,
                symbol_section: 0,
                note: RelaNote::AbsoluteValue,
            });
            continue;
        }

        if is_local(sym) {
            if shndx == elf::SHN_UNDEF {
                status.record(LinkError::report(ErrorKind::NotOk, "local symbol undefined"));
                continue;
            }
            if usize::from(shndx) >= inputs[elf_id].shdrs.len() {
                status.record(LinkError::report(
                    ErrorKind::BadInputFile,
                    "local symbol section index out of range",
                ));
                continue;
            }
            let home = SectionRef { elf_index: elf_id, header_index: usize::from(shndx) };
            let symbol_value = plan.map_input_offset(home, sym.st_value.get(e))?;
            processed.per_section[out_id as usize].push(ProcessedRela {
                addend,
                output_section_offset,
                symbol_value,
                r_type,
                symbol_section: plan.input_to_output[elf_id][usize::from(shndx)],
                note: RelaNote::None,
            });
            continue;
        }

        // Global or weak: resolve through the symbol table.
        let name = cstr_at(sym_strings, sym.st_name.get(e) as usize)?;
        let Some(entry) = symbol_table.get(name) else {
            return Err(LinkError::report(
                ErrorKind::SymbolUndefined,
                format!("{} (missing from the symbol table)", String::from_utf8_lossy(name)),
            ));
        };

        let Some(load) = &entry.first_load else {
            if !is_weak(sym) {
                status.record(LinkError::report(
                    ErrorKind::SymbolUndefined,
                    String::from_utf8_lossy(name).into_owned(),
                ));
                continue;
            }
            let mut result = ProcessedRela {
                addend,
                output_section_offset,
                symbol_value: 0,
                r_type,
                symbol_section: 0,
                note: RelaNote::UndefinedWeak,
            };
            if A::needs_got_entry(r_type) {
                add_got_entry(
                    got_indices,
                    &mut processed.got_patches,
                    &mut result,
                    name,
                    got_id,
                    GotPatch::Zero,
                );
            }
            processed.per_section[out_id as usize].push(result);
            continue;
        };

        let load_shndx = load.sym.st_shndx.get(e);
        if load_shndx == elf::SHN_XINDEX {
            status.record(LinkError::report(
                ErrorKind::BadInputFile,
                "symbol points at a section with a too-high index",
            ));
            continue;
        }

        let mut result = ProcessedRela {
            addend,
            output_section_offset,
            symbol_value: 0,
            r_type,
            symbol_section: 0,
            note: RelaNote::None,
        };
        if load_shndx == elf::SHN_ABS {
            result.symbol_value = load.sym.st_value.get(e);
            result.note = RelaNote::AbsoluteValue;
        } else {
            if usize::from(load_shndx) >= inputs[load.elf_id].shdrs.len() {
                status.record(LinkError::report(
                    ErrorKind::BadInputFile,
                    "symbol section index out of range",
                ));
                continue;
            }
            let home = SectionRef { elf_index: load.elf_id, header_index: usize::from(load_shndx) };
            result.symbol_section = plan.input_to_output[load.elf_id][usize::from(load_shndx)];
            result.symbol_value = plan.map_input_offset(home, load.sym.st_value.get(e))?;
        }

        if A::needs_got_entry(r_type) {
            // An absolute definition has no section to look up later; the
            // slot takes its value as-is.
            let patch = if load_shndx == elf::SHN_ABS {
                GotPatch::Absolute(load.sym.st_value.get(e))
            } else {
                GotPatch::Section {
                    elf_id: load.elf_id,
                    header_id: usize::from(load_shndx),
                    symbol_value: load.sym.st_value.get(e),
                }
            };
            add_got_entry(
                got_indices,
                &mut processed.got_patches,
                &mut result,
                name,
                got_id,
                patch,
            );
        } else if r_type == elf::R_X86_64_SIZE32 || r_type == elf::R_X86_64_SIZE64 {
            result.symbol_value = sym.st_size.get(e);
        }
        processed.per_section[out_id as usize].push(result);
    }
    Ok(())
}

/// Allocates at most one GOT slot per symbol name and redirects the
/// relocation at it.
fn add_got_entry<'data>(
    got_indices: &mut HashMap<&'data [u8], usize>,
    got_patches: &mut Vec<GotPatch>,
    result: &mut ProcessedRela,
    name: &'data [u8],
    got_id: OutSectionId,
    patch: GotPatch,
) {
    let next_index = got_indices.len() + NUM_RESERVED_GOT_ENTRIES;
    let index = *got_indices.entry(name).or_insert_with(|| {
        got_patches.push(patch);
        next_index
    });
    result.symbol_section = got_id;
    result.symbol_value = (index * std::mem::size_of::<u64>()) as u64;
}
