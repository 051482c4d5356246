//! Synthetic sections.
//!
//! With the exception of the global offset table these are not needed to run
//! the program, but a full symbol table and string tables are emitted anyway:
//! `.got`, `.symtab`, `.strtab` and `.shstrtab`.

use object::elf;
use object::LittleEndian;

use crate::error::Result;
use crate::input::{ElfInput, SectionRef};
use crate::relocs::{GotPatch, NUM_RESERVED_GOT_ENTRIES};
use crate::sections::{OutSectionId, OutputPlan, NOT_AN_OUTPUT_SECTION};
use crate::symbol::SymbolTable;
use crate::utils::{cstr_at, u16, u32, u64};

/// Ids of the four sections appended after planning.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticIds {
    pub got: OutSectionId,
    pub symtab: OutSectionId,
    pub strtab: OutSectionId,
    pub shstrtab: OutSectionId,
}

/// Results the header emitter needs.
pub struct SynthesizedTables {
    /// `sh_info` of the symbol table: one greater than the index of the
    /// last local symbol, so the leading null entry is counted.
    pub num_local_symbols: u32,
    /// `sh_name` per output section, relative to `.shstrtab`.
    pub sh_names: Vec<u32>,
}

/// Fills the GOT and materializes the symbol and string tables.
///
/// Runs after the loaded layout so that GOT entries and symbol values can be
/// absolute addresses; the non-loaded sections get their file offsets after
/// this, once their sizes are final.
pub fn synthesize_sections<'data>(
    plan: &mut OutputPlan<'data>,
    ids: SyntheticIds,
    got_patches: &[GotPatch],
    addresses: &[u64],
    inputs: &[ElfInput<'data>],
    symbol_table: &SymbolTable<'data>,
) -> Result<SynthesizedTables> {
    fill_got(plan, ids.got, got_patches, addresses)?;

    let e = LittleEndian;
    let mut strtab = Vec::with_capacity(plan.total_string_table_size + 1);
    strtab.push(0u8);
    let mut symtab: Vec<elf::Sym64<LittleEndian>> =
        Vec::with_capacity(1 + plan.total_local_symbols + symbol_table.len());
    symtab.push(elf::Sym64 {
        st_name: u32(0),
        st_info: 0,
        st_other: 0,
        st_shndx: u16(0),
        st_value: u64(0),
        st_size: u64(0),
    });

    // Local symbols of every input keep their binding; values are rebased
    // into output sections. Symbols of sections that land in non-allocated
    // (or no) output are dropped.
    for (elf_id, input) in inputs.iter().enumerate() {
        for shdr in input.shdrs {
            if shdr.sh_type.get(e) != elf::SHT_SYMTAB {
                continue;
            }
            let symbols = input.symbols(shdr)?;
            let strings = input.section_data(input.linked_section(shdr)?);
            let local_count = (shdr.sh_info.get(e) as usize).min(symbols.len());
            for sym in symbols.iter().take(local_count).skip(1) {
                let name = cstr_at(strings, sym.st_name.get(e) as usize)?;
                push_symbol(plan, addresses, &mut symtab, &mut strtab, sym, name, elf_id)?;
            }
        }
    }
    let num_local_symbols = symtab.len() as u32;

    for (&name, entry) in symbol_table {
        if let Some(load) = &entry.first_load {
            push_symbol(plan, addresses, &mut symtab, &mut strtab, load.sym, name, load.elf_id)?;
        }
    }

    plan.sizes[ids.symtab as usize] =
        (symtab.len() * std::mem::size_of::<elf::Sym64<LittleEndian>>()) as u64;
    plan.materialized[ids.symtab as usize] =
        Some(object::pod::bytes_of_slice(&symtab).to_vec());
    plan.sizes[ids.strtab as usize] = strtab.len() as u64;
    plan.materialized[ids.strtab as usize] = Some(strtab);

    // Section names get their own table with its own offset base.
    let mut shstrtab = vec![0u8];
    let mut sh_names = Vec::with_capacity(plan.names.len());
    for name in &plan.names {
        sh_names.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(name);
        shstrtab.push(0);
    }
    plan.sizes[ids.shstrtab as usize] = shstrtab.len() as u64;
    plan.materialized[ids.shstrtab as usize] = Some(shstrtab);

    Ok(SynthesizedTables { num_local_symbols, sh_names })
}

/// Writes one address per GOT patch; the reserved entries and the
/// undefined-weak slots stay zero.
fn fill_got(
    plan: &mut OutputPlan<'_>,
    got_id: OutSectionId,
    got_patches: &[GotPatch],
    addresses: &[u64],
) -> Result<()> {
    let mut view = plan.materialized[got_id as usize]
        .take()
        .expect("GOT must be materialized before synthesis");

    for (patch_index, patch) in got_patches.iter().enumerate() {
        let entry = match *patch {
            GotPatch::Zero => continue,
            GotPatch::Absolute(value) => value,
            GotPatch::Section { elf_id, header_id, symbol_value } => {
                let out = plan.input_to_output[elf_id]
                    .get(header_id)
                    .copied()
                    .unwrap_or(NOT_AN_OUTPUT_SECTION);
                if out == NOT_AN_OUTPUT_SECTION {
                    tracing::debug!("GOT entry for a symbol outside the output stays zero");
                    continue;
                }
                let home = SectionRef { elf_index: elf_id, header_index: header_id };
                addresses[out as usize] + plan.map_input_offset(home, symbol_value)?
            }
        };
        let byte_offset = (NUM_RESERVED_GOT_ENTRIES + patch_index) * std::mem::size_of::<u64>();
        view[byte_offset..][..8].copy_from_slice(&entry.to_le_bytes());
    }

    plan.materialized[got_id as usize] = Some(view);
    Ok(())
}

/// Appends one symbol, retargeting its section index and value into the
/// output. ABS symbols are preserved as-is.
fn push_symbol<'data>(
    plan: &OutputPlan<'data>,
    addresses: &[u64],
    symtab: &mut Vec<elf::Sym64<LittleEndian>>,
    strtab: &mut Vec<u8>,
    sym: &elf::Sym64<LittleEndian>,
    name: &[u8],
    elf_id: usize,
) -> Result<()> {
    let e = LittleEndian;
    let mut out_sym = *sym;

    if sym.st_shndx.get(e) != elf::SHN_ABS {
        let shndx = usize::from(sym.st_shndx.get(e));
        let out = plan.input_to_output[elf_id].get(shndx).copied().unwrap_or(NOT_AN_OUTPUT_SECTION);
        if out == NOT_AN_OUTPUT_SECTION {
            return Ok(());
        }
        if plan.flags[out as usize] & u64::from(elf::SHF_ALLOC) == 0 {
            return Ok(());
        }
        let home = SectionRef { elf_index: elf_id, header_index: shndx };
        let value = addresses[out as usize] + plan.map_input_offset(home, sym.st_value.get(e))?;
        out_sym.st_value = u64(value);
        out_sym.st_shndx = u16(out + 1);
    }

    out_sym.st_name = u32(strtab.len() as u32);
    strtab.extend_from_slice(name);
    strtab.push(0);
    symtab.push(out_sym);
    Ok(())
}
