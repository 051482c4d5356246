//! ELF static linker.
//!
//! One-shot pipeline:
//! 1. Classify inputs, parse relocatables and archive indices
//! 2. Build the symbol table, extracting archive members to a fixed point
//! 3. Plan output sections, merge or concatenate their inputs
//! 4. Preprocess relocations, lay out segments, synthesize sections
//! 5. Write the executable

use object::elf;
use object::LittleEndian;
use std::path::PathBuf;
use tracing::{debug, info};
use typed_arena::Arena;

use crate::arch::x86_64::X86_64;
use crate::arch::Architecture;
use crate::archive::{extract_archive_members, parse_archives, ArchiveIndex};
use crate::error::{ErrorKind, LinkError, Result};
use crate::input::{classify_inputs, parse_elf_inputs, ElfInput, SectionRef, SortKey};
use crate::layout::{build_headers, build_loaded_layout, sort_into_segments, BuildHeaders};
use crate::relocs::{preprocess_relocations, NUM_RESERVED_GOT_ENTRIES};
use crate::sections::{merge_and_sort_inputs, plan_output_sections, NOT_AN_OUTPUT_SECTION};
use crate::symbol::{determine_members_to_extract, insert_symbols, SymbolRef, SymbolTable};
use crate::synth::{synthesize_sections, SyntheticIds};
use crate::writer::{write_executable, WriteParams};

/// The contract with the argument parser.
#[derive(Debug, Clone)]
pub struct LinkerOptions {
    pub output_file_name: PathBuf,
    pub entry_symbol_name: String,
    pub create_eh_frame_header: bool,
}

impl Default for LinkerOptions {
    fn default() -> Self {
        Self {
            output_file_name: PathBuf::from("a.out"),
            entry_symbol_name: String::from("_start"),
            create_eh_frame_header: false,
        }
    }
}

/// Links the mapped inputs into a static executable at the configured path.
///
/// The buffers are the external mapper's responsibility and are never
/// written through.
pub fn link_executable(buffers: &[&[u8]], options: &LinkerOptions) -> Result<()> {
    if buffers.is_empty() {
        return Err(LinkError::report(ErrorKind::NotOk, "not enough input to link anything"));
    }
    if buffers.len() >= u32::MAX as usize {
        return Err(LinkError::report(
            ErrorKind::NotOk,
            format!("too much input: {} files", buffers.len()),
        ));
    }
    if options.create_eh_frame_header {
        return Err(LinkError::report(
            ErrorKind::NotOk,
            "creating an .eh_frame header is not supported",
        ));
    }

    let arena = Arena::new();
    let mut linker = Linker::new(X86_64, buffers, &arena);
    linker.load()?;
    linker.link(options)
}

pub struct Linker<'data, A: Architecture> {
    #[allow(dead_code)]
    arch: A,
    buffers: &'data [&'data [u8]],
    arena: &'data Arena<u64>,
    inputs: Vec<ElfInput<'data>>,
    sort_keys: Vec<SortKey>,
    symbol_table: SymbolTable<'data>,
    archive_index: ArchiveIndex<'data>,
}

impl<'data, A: Architecture> Linker<'data, A> {
    pub fn new(arch: A, buffers: &'data [&'data [u8]], arena: &'data Arena<u64>) -> Self {
        Self {
            arch,
            buffers,
            arena,
            inputs: Vec::new(),
            sort_keys: Vec::new(),
            symbol_table: SymbolTable::default(),
            archive_index: ArchiveIndex::default(),
        }
    }

    /// Stages 1-5: parse everything and build the symbol table, pulling in
    /// archive members until a fixed point.
    pub fn load(&mut self) -> Result<()> {
        let classified = classify_inputs(self.buffers)?;
        info!(
            elf_files = classified.elf_files.len(),
            archives = classified.archives.len(),
            "classified inputs"
        );

        // ELF parsing and archive indexing touch disjoint inputs.
        let buffers = self.buffers;
        let (elf_result, archive_result) = rayon::join(
            || parse_elf_inputs(buffers, &classified.elf_files),
            || parse_archives(buffers, &classified.archives),
        );
        let (inputs, sort_keys) = elf_result?;
        self.inputs = inputs;
        self.sort_keys = sort_keys;
        self.archive_index = archive_result?;

        let mut searched_names = Vec::new();
        insert_symbols(&self.inputs, &self.sort_keys, 0, &mut self.symbol_table, &mut searched_names)?;

        loop {
            let to_extract = determine_members_to_extract(
                &self.symbol_table,
                &self.archive_index,
                &self.sort_keys,
                &searched_names,
            )?;
            let round_start = self.inputs.len();
            let (new_inputs, new_keys) = extract_archive_members(
                self.buffers,
                &mut self.archive_index,
                &to_extract,
                self.arena,
            )?;
            if new_inputs.is_empty() {
                break;
            }
            self.inputs.extend(new_inputs);
            self.sort_keys.extend(new_keys);

            searched_names.clear();
            insert_symbols(
                &self.inputs,
                &self.sort_keys,
                round_start,
                &mut self.symbol_table,
                &mut searched_names,
            )?;
        }
        debug!(inputs = self.inputs.len(), symbols = self.symbol_table.len(), "inputs loaded");
        Ok(())
    }

    /// Stages 6-13: everything from section planning to the file on disk.
    pub fn link(&mut self, options: &LinkerOptions) -> Result<()> {
        let e = LittleEndian;
        let entry = self.resolve_entry_symbol(&options.entry_symbol_name)?;

        let mut plan = plan_output_sections(&self.inputs)?;
        merge_and_sort_inputs(&mut plan, &self.inputs, &self.sort_keys)?;

        // The GOT joins the writable data; the tables stay unloaded.
        let ids = SyntheticIds {
            got: plan.add_synthetic(
                b".got",
                elf::SHT_PROGBITS,
                u64::from(elf::SHF_ALLOC | elf::SHF_WRITE),
                std::mem::align_of::<u64>() as u64,
            ),
            symtab: plan.add_synthetic(
                b".symtab",
                elf::SHT_SYMTAB,
                0,
                std::mem::align_of::<elf::Sym64<LittleEndian>>() as u64,
            ),
            strtab: plan.add_synthetic(b".strtab", elf::SHT_STRTAB, 0, 1),
            shstrtab: plan.add_synthetic(b".shstrtab", elf::SHT_STRTAB, 0, 1),
        };

        let segments = sort_into_segments(&plan.types, &plan.flags);
        let processed =
            preprocess_relocations::<A>(&self.inputs, &self.symbol_table, &plan, ids.got)?;

        let got_size = (NUM_RESERVED_GOT_ENTRIES + processed.got_patches.len())
            * std::mem::size_of::<u64>();
        plan.sizes[ids.got as usize] = got_size as u64;
        plan.materialized[ids.got as usize] = Some(vec![0u8; got_size]);

        let mut layout =
            build_loaded_layout(&segments, &plan.sizes, &plan.alignments, &plan.types);
        let got_address = layout.addresses[ids.got as usize];

        let tables = synthesize_sections(
            &mut plan,
            ids,
            &processed.got_patches,
            &layout.addresses,
            &self.inputs,
            &self.symbol_table,
        )?;

        // Unloaded sections can only be placed once their sizes are final.
        let section_data_end =
            layout.place_unloaded_sections(&segments, &plan.sizes, &plan.alignments);

        let entry_shndx = usize::from(entry.sym.st_shndx.get(e));
        let entry_point = if entry.sym.st_shndx.get(e) == elf::SHN_ABS {
            entry.sym.st_value.get(e)
        } else {
            let entry_out = plan.input_to_output[entry.elf_id]
                .get(entry_shndx)
                .copied()
                .unwrap_or(NOT_AN_OUTPUT_SECTION);
            if entry_out == NOT_AN_OUTPUT_SECTION {
                return Err(LinkError::report(
                    ErrorKind::NotOk,
                    "entry symbol is not defined in a mapped section",
                ));
            }
            let home = SectionRef { elf_index: entry.elf_id, header_index: entry_shndx };
            layout.addresses[entry_out as usize]
                + plan.map_input_offset(home, entry.sym.st_value.get(e))?
        };

        let (file_header, section_headers) = build_headers(BuildHeaders {
            plan: &plan,
            layout: &layout,
            sh_names: &tables.sh_names,
            section_data_end,
            symtab_id: ids.symtab,
            strtab_id: ids.strtab,
            shstrtab_id: ids.shstrtab,
            num_local_symbols: tables.num_local_symbols,
            entry_point,
        });

        info!(
            output = %options.output_file_name.display(),
            sections = plan.names.len(),
            segments = layout.program_headers.len(),
            "writing executable"
        );
        write_executable::<A>(WriteParams {
            output_path: &options.output_file_name,
            inputs: &self.inputs,
            plan: &plan,
            layout: &layout,
            file_header: &file_header,
            section_headers: &section_headers,
            relocations: &processed.per_section,
            got_address,
        })
    }

    fn resolve_entry_symbol(&self, name: &str) -> Result<SymbolRef<'data>> {
        self.symbol_table
            .get(name.as_bytes())
            .and_then(|entry| entry.first_load)
            .ok_or_else(|| {
                LinkError::report(
                    ErrorKind::NotOk,
                    format!("entry symbol \"{name}\" not found in global symbol table"),
                )
            })
    }
}
