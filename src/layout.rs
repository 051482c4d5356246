//! Layout management.
//!
//! Output sections are partitioned into six segment classes by access flags,
//! loaded segments get virtual addresses and file offsets, and the ELF and
//! section headers are assembled. The layout targets a fixed base address;
//! there is no position independence.

use object::elf;
use object::LittleEndian;
use rayon::prelude::*;

use crate::sections::{OutSectionId, OutputPlan};
use crate::utils::{align_up, u16, u32, u64};

/// Matches GNU ld's default for non-PIE executables.
pub const VIRTUAL_ADDRESS_START: u64 = 0x400000;
/// Default page size on Linux.
pub const PAGE_SIZE: u64 = 0x1000;

pub const NUM_SEGMENTS: usize = 6;
pub const SEG_READ_ONLY: usize = 0;
pub const SEG_READ_WRITE: usize = 1;
pub const SEG_READ_EXECUTE: usize = 2;
pub const SEG_READ_WRITE_EXECUTE: usize = 3;
pub const SEG_TLS_TEMPLATE: usize = 4;
pub const SEG_NOT_LOADED: usize = 5;

const SEGMENT_FLAGS: [u32; NUM_SEGMENTS] = [
    elf::PF_R,
    elf::PF_R | elf::PF_W,
    elf::PF_R | elf::PF_X,
    elf::PF_R | elf::PF_W | elf::PF_X,
    elf::PF_R,
    0,
];

const SEGMENT_TYPES: [u32; NUM_SEGMENTS] = [
    elf::PT_LOAD,
    elf::PT_LOAD,
    elf::PT_LOAD,
    elf::PT_LOAD,
    elf::PT_TLS,
    elf::PT_NULL,
];

/// Output-section ids per segment class, in emission order.
pub struct SegmentedSections(pub [Vec<OutSectionId>; NUM_SEGMENTS]);

fn segment_for(flags: u64) -> usize {
    if flags & u64::from(elf::SHF_ALLOC) == 0 {
        return SEG_NOT_LOADED;
    }
    if flags & u64::from(elf::SHF_TLS) != 0 {
        return SEG_TLS_TEMPLATE;
    }
    let write = flags & u64::from(elf::SHF_WRITE) != 0;
    let exec = flags & u64::from(elf::SHF_EXECINSTR) != 0;
    match (write, exec) {
        (true, true) => SEG_READ_WRITE_EXECUTE,
        (true, false) => SEG_READ_WRITE,
        (false, true) => SEG_READ_EXECUTE,
        (false, false) => SEG_READ_ONLY,
    }
}

/// Classifies every output section, pushing BSS-like sections to the end of
/// their segment so they can occupy trailing memory without file space.
pub fn sort_into_segments(types: &[u32], flags: &[u64]) -> SegmentedSections {
    let mut segments: [Vec<OutSectionId>; NUM_SEGMENTS] = std::array::from_fn(|_| Vec::new());
    for (out_id, &section_flags) in flags.iter().enumerate() {
        segments[segment_for(section_flags)].push(out_id as OutSectionId);
    }
    segments.par_iter_mut().enumerate().for_each(|(segment_index, sections)| {
        if segment_index == SEG_NOT_LOADED {
            return;
        }
        sections.sort_by_key(|&id| types[id as usize] == elf::SHT_NOBITS);
    });
    SegmentedSections(segments)
}

/// Addresses and file offsets of every output section, plus the program
/// headers describing the loaded segments.
pub struct LoadedLayout {
    pub program_headers: Vec<elf::ProgramHeader64<LittleEndian>>,
    pub addresses: Vec<u64>,
    pub file_offsets: Vec<u64>,
}

/// Assigns virtual addresses and file offsets to all loaded sections.
///
/// Segments are laid out back to back, page-aligned at their boundaries, so
/// the loader can map each one directly. The first loaded segment is
/// extended backward to cover the ELF and program headers.
pub fn build_loaded_layout(
    segments: &SegmentedSections,
    sizes: &[u64],
    alignments: &[u64],
    types: &[u32],
) -> LoadedLayout {
    let mut program_headers = Vec::with_capacity(NUM_SEGMENTS);
    let empty_phdr = elf::ProgramHeader64::<LittleEndian> {
        p_type: u32(0),
        p_flags: u32(0),
        p_offset: u64(0),
        p_vaddr: u64(0),
        p_paddr: u64(0),
        p_filesz: u64(0),
        p_memsz: u64(0),
        p_align: u64(0),
    };
    for (segment_index, sections) in segments.0.iter().enumerate() {
        if sections.is_empty() || segment_index == SEG_NOT_LOADED {
            continue;
        }
        let mut phdr = empty_phdr;
        phdr.p_type = u32(SEGMENT_TYPES[segment_index]);
        phdr.p_flags = u32(SEGMENT_FLAGS[segment_index]);
        program_headers.push(phdr);
    }
    let mut gnu_stack = empty_phdr;
    gnu_stack.p_type = u32(elf::PT_GNU_STACK);
    gnu_stack.p_flags = u32(SEGMENT_FLAGS[SEG_READ_WRITE]);
    gnu_stack.p_align = u64(0x10);
    program_headers.push(gnu_stack);

    let file_headers_size = (std::mem::size_of::<elf::FileHeader64<LittleEndian>>()
        + std::mem::size_of::<elf::ProgramHeader64<LittleEndian>>() * program_headers.len())
        as u64;

    let mut addresses = vec![0u64; sizes.len()];
    let mut file_offsets = vec![0u64; sizes.len()];
    let mut file_start = file_headers_size;
    let mut segment_start_address = VIRTUAL_ADDRESS_START + file_headers_size;
    let mut phdr_index = 0;

    for (segment_index, sections) in segments.0.iter().enumerate() {
        if sections.is_empty() || segment_index == SEG_NOT_LOADED {
            continue;
        }
        let mut file_pos = file_start;
        let mut address_pos = segment_start_address;

        for &out_id in sections {
            let out = out_id as usize;
            file_pos = align_up(file_pos, alignments[out]);
            address_pos = align_up(address_pos, alignments[out]);
            addresses[out] = address_pos;
            file_offsets[out] = file_pos;

            address_pos += sizes[out];
            if types[out] != elf::SHT_NOBITS {
                file_pos += sizes[out];
            }
        }

        let segment_file_size = file_pos - file_start;
        let segment_mem_size = address_pos - segment_start_address;

        let e = LittleEndian;
        let phdr = &mut program_headers[phdr_index];
        phdr.p_align = u64(PAGE_SIZE);
        phdr.p_offset = u64(file_start);
        phdr.p_filesz = u64(segment_file_size);
        phdr.p_memsz = u64(segment_mem_size);
        phdr.p_vaddr = u64(segment_start_address);
        phdr.p_paddr = u64(segment_start_address);
        if phdr_index == 0 {
            // The first segment also covers the ELF and program headers.
            phdr.p_offset = u64(phdr.p_offset.get(e) - file_headers_size);
            phdr.p_vaddr = u64(phdr.p_vaddr.get(e) - file_headers_size);
            phdr.p_paddr = u64(phdr.p_paddr.get(e) - file_headers_size);
            phdr.p_filesz = u64(phdr.p_filesz.get(e) + file_headers_size);
            phdr.p_memsz = u64(phdr.p_memsz.get(e) + file_headers_size);
        }
        phdr_index += 1;

        file_start = align_up(file_start + segment_file_size, PAGE_SIZE);
        segment_start_address = align_up(segment_start_address + segment_mem_size, PAGE_SIZE);
    }

    LoadedLayout { program_headers, addresses, file_offsets }
}

impl LoadedLayout {
    fn file_headers_size(&self) -> u64 {
        (std::mem::size_of::<elf::FileHeader64<LittleEndian>>()
            + std::mem::size_of::<elf::ProgramHeader64<LittleEndian>>()
                * self.program_headers.len()) as u64
    }

    /// Places the non-loaded sections in the file after the last loaded
    /// segment. Must run after synthetic sections have their final sizes.
    /// Returns the file offset one past the last section's data.
    pub fn place_unloaded_sections(
        &mut self,
        segments: &SegmentedSections,
        sizes: &[u64],
        alignments: &[u64],
    ) -> u64 {
        let e = LittleEndian;
        // The header before PT_GNU_STACK is the last one with file content.
        let mut offset = match self.program_headers.len().checked_sub(2) {
            Some(last) => {
                let phdr = &self.program_headers[last];
                phdr.p_offset.get(e) + phdr.p_filesz.get(e)
            }
            None => self.file_headers_size(),
        };
        for &out_id in &segments.0[SEG_NOT_LOADED] {
            let out = out_id as usize;
            offset = align_up(offset, alignments[out]);
            self.addresses[out] = 0;
            self.file_offsets[out] = offset;
            offset += sizes[out];
        }
        offset
    }
}

/// Inputs for assembling the file and section headers.
pub struct BuildHeaders<'a> {
    pub plan: &'a OutputPlan<'a>,
    pub layout: &'a LoadedLayout,
    pub sh_names: &'a [u32],
    pub section_data_end: u64,
    pub symtab_id: OutSectionId,
    pub strtab_id: OutSectionId,
    pub shstrtab_id: OutSectionId,
    pub num_local_symbols: u32,
    pub entry_point: u64,
}

/// Computes the ELF file header and the full section-header array.
/// The first section header is the null entry.
pub fn build_headers(
    p: BuildHeaders<'_>,
) -> (elf::FileHeader64<LittleEndian>, Vec<elf::SectionHeader64<LittleEndian>>) {
    let section_count = p.plan.names.len();
    let mut section_headers = Vec::with_capacity(section_count + 1);
    section_headers.push(elf::SectionHeader64 {
        sh_name: u32(0),
        sh_type: u32(elf::SHT_NULL),
        sh_flags: u64(0),
        sh_addr: u64(0),
        sh_offset: u64(0),
        sh_size: u64(0),
        sh_link: u32(0),
        sh_info: u32(0),
        sh_addralign: u64(0),
        sh_entsize: u64(0),
    });
    for id in 0..section_count {
        section_headers.push(elf::SectionHeader64 {
            sh_name: u32(p.sh_names[id]),
            sh_type: u32(p.plan.types[id]),
            sh_flags: u64(p.plan.flags[id]),
            sh_addr: u64(p.layout.addresses[id]),
            sh_offset: u64(p.layout.file_offsets[id]),
            sh_size: u64(p.plan.sizes[id]),
            sh_link: u32(0),
            sh_info: u32(0),
            sh_addralign: u64(p.plan.alignments[id].max(1)),
            sh_entsize: u64(0),
        });
    }
    let symtab_hdr = &mut section_headers[p.symtab_id as usize + 1];
    symtab_hdr.sh_link = u32(u32::from(p.strtab_id) + 1);
    symtab_hdr.sh_info = u32(p.num_local_symbols);
    symtab_hdr.sh_entsize = u64(std::mem::size_of::<elf::Sym64<LittleEndian>>() as u64);

    let shoff = align_up(
        p.section_data_end,
        std::mem::align_of::<elf::SectionHeader64<LittleEndian>>() as u64,
    );
    let file_header = elf::FileHeader64 {
        e_ident: elf::Ident {
            magic: elf::ELFMAG,
            class: elf::ELFCLASS64,
            data: elf::ELFDATA2LSB,
            version: elf::EV_CURRENT,
            os_abi: elf::ELFOSABI_GNU,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: u16(elf::ET_EXEC),
        e_machine: u16(elf::EM_X86_64),
        e_version: u32(u32::from(elf::EV_CURRENT)),
        e_entry: u64(p.entry_point),
        e_phoff: u64(std::mem::size_of::<elf::FileHeader64<LittleEndian>>() as u64),
        e_shoff: u64(shoff),
        e_flags: u32(0),
        e_ehsize: u16(std::mem::size_of::<elf::FileHeader64<LittleEndian>>() as u16),
        e_phentsize: u16(std::mem::size_of::<elf::ProgramHeader64<LittleEndian>>() as u16),
        e_phnum: u16(p.layout.program_headers.len() as u16),
        e_shentsize: u16(std::mem::size_of::<elf::SectionHeader64<LittleEndian>>() as u16),
        e_shnum: u16(section_headers.len() as u16),
        e_shstrndx: u16(u16::from(p.shstrtab_id) + 1),
    };
    (file_header, section_headers)
}
