//! Output-section planning and input-section placement.
//!
//! Input sections are grouped under canonical output names, sorted by file
//! precedence, then either concatenated or deduplicated (for SHF_MERGE
//! sections). The result of placement is a set of copy commands per input
//! section; everything downstream (relocations, symbol values, the writer)
//! maps input offsets through these commands.

use indexmap::IndexMap;
use object::elf;
use object::LittleEndian;
use rayon::prelude::*;
use std::collections::HashMap;

use crate::error::{ErrorKind, FirstError, LinkError, Result};
use crate::input::{ElfInput, SectionRef, SortKey};

/// Output sections are few; a small id type keeps the side tables compact.
pub type OutSectionId = u16;

/// Marks an input section with no place in the output.
pub const NOT_AN_OUTPUT_SECTION: OutSectionId = u16::MAX;

/// Four synthetic sections are appended after planning: `.got`, `.symtab`,
/// `.strtab` and `.shstrtab`.
pub const NUM_SYNTHETIC_SECTIONS: usize = 4;

/// One byte range copied from an input section into its output section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartCopy {
    pub size: u64,
    /// Destination relative to the start of the output section.
    pub dst_offset: u64,
}

/// Placement of one input section inside its output section.
///
/// Most sections land in one contiguous piece; merged sections scatter each
/// element to its deduplicated offset. The single-part case stays inline so
/// relocation application does not chase a heap pointer per section.
#[derive(Debug, Clone, Default)]
pub enum SectionCopies {
    #[default]
    None,
    Single(PartCopy),
    Parts(Vec<PartCopy>),
}

/// Maps an offset within an input section to its output-section offset.
pub fn map_offset(copies: &SectionCopies, offset: u64) -> Result<u64> {
    match copies {
        SectionCopies::Single(cmd) => Ok(offset + cmd.dst_offset),
        SectionCopies::Parts(cmds) => {
            let mut start = 0u64;
            let mut end = 0u64;
            for cmd in cmds {
                end += cmd.size;
                if start <= offset && offset < end {
                    return Ok(offset + cmd.dst_offset);
                }
                start = end;
            }
            Err(LinkError::report(
                ErrorKind::BadInputFile,
                format!("offset {offset} is not in a copied region of its output section"),
            ))
        }
        SectionCopies::None => Err(LinkError::report(
            ErrorKind::NotOk,
            "input section has no place in the output",
        )),
    }
}

/// The full plan for the output's section layer.
pub struct OutputPlan<'data> {
    /// Canonical name per output section.
    pub names: Vec<&'data [u8]>,
    /// Input sections per output section, sorted by precedence after
    /// [`merge_and_sort_inputs`].
    pub inputs: Vec<Vec<SectionRef>>,
    pub types: Vec<u32>,
    pub flags: Vec<u64>,
    pub alignments: Vec<u64>,
    pub sizes: Vec<u64>,
    /// Reverse mapping, `NOT_AN_OUTPUT_SECTION` where no output exists.
    pub input_to_output: Vec<Vec<OutSectionId>>,
    /// Copy commands per `(elf, header)` input section.
    pub copies: Vec<Vec<SectionCopies>>,
    /// Pre-built content for merged and synthetic sections.
    pub materialized: Vec<Option<Vec<u8>>>,
    /// Summed `sh_info` over all input symbol tables, for presizing.
    pub total_local_symbols: usize,
    /// Summed input string-table sizes, for presizing.
    pub total_string_table_size: usize,
}

/// Section types that never become output sections.
fn reaches_output(sh_type: u32) -> bool {
    !matches!(
        sh_type,
        elf::SHT_NULL | elf::SHT_STRTAB | elf::SHT_SYMTAB | elf::SHT_GROUP | elf::SHT_REL | elf::SHT_RELA
    )
}

/// Collapses well-known section name families onto their canonical prefix.
pub fn canonical_name(full_name: &[u8]) -> &[u8] {
    const TRUNCATED_PREFIXES: [&[u8]; 13] = [
        b".text",
        b".data.rel.ro",
        b".data",
        b".ldata",
        b".rodata",
        b".lrodata",
        b".bss.rel.ro",
        b".bss",
        b".lbss",
        b".init_array",
        b".fini_array",
        b".tbss",
        b".tdata",
    ];
    for prefix in TRUNCATED_PREFIXES {
        if full_name.starts_with(prefix) {
            return &full_name[..prefix.len()];
        }
    }
    full_name
}

/// SHF_MERGE sometimes appears on only some of a name's inputs. Flags still
/// count as compatible after clearing the merge bits, at the cost of not
/// merging that output at all.
fn make_flags_compatible(source: &mut u64, other: u64) -> bool {
    if *source == other {
        return true;
    }
    let mask = !u64::from(elf::SHF_MERGE | elf::SHF_STRINGS);
    if (*source & mask) == (other & mask) {
        *source &= mask;
        return true;
    }
    false
}

/// Groups input sections by canonical name and fixes each output section's
/// type, flags and alignment.
pub fn plan_output_sections<'data>(inputs: &[ElfInput<'data>]) -> Result<OutputPlan<'data>> {
    let e = LittleEndian;

    let input_to_output: Vec<Vec<OutSectionId>> = inputs
        .iter()
        .map(|input| vec![NOT_AN_OUTPUT_SECTION; input.shdrs.len()])
        .collect();
    let mut total_local_symbols = 0usize;
    let mut total_string_table_size = 0usize;

    // Insertion order of this map is the output-section order.
    let mut groups: IndexMap<&'data [u8], Vec<SectionRef>> = IndexMap::new();
    for (elf_index, input) in inputs.iter().enumerate() {
        for (header_index, shdr) in input.shdrs.iter().enumerate() {
            let sh_type = shdr.sh_type.get(e);
            if sh_type == elf::SHT_STRTAB {
                total_string_table_size += shdr.sh_size.get(e) as usize;
            }
            if sh_type == elf::SHT_SYMTAB {
                total_local_symbols += shdr.sh_info.get(e) as usize;
            }
            if !reaches_output(sh_type) {
                continue;
            }
            let name = canonical_name(input.section_name(shdr)?);
            groups.entry(name).or_default().push(SectionRef { elf_index, header_index });
        }
    }

    if groups.len() >= elf::SHN_LORESERVE as usize - NUM_SYNTHETIC_SECTIONS {
        return Err(LinkError::report(
            ErrorKind::NotOk,
            format!("too many output sections: {}", groups.len()),
        ));
    }

    let count = groups.len();
    let mut plan = OutputPlan {
        names: Vec::with_capacity(count),
        inputs: Vec::with_capacity(count),
        types: vec![0; count],
        flags: vec![0; count],
        alignments: vec![0; count],
        sizes: Vec::new(),
        input_to_output,
        copies: Vec::new(),
        materialized: Vec::new(),
        total_local_symbols,
        total_string_table_size,
    };
    for (name, members) in groups {
        plan.names.push(name);
        plan.inputs.push(members);
    }

    let mut status = FirstError::default();
    for out_id in 0..plan.inputs.len() {
        for member_index in 0..plan.inputs[out_id].len() {
            let sec_ref = plan.inputs[out_id][member_index];
            let shdr = &inputs[sec_ref.elf_index].shdrs[sec_ref.header_index];
            plan.input_to_output[sec_ref.elf_index][sec_ref.header_index] = out_id as OutSectionId;

            // The first input fixes the attributes.
            if member_index == 0 {
                plan.flags[out_id] = shdr.sh_flags.get(e);
                plan.types[out_id] = shdr.sh_type.get(e);
                plan.alignments[out_id] = shdr.sh_addralign.get(e);
            }
            if !make_flags_compatible(&mut plan.flags[out_id], shdr.sh_flags.get(e))
                || plan.types[out_id] != shdr.sh_type.get(e)
            {
                status.record(LinkError::report(
                    ErrorKind::NotOk,
                    format!(
                        "sections named {} have incompatible types or flags",
                        String::from_utf8_lossy(plan.names[out_id]),
                    ),
                ));
            }
            plan.alignments[out_id] = plan.alignments[out_id].max(shdr.sh_addralign.get(e));
        }
    }
    status.into_result()?;

    // The reverse of input_to_output must hold for every grouped section.
    debug_assert!(plan.inputs.iter().enumerate().all(|(out_id, members)| {
        members
            .iter()
            .all(|r| plan.input_to_output[r.elf_index][r.header_index] == out_id as OutSectionId)
    }));

    Ok(plan)
}

impl<'data> OutputPlan<'data> {
    /// Appends a synthetic output section and returns its id. Content and
    /// size are filled in later.
    pub fn add_synthetic(
        &mut self,
        name: &'static [u8],
        sh_type: u32,
        sh_flags: u64,
        alignment: u64,
    ) -> OutSectionId {
        let id = self.inputs.len() as OutSectionId;
        self.names.push(name);
        self.inputs.push(Vec::new());
        self.types.push(sh_type);
        self.flags.push(sh_flags);
        self.alignments.push(alignment);
        self.sizes.push(0);
        self.materialized.push(None);
        id
    }

    /// Maps an offset within an input section to its output-section offset.
    pub fn map_input_offset(&self, sec_ref: SectionRef, offset: u64) -> Result<u64> {
        map_offset(&self.copies[sec_ref.elf_index][sec_ref.header_index], offset)
    }
}

/// Sorts each output section's inputs by precedence, then computes sizes,
/// copy commands and merged content.
pub fn merge_and_sort_inputs<'data>(
    plan: &mut OutputPlan<'data>,
    inputs: &[ElfInput<'data>],
    sort_keys: &[SortKey],
) -> Result<()> {
    // Each group sorts independently.
    plan.inputs.par_iter_mut().for_each(|members| {
        members.sort_by(|a, b| {
            let key_a = sort_keys[a.elf_index];
            let key_b = sort_keys[b.elf_index];
            key_a.cmp(&key_b).then(a.header_index.cmp(&b.header_index))
        });
    });

    plan.sizes = vec![0; plan.names.len()];
    plan.materialized = vec![None; plan.names.len()];
    plan.copies = inputs
        .iter()
        .map(|input| vec![SectionCopies::default(); input.shdrs.len()])
        .collect();

    for out_id in 0..plan.inputs.len() {
        if plan.flags[out_id] & u64::from(elf::SHF_MERGE) == 0 {
            concatenate_sections(plan, inputs, out_id);
        } else {
            merge_sections(plan, inputs, out_id)?;
        }
    }
    Ok(())
}

/// Lays the sorted inputs end to end, honoring each input's alignment.
fn concatenate_sections<'data>(
    plan: &mut OutputPlan<'data>,
    inputs: &[ElfInput<'data>],
    out_id: usize,
) {
    let e = LittleEndian;
    let mut size = 0u64;
    for member_index in 0..plan.inputs[out_id].len() {
        let sec_ref = plan.inputs[out_id][member_index];
        let shdr = &inputs[sec_ref.elf_index].shdrs[sec_ref.header_index];
        size = crate::utils::align_up(size, shdr.sh_addralign.get(e));
        plan.copies[sec_ref.elf_index][sec_ref.header_index] =
            SectionCopies::Single(PartCopy { size: shdr.sh_size.get(e), dst_offset: size });
        size += shdr.sh_size.get(e);
    }
    plan.sizes[out_id] = size;
}

/// Splits each input into elements and keeps the first byte-identical copy.
///
/// SHF_STRINGS means variable-length elements ending at the next NUL;
/// otherwise elements have the fixed length `sh_entsize`.
fn merge_sections<'data>(
    plan: &mut OutputPlan<'data>,
    inputs: &[ElfInput<'data>],
    out_id: usize,
) -> Result<()> {
    let e = LittleEndian;
    let variable_length = plan.flags[out_id] & u64::from(elf::SHF_STRINGS) != 0;

    let mut size = 0u64;
    let mut element_offsets: HashMap<&'data [u8], u64> = HashMap::new();
    let mut per_input_elements: Vec<Vec<&'data [u8]>> = Vec::with_capacity(plan.inputs[out_id].len());

    for sec_ref in &plan.inputs[out_id] {
        let input = &inputs[sec_ref.elf_index];
        let shdr = &input.shdrs[sec_ref.header_index];
        let data = input.section_data(shdr);

        let mut elements = Vec::new();
        let mut cursor = 0usize;
        while cursor < data.len() {
            let element = if variable_length {
                let nul = data[cursor..].iter().position(|&b| b == 0).ok_or_else(|| {
                    LinkError::report(
                        ErrorKind::BadInputFile,
                        "section merger encountered an out-of-bounds element",
                    )
                })?;
                &data[cursor..cursor + nul + 1]
            } else {
                let entsize = shdr.sh_entsize.get(e) as usize;
                if entsize == 0 || cursor + entsize > data.len() {
                    return Err(LinkError::report(
                        ErrorKind::BadInputFile,
                        "section merger encountered an out-of-bounds element",
                    ));
                }
                &data[cursor..cursor + entsize]
            };
            cursor += element.len();
            elements.push(element);

            element_offsets.entry(element).or_insert_with(|| {
                let offset = size;
                size += element.len() as u64;
                offset
            });
        }
        per_input_elements.push(elements);
    }
    plan.sizes[out_id] = size;

    for (member_index, elements) in per_input_elements.iter().enumerate() {
        let sec_ref = plan.inputs[out_id][member_index];
        let parts = elements
            .iter()
            .map(|element| PartCopy {
                size: element.len() as u64,
                dst_offset: element_offsets[element],
            })
            .collect();
        plan.copies[sec_ref.elf_index][sec_ref.header_index] = SectionCopies::Parts(parts);
    }

    let mut view = vec![0u8; size as usize];
    for (element, &offset) in &element_offsets {
        view[offset as usize..][..element.len()].copy_from_slice(element);
    }
    plan.materialized[out_id] = Some(view);
    Ok(())
}
