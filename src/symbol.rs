//! Symbol management.
//!
//! The global symbol table records, per name, the first observed *search*
//! (undefined reference) and the first observed *load* (definition), ordered
//! by sort key. Names are views into the input buffers' string tables, which
//! outlive the table.

use indexmap::IndexMap;
use object::elf;
use object::LittleEndian;

use crate::archive::ArchiveIndex;
use crate::error::{ErrorKind, FirstError, LinkError, Result};
use crate::input::{ElfInput, SortKey};
use crate::utils::cstr_at;

/// A symbol record together with the ELF input it was read from. Non-owning.
#[derive(Debug, Clone, Copy)]
pub struct SymbolRef<'data> {
    pub sym: &'data elf::Sym64<LittleEndian>,
    pub elf_id: usize,
}

#[derive(Default)]
pub struct SymbolEntry<'data> {
    pub first_search: Option<SymbolRef<'data>>,
    pub first_load: Option<SymbolRef<'data>>,
}

/// Keyed by symbol name; insertion-ordered so the emitted symbol table is
/// stable across runs.
pub type SymbolTable<'data> = IndexMap<&'data [u8], SymbolEntry<'data>>;

fn st_bind(sym: &elf::Sym64<LittleEndian>) -> u8 {
    sym.st_info >> 4
}

pub fn is_local(sym: &elf::Sym64<LittleEndian>) -> bool {
    st_bind(sym) == elf::STB_LOCAL
}

pub fn is_weak(sym: &elf::Sym64<LittleEndian>) -> bool {
    st_bind(sym) == elf::STB_WEAK
}

pub fn is_global(sym: &elf::Sym64<LittleEndian>) -> bool {
    st_bind(sym) == elf::STB_GLOBAL
}

/// First non-weak wins; among equals, the lowest sort key wins.
fn replace_if_appropriate<'data>(
    slot: &mut Option<SymbolRef<'data>>,
    candidate: SymbolRef<'data>,
    sort_keys: &[SortKey],
) {
    match slot {
        None => *slot = Some(candidate),
        Some(current) => {
            let current_weak = is_weak(current.sym);
            let candidate_weak = is_weak(candidate.sym);
            if current_weak && !candidate_weak {
                *slot = Some(candidate);
            } else if current_weak == candidate_weak
                && sort_keys[candidate.elf_id] < sort_keys[current.elf_id]
            {
                *slot = Some(candidate);
            }
        }
    }
}

/// Inserts the global symbols of `inputs[start_id..]` into the table.
///
/// Undefined references are additionally recorded in `searched_names` so the
/// archive loop only revisits names that may have gained a resolution.
pub fn insert_symbols<'data>(
    inputs: &[ElfInput<'data>],
    sort_keys: &[SortKey],
    start_id: usize,
    table: &mut SymbolTable<'data>,
    searched_names: &mut Vec<&'data [u8]>,
) -> Result<()> {
    let e = LittleEndian;
    let mut status = FirstError::default();

    for (offset, input) in inputs[start_id..].iter().enumerate() {
        let elf_id = start_id + offset;
        for shdr in input.shdrs {
            if shdr.sh_type.get(e) != elf::SHT_SYMTAB {
                continue;
            }
            let symbols = input.symbols(shdr)?;
            let strtab = input.section_data(input.linked_section(shdr)?);

            for (sym_index, sym) in symbols.iter().enumerate() {
                if sym_index == 0 || is_local(sym) {
                    continue;
                }
                let name = cstr_at(strtab, sym.st_name.get(e) as usize)?;
                let entry = table.entry(name).or_default();

                if sym.st_shndx.get(e) == elf::SHN_UNDEF {
                    searched_names.push(name);
                    replace_if_appropriate(&mut entry.first_search, SymbolRef { sym, elf_id }, sort_keys);
                    continue;
                }
                // A definition. Two strong ones of the same name clash.
                if let Some(existing) = &entry.first_load {
                    if is_global(sym) && is_global(existing.sym) {
                        status.record(LinkError::report(
                            ErrorKind::SymbolRedefined,
                            String::from_utf8_lossy(name).into_owned(),
                        ));
                        continue;
                    }
                }
                replace_if_appropriate(&mut entry.first_load, SymbolRef { sym, elf_id }, sort_keys);
            }
        }
    }
    status.into_result()
}

/// Decides which archive members to extract for the searched names.
///
/// For each name the candidate is the first member whose sort key follows
/// the first search, wrapping to the first member when the reference comes
/// after every definition. A candidate ordered between an existing search
/// and an existing load would have been extracted first, which makes the
/// precedence ambiguous: that is a redefinition error.
pub fn determine_members_to_extract<'data>(
    table: &SymbolTable<'data>,
    archive_index: &ArchiveIndex<'data>,
    sort_keys: &[SortKey],
    searched_names: &[&'data [u8]],
) -> Result<Vec<usize>> {
    let mut to_extract = Vec::new();

    for &name in searched_names {
        let entry = &table[name];
        let Some(member_ids) = archive_index.symbols.get(name) else {
            continue;
        };
        let Some(&first_member) = member_ids.first() else {
            continue;
        };

        let search = entry.first_search.as_ref().expect("searched name without a search");
        let search_key = sort_keys[search.elf_id];
        let candidate = member_ids
            .iter()
            .copied()
            .find(|&id| archive_index.member_keys[id] > search_key)
            .unwrap_or(first_member);
        let candidate_key = archive_index.member_keys[candidate];

        match &entry.first_load {
            None => to_extract.push(candidate),
            Some(load) => {
                if search_key < candidate_key && candidate_key < sort_keys[load.elf_id] {
                    return Err(LinkError::report(
                        ErrorKind::SymbolRedefined,
                        format!(
                            "{} (loaded from file #{})",
                            String::from_utf8_lossy(name),
                            candidate_key.file_index()
                        ),
                    ));
                }
            }
        }
    }
    Ok(to_extract)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::endian::{U16, U32, U64};

    fn sym(bind: u8, shndx: u16) -> elf::Sym64<LittleEndian> {
        let e = LittleEndian;
        elf::Sym64 {
            st_name: U32::new(e, 0),
            st_info: (bind << 4) | elf::STT_NOTYPE,
            st_other: 0,
            st_shndx: U16::new(e, shndx),
            st_value: U64::new(e, 0),
            st_size: U64::new(e, 0),
        }
    }

    #[test]
    fn strong_definition_beats_weak_regardless_of_order() {
        let keys = [SortKey::new(0, 0), SortKey::new(1, 0)];
        let weak = sym(elf::STB_WEAK, 1);
        let strong = sym(elf::STB_GLOBAL, 1);

        let mut slot = None;
        replace_if_appropriate(&mut slot, SymbolRef { sym: &weak, elf_id: 0 }, &keys);
        replace_if_appropriate(&mut slot, SymbolRef { sym: &strong, elf_id: 1 }, &keys);
        assert_eq!(slot.unwrap().elf_id, 1);

        let mut slot = None;
        replace_if_appropriate(&mut slot, SymbolRef { sym: &strong, elf_id: 1 }, &keys);
        replace_if_appropriate(&mut slot, SymbolRef { sym: &weak, elf_id: 0 }, &keys);
        assert_eq!(slot.unwrap().elf_id, 1);
    }

    #[test]
    fn among_equal_strength_the_earliest_sort_key_wins() {
        let keys = [SortKey::new(0, 0), SortKey::new(1, 0)];
        let first = sym(elf::STB_WEAK, 1);
        let second = sym(elf::STB_WEAK, 1);

        let mut slot = None;
        replace_if_appropriate(&mut slot, SymbolRef { sym: &second, elf_id: 1 }, &keys);
        replace_if_appropriate(&mut slot, SymbolRef { sym: &first, elf_id: 0 }, &keys);
        assert_eq!(slot.unwrap().elf_id, 0);
    }
}
