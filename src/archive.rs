//! Static archive handling.
//!
//! Archives contribute members lazily: the global symbol index (the member
//! named `/`) is parsed up front, and a member's body is only parsed as an
//! ELF input once the symbol-table fixed point asks for it.

use std::collections::HashMap;

use typed_arena::Arena;

use crate::error::{ErrorKind, LinkError, Result};
use crate::input::{ElfInput, SortKey, ELF_IDENT};

/// Length of the `!<arch>\n` magic.
const SARMAG: usize = 8;
/// Size of one `ar` member header.
const AR_HDR_SIZE: usize = 60;
/// Member name of the GNU-style global symbol index.
const SYMBOL_INDEX_NAME: &[u8; 16] = b"/               ";

/// Extraction state of one archive member. Transitions lazy -> loaded only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Lazy,
    Loaded,
}

/// All archive members of all archive inputs, plus the symbol index mapping
/// a name to the members that define it.
#[derive(Default)]
pub struct ArchiveIndex<'data> {
    /// Sort key per member: `(archive file index, member byte offset)`.
    pub member_keys: Vec<SortKey>,
    pub member_states: Vec<MemberState>,
    /// Symbol name to the members defining it, in index order.
    pub symbols: HashMap<&'data [u8], Vec<usize>>,
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Parses the decimal ASCII size field of an `ar` member header.
fn member_size(field: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(field)
        .map_err(|_| LinkError::report(ErrorKind::BadInputFile, "non-ASCII archive size field"))?;
    text.trim_end()
        .parse()
        .map_err(|_| LinkError::report(ErrorKind::BadInputFile, "unparsable archive size field"))
}

/// Parses the global symbol index of every archive input.
///
/// The index payload is a big-endian 32-bit count, that many big-endian
/// member offsets, then one null-terminated name per symbol. Runs of equal
/// consecutive offsets are coalesced into a single member entry.
pub fn parse_archives<'data>(
    buffers: &[&'data [u8]],
    archive_file_indices: &[u32],
) -> Result<ArchiveIndex<'data>> {
    let mut index = ArchiveIndex::default();

    for &file_index in archive_file_indices {
        let data = buffers[file_index as usize];
        let bad_file = || {
            LinkError::report(ErrorKind::BadInputFile, format!("input file #{file_index}"))
        };

        if data.len() < SARMAG + AR_HDR_SIZE {
            return Err(LinkError::report(ErrorKind::NotOk, "archive too small for an index"));
        }
        let header = &data[SARMAG..SARMAG + AR_HDR_SIZE];
        if &header[..16] != SYMBOL_INDEX_NAME {
            return Err(bad_file());
        }
        let payload_size = member_size(&header[48..58])?;
        let payload_start = SARMAG + AR_HDR_SIZE;
        if data.len() < payload_start + payload_size {
            return Err(bad_file());
        }
        let payload = &data[payload_start..payload_start + payload_size];

        if payload_size < 4 {
            return Err(bad_file());
        }
        let symbol_count = be_u32(payload) as usize;
        if symbol_count == 0 || payload_size < (symbol_count + 1) * 4 {
            return Err(bad_file());
        }
        let offsets = &payload[4..4 + symbol_count * 4];
        let names = &payload[4 + symbol_count * 4..];

        let mut name_cursor = 0usize;
        let mut current_offset = None;
        for i in 0..symbol_count {
            let member_offset = be_u32(&offsets[i * 4..]);
            if current_offset != Some(member_offset) {
                current_offset = Some(member_offset);
                index.member_keys.push(SortKey::new(file_index, member_offset));
                index.member_states.push(MemberState::Lazy);
            }
            let name_end = names[name_cursor..]
                .iter()
                .position(|&b| b == 0)
                .map(|end| name_cursor + end)
                .ok_or_else(bad_file)?;
            let name = &names[name_cursor..name_end];
            name_cursor = name_end + 1;

            let member_id = index.member_keys.len() - 1;
            index.symbols.entry(name).or_default().push(member_id);
        }
    }
    Ok(index)
}

/// Parses the scheduled members as ELF inputs and marks them loaded.
///
/// Member bodies are 2-byte aligned within the archive; a body that is not
/// aligned for an `Elf64_Ehdr` is copied into the arena first.
pub fn extract_archive_members<'data>(
    buffers: &[&'data [u8]],
    index: &mut ArchiveIndex<'data>,
    member_ids: &[usize],
    arena: &'data Arena<u64>,
) -> Result<(Vec<ElfInput<'data>>, Vec<SortKey>)> {
    let mut inputs = Vec::new();
    let mut sort_keys = Vec::new();

    for &member_id in member_ids {
        if index.member_states[member_id] == MemberState::Loaded {
            continue;
        }
        index.member_states[member_id] = MemberState::Loaded;

        let key = index.member_keys[member_id];
        let data = buffers[key.file_index() as usize];
        let offset = key.sub_index() as usize;
        if data.len() < offset + AR_HDR_SIZE {
            return Err(LinkError::report(ErrorKind::BadInputFile, "archive file too small"));
        }
        let size = member_size(&data[offset + 48..offset + 58])?;
        let mut body_start = offset + AR_HDR_SIZE;
        body_start += body_start % 2;
        if data.len() < body_start + size {
            return Err(LinkError::report(ErrorKind::BadInputFile, "archive member out of bounds"));
        }

        let mut body = &data[body_start..body_start + size];
        if body.as_ptr().align_offset(std::mem::align_of::<u64>()) != 0 {
            body = copy_aligned(arena, body);
        }
        if !body.starts_with(&ELF_IDENT) {
            return Err(LinkError::report(
                ErrorKind::NotOk,
                "archive member is not an ELF relocatable",
            ));
        }

        inputs.push(ElfInput::parse(body)?);
        sort_keys.push(key);
        tracing::debug!(
            archive = key.file_index(),
            offset = key.sub_index(),
            "extracted archive member"
        );
    }
    Ok((inputs, sort_keys))
}

/// Copies bytes into the arena at 8-byte alignment.
fn copy_aligned<'data>(arena: &'data Arena<u64>, bytes: &[u8]) -> &'data [u8] {
    let words = bytes.len().div_ceil(8);
    let slab = arena.alloc_extend(std::iter::repeat(0u64).take(words));
    let slab_bytes = object::pod::bytes_of_slice_mut(slab);
    slab_bytes[..bytes.len()].copy_from_slice(bytes);
    &slab_bytes[..bytes.len()]
}
