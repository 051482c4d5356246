//! End-to-end link scenarios.
//!
//! Each test synthesizes relocatable objects in memory, links them to a
//! temp directory, and verifies the produced executable with a standard ELF
//! reader plus raw header parsing. Nothing here shells out to a toolchain.

use object::elf;
use object::pod;
use object::read::{Object as _, ObjectSection as _, ObjectSymbol as _};
use object::write;
use object::LittleEndian;
use object::{
    Architecture, BinaryFormat, Endianness, RelocationFlags, SectionKind, SymbolFlags,
    SymbolKind, SymbolScope,
};
use std::path::Path;

use sld::error::ErrorKind;
use sld::linker::{link_executable, LinkerOptions};

/// `exit(0)`: mov $60,%eax; syscall
const EXIT0: &[u8] = &[0xb8, 0x3c, 0x00, 0x00, 0x00, 0x0f, 0x05];
/// `exit(1)`: mov $1,%edi; mov $60,%eax; syscall
const EXIT1: &[u8] = &[0xbf, 0x01, 0x00, 0x00, 0x00, 0xb8, 0x3c, 0x00, 0x00, 0x00, 0x0f, 0x05];
/// `call <rel32>` with the displacement left for the linker
const CALL: &[u8] = &[0xe8, 0x00, 0x00, 0x00, 0x00];

/// Copies bytes to 8-byte-aligned storage, standing in for the mmap the CLI
/// would hand the core.
fn aligned_copy(data: &[u8]) -> &'static [u8] {
    let words = data.len().div_ceil(8);
    let boxed: Box<[u64]> = vec![0u64; words].into_boxed_slice();
    let slab: &'static mut [u64] = Box::leak(boxed);
    let bytes = pod::bytes_of_slice_mut(slab);
    bytes[..data.len()].copy_from_slice(data);
    &bytes[..data.len()]
}

fn link_to(objects: &[Vec<u8>], output: &Path) -> sld::error::Result<()> {
    let buffers: Vec<&[u8]> = objects.iter().map(|data| aligned_copy(data)).collect();
    let options = LinkerOptions { output_file_name: output.to_path_buf(), ..Default::default() };
    link_executable(&buffers, &options)
}

/// Small builder around `object::write` for relocatable test inputs.
struct TestObject {
    inner: write::Object<'static>,
}

impl TestObject {
    fn new() -> Self {
        Self {
            inner: write::Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little),
        }
    }

    fn section(&mut self, name: &[u8], kind: SectionKind, data: &[u8], align: u64) -> write::SectionId {
        let id = self.inner.add_section(Vec::new(), name.to_vec(), kind);
        self.inner.append_section_data(id, data, align);
        id
    }

    fn define(
        &mut self,
        name: &[u8],
        section: write::SectionId,
        value: u64,
        size: u64,
        weak: bool,
    ) -> write::SymbolId {
        self.inner.add_symbol(write::Symbol {
            name: name.to_vec(),
            value,
            size,
            kind: SymbolKind::Data,
            scope: SymbolScope::Linkage,
            weak,
            section: write::SymbolSection::Section(section),
            flags: SymbolFlags::None,
        })
    }

    fn undefined(&mut self, name: &[u8], weak: bool) -> write::SymbolId {
        self.inner.add_symbol(write::Symbol {
            name: name.to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Unknown,
            scope: SymbolScope::Linkage,
            weak,
            section: write::SymbolSection::Undefined,
            flags: SymbolFlags::None,
        })
    }

    fn absolute(&mut self, name: &[u8], value: u64) -> write::SymbolId {
        self.inner.add_symbol(write::Symbol {
            name: name.to_vec(),
            value,
            size: 0,
            kind: SymbolKind::Data,
            scope: SymbolScope::Linkage,
            weak: false,
            section: write::SymbolSection::Absolute,
            flags: SymbolFlags::None,
        })
    }

    fn reloc(&mut self, section: write::SectionId, offset: u64, symbol: write::SymbolId, r_type: u32, addend: i64) {
        self.inner
            .add_relocation(
                section,
                write::Relocation {
                    offset,
                    symbol,
                    addend,
                    flags: RelocationFlags::Elf { r_type },
                },
            )
            .unwrap();
    }

    fn build(self) -> Vec<u8> {
        self.inner.write().unwrap()
    }
}

/// `_start:` followed by the given code in `.text`.
fn start_object(code: &[u8]) -> (TestObject, write::SectionId) {
    let mut obj = TestObject::new();
    let text = obj.section(b".text", SectionKind::Text, code, 16);
    obj.define(b"_start", text, 0, 0, false);
    (obj, text)
}

/// `_start: call exit` with `exit` undefined.
fn caller_object() -> Vec<u8> {
    let (mut obj, text) = start_object(CALL);
    let exit = obj.undefined(b"exit", false);
    obj.reloc(text, 1, exit, elf::R_X86_64_PLT32, -4);
    obj.build()
}

/// An object exporting `name` at the start of its `.text`.
fn provider_object(name: &[u8], code: &[u8]) -> Vec<u8> {
    let mut obj = TestObject::new();
    let text = obj.section(b".text", SectionKind::Text, code, 16);
    obj.define(name, text, 0, 0, false);
    obj.build()
}

/// Builds an `ar` archive with a GNU-style global symbol index.
/// `symbols` maps a symbol name to the member index that defines it.
fn build_archive(members: &[&[u8]], symbols: &[(&str, usize)]) -> Vec<u8> {
    fn ar_header(name: &str, size: usize) -> Vec<u8> {
        format!("{name:<16}{:<12}{:<6}{:<6}{:<8}{size:<10}`\n", 0, 0, 0, 644).into_bytes()
    }

    let mut names_blob = Vec::new();
    for (name, _) in symbols {
        names_blob.extend_from_slice(name.as_bytes());
        names_blob.push(0);
    }
    let payload_len = 4 + 4 * symbols.len() + names_blob.len();

    let mut member_offsets = Vec::with_capacity(members.len());
    let mut cursor = 8 + 60 + payload_len + payload_len % 2;
    for member in members {
        member_offsets.push(cursor as u32);
        cursor += 60 + member.len() + member.len() % 2;
    }

    let mut out = Vec::with_capacity(cursor);
    out.extend_from_slice(b"!<arch>\n");
    out.extend_from_slice(&ar_header("/", payload_len));
    out.extend_from_slice(&(symbols.len() as u32).to_be_bytes());
    for &(_, member_index) in symbols {
        out.extend_from_slice(&member_offsets[member_index].to_be_bytes());
    }
    out.extend_from_slice(&names_blob);
    if payload_len % 2 == 1 {
        out.push(b'\n');
    }
    for (index, member) in members.iter().enumerate() {
        out.extend_from_slice(&ar_header(&format!("m{index}.o/"), member.len()));
        out.extend_from_slice(member);
        if member.len() % 2 == 1 {
            out.push(b'\n');
        }
    }
    out
}

fn symbol_address(file: &object::File<'_>, name: &str) -> u64 {
    file.symbols()
        .find(|sym| sym.name().map(|n| n == name).unwrap_or(false))
        .unwrap_or_else(|| panic!("symbol {name} missing from output"))
        .address()
}

fn section_by_name<'a>(file: &'a object::File<'_>, name: &str) -> object::Section<'a, 'a> {
    file.sections()
        .find(|section| section.name().map(|n| n == name).unwrap_or(false))
        .unwrap_or_else(|| panic!("section {name} missing from output"))
}

fn read_u64_at_vaddr(file: &object::File<'_>, vaddr: u64) -> u64 {
    for section in file.sections() {
        let start = section.address();
        if vaddr >= start && vaddr + 8 <= start + section.size() {
            if let Ok(data) = section.data() {
                let offset = (vaddr - start) as usize;
                if data.len() >= offset + 8 {
                    return u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap());
                }
            }
        }
    }
    panic!("no section contains address {vaddr:#x}");
}

/// Raw program headers of the produced file.
fn program_headers(data: &[u8]) -> Vec<elf::ProgramHeader64<LittleEndian>> {
    let data = aligned_copy(data);
    let e = LittleEndian;
    let (header, _) = pod::from_bytes::<elf::FileHeader64<LittleEndian>>(data).unwrap();
    let phoff = header.e_phoff.get(e) as usize;
    let phnum = usize::from(header.e_phnum.get(e));
    let (phdrs, _) =
        pod::slice_from_bytes::<elf::ProgramHeader64<LittleEndian>>(&data[phoff..], phnum).unwrap();
    phdrs.to_vec()
}

#[test]
fn minimal_two_object_link() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("a.out");

    let caller = caller_object();
    let provider = provider_object(b"exit", EXIT0);

    link_to(&[caller, provider], &out).unwrap();

    let data = std::fs::read(&out).unwrap();
    let file = object::File::parse(&*data).unwrap();

    // Entry addresses the resolved entry symbol.
    let start = symbol_address(&file, "_start");
    let exit = symbol_address(&file, "exit");
    assert_eq!(file.entry(), start);

    // The call displacement lands on `exit`.
    let text = section_by_name(&file, ".text");
    assert_eq!(start, text.address());
    assert_eq!(exit, text.address() + 16);
    let body = text.data().unwrap();
    let disp = i32::from_le_bytes(body[1..5].try_into().unwrap());
    assert_eq!(i64::from(disp), exit as i64 - (start as i64 + 1 + 4));

    // Round trip: segment composition and section presence.
    let e = LittleEndian;
    let phdrs = program_headers(&data);
    let types: Vec<u32> = phdrs.iter().map(|p| p.p_type.get(e)).collect();
    assert_eq!(types, vec![elf::PT_LOAD, elf::PT_LOAD, elf::PT_GNU_STACK]);
    for name in [".text", ".got", ".symtab", ".strtab", ".shstrtab"] {
        section_by_name(&file, name);
    }

    // Total file size is exactly headers plus section data plus the table.
    let (header, _) = pod::from_bytes::<elf::FileHeader64<LittleEndian>>(aligned_copy(&data)).unwrap();
    let expected = header.e_shoff.get(e) + u64::from(header.e_shnum.get(e)) * 64;
    assert_eq!(data.len() as u64, expected);

    // The file is left executable on disk.
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(&out).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
}

#[test]
fn undefined_global_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("a.out");

    // movabs $sym,%rax then exit(0)
    let mut code = vec![0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0];
    code.extend_from_slice(EXIT0);
    let mut obj = TestObject::new();
    let text = obj.section(b".text", SectionKind::Text, &code, 16);
    obj.define(b"_start", text, 0, 0, false);
    let sym = obj.undefined(b"sym", false);
    obj.reloc(text, 2, sym, elf::R_X86_64_64, 0);

    let err = link_to(&[obj.build()], &out).unwrap_err();
    assert_eq!(err.kind, ErrorKind::SymbolUndefined);
}

#[test]
fn undefined_weak_resolves_to_zero() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("a.out");

    let mut code = vec![0x48, 0xb8, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
    code.extend_from_slice(EXIT0);
    let mut obj = TestObject::new();
    let text = obj.section(b".text", SectionKind::Text, &code, 16);
    obj.define(b"_start", text, 0, 0, false);
    let weaksym = obj.undefined(b"weaksym", true);
    obj.reloc(text, 2, weaksym, elf::R_X86_64_64, 0);

    link_to(&[obj.build()], &out).unwrap();

    let data = std::fs::read(&out).unwrap();
    let file = object::File::parse(&*data).unwrap();
    let body = section_by_name(&file, ".text").data().unwrap();
    assert_eq!(u64::from_le_bytes(body[2..10].try_into().unwrap()), 0);
}

/// A `_start` object whose `.data` holds one pointer to `weaksym`.
fn pointer_consumer() -> Vec<u8> {
    let (mut obj, _text) = start_object(EXIT0);
    let data = obj.section(b".data", SectionKind::Data, &[0u8; 8], 8);
    let weaksym = obj.undefined(b"weaksym", false);
    obj.reloc(data, 0, weaksym, elf::R_X86_64_64, 0);
    obj.build()
}

/// An object defining `weaksym` as an 8-byte `.rodata` value.
fn pointer_provider(value: u64, weak: bool) -> Vec<u8> {
    let mut obj = TestObject::new();
    let rodata = obj.section(b".rodata", SectionKind::ReadOnlyData, &value.to_le_bytes(), 8);
    obj.define(b"weaksym", rodata, 0, 8, weak);
    obj.build()
}

fn linked_weaksym_value(objects: &[Vec<u8>], dir: &Path) -> u64 {
    let out = dir.join("a.out");
    link_to(objects, &out).unwrap();
    let data = std::fs::read(&out).unwrap();
    let file = object::File::parse(&*data).unwrap();
    let pointer_slot = section_by_name(&file, ".data").address();
    let target = read_u64_at_vaddr(&file, pointer_slot);
    assert_eq!(target, symbol_address(&file, "weaksym"));
    read_u64_at_vaddr(&file, target)
}

#[test]
fn global_definition_beats_weak_in_any_order() {
    let dir = tempfile::tempdir().unwrap();
    let a = pointer_consumer();
    let weak = pointer_provider(1, true);
    let strong = pointer_provider(2, false);

    assert_eq!(linked_weaksym_value(&[a.clone(), weak.clone(), strong.clone()], dir.path()), 2);
    assert_eq!(linked_weaksym_value(&[a.clone(), strong.clone(), weak.clone()], dir.path()), 2);
    assert_eq!(linked_weaksym_value(&[a.clone(), strong], dir.path()), 2);
    assert_eq!(linked_weaksym_value(&[a, weak], dir.path()), 1);
}

#[test]
fn text_subsections_collapse_into_one_text() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("a.out");

    let mut obj = TestObject::new();
    let text = obj.section(b".text.xxx", SectionKind::Text, EXIT0, 16);
    obj.define(b"_start", text, 0, 0, false);
    link_to(&[obj.build()], &out).unwrap();

    let data = std::fs::read(&out).unwrap();
    let file = object::File::parse(&*data).unwrap();
    let text_sections: Vec<String> = file
        .sections()
        .filter_map(|section| section.name().ok().map(str::to_string))
        .filter(|name| name.starts_with(".text"))
        .collect();
    assert_eq!(text_sections, vec![".text".to_string()]);
}

#[test]
fn archive_members_extract_by_precedence() {
    let dir = tempfile::tempdir().unwrap();

    let caller = caller_object();
    let exit0 = provider_object(b"exit", EXIT0);
    let exit1 = provider_object(b"exit", EXIT1);
    let archive = build_archive(&[&exit0], &[("exit", 0)]);

    // The reference precedes the archive: the member is extracted.
    let out = dir.path().join("one.out");
    link_to(&[caller.clone(), archive.clone()], &out).unwrap();
    let data = std::fs::read(&out).unwrap();
    let file = object::File::parse(&*data).unwrap();
    let exit = symbol_address(&file, "exit");
    let text = section_by_name(&file, ".text");
    assert_eq!(exit, text.address() + 16);

    // An eager definition after the archive makes precedence ambiguous.
    let err = link_to(&[caller.clone(), archive.clone(), exit1.clone()], &out).unwrap_err();
    assert_eq!(err.kind, ErrorKind::SymbolRedefined);

    // An eager definition before the archive wins; the member stays lazy.
    let out = dir.path().join("two.out");
    link_to(&[caller, exit1, archive], &out).unwrap();
    let data = std::fs::read(&out).unwrap();
    let file = object::File::parse(&*data).unwrap();
    let exit = symbol_address(&file, "exit");
    let text = section_by_name(&file, ".text");
    assert_eq!(exit, text.address() + 16);
    let body = text.data().unwrap();
    // The code at `exit` is the eager provider's exit(1).
    assert_eq!(&body[16..16 + EXIT1.len()], EXIT1);
}

#[test]
fn merged_strings_are_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("a.out");

    let string_flags =
        u64::from(elf::SHF_ALLOC | elf::SHF_MERGE | elf::SHF_STRINGS);
    let (mut first, _text) = start_object(EXIT0);
    let strings = first.section(
        b".rodata.str1.1",
        SectionKind::ReadOnlyString,
        b"common\0alpha\0",
        1,
    );
    first.inner.section_mut(strings).flags = object::SectionFlags::Elf { sh_flags: string_flags };

    let mut second = TestObject::new();
    let strings = second.section(
        b".rodata.str1.1",
        SectionKind::ReadOnlyString,
        b"common\0beta\0",
        1,
    );
    second.inner.section_mut(strings).flags = object::SectionFlags::Elf { sh_flags: string_flags };
    // Give the second object a definition so it is not empty of symbols.
    second.define(b"strings_base", strings, 0, 0, false);

    link_to(&[first.build(), second.build()], &out).unwrap();

    let data = std::fs::read(&out).unwrap();
    let file = object::File::parse(&*data).unwrap();
    let rodata = section_by_name(&file, ".rodata").data().unwrap();

    let count = |needle: &[u8]| {
        rodata
            .windows(needle.len())
            .filter(|window| *window == needle)
            .count()
    };
    assert_eq!(count(b"common\0"), 1);
    assert_eq!(count(b"alpha\0"), 1);
    assert_eq!(count(b"beta\0"), 1);
    assert_eq!(rodata.len(), "common\0alpha\0beta\0".len());
}

/// A relocatable with `count` distinct single-byte-named sections, built by
/// hand because no writer emits tens of thousands of sections willingly.
fn many_sections_object(count: usize) -> Vec<u8> {
    use sld::utils::{u16, u32, u64};

    let mut shstrtab = vec![0u8];
    let mut name_offsets = Vec::with_capacity(count);
    for index in 0..count {
        name_offsets.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(format!("s{index}\0").as_bytes());
    }
    let table_name_offset = shstrtab.len() as u32;
    shstrtab.extend_from_slice(b".shstrtab\0");

    let ehdr_size = std::mem::size_of::<elf::FileHeader64<LittleEndian>>();
    let shnum = count + 2;
    let shoff = (ehdr_size + shstrtab.len() + 7) & !7;

    let ehdr = elf::FileHeader64::<LittleEndian> {
        e_ident: elf::Ident {
            magic: elf::ELFMAG,
            class: elf::ELFCLASS64,
            data: elf::ELFDATA2LSB,
            version: elf::EV_CURRENT,
            os_abi: elf::ELFOSABI_NONE,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: u16(elf::ET_REL),
        e_machine: u16(elf::EM_X86_64),
        e_version: u32(u32::from(elf::EV_CURRENT)),
        e_entry: u64(0),
        e_phoff: u64(0),
        e_shoff: u64(shoff as u64),
        e_flags: u32(0),
        e_ehsize: u16(ehdr_size as u16),
        e_phentsize: u16(0),
        e_phnum: u16(0),
        e_shentsize: u16(64),
        e_shnum: u16(shnum as u16),
        e_shstrndx: u16((count + 1) as u16),
    };

    let null_shdr = elf::SectionHeader64::<LittleEndian> {
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
    };

    let mut out = Vec::with_capacity(shoff + shnum * 64);
    out.extend_from_slice(pod::bytes_of(&ehdr));
    out.extend_from_slice(&shstrtab);
    out.resize(shoff, 0);
    out.extend_from_slice(pod::bytes_of(&null_shdr));
    for index in 0..count {
        let mut shdr = null_shdr;
        shdr.sh_name = u32(name_offsets[index]);
        shdr.sh_type = u32(elf::SHT_PROGBITS);
        shdr.sh_flags = u64(u64::from(elf::SHF_ALLOC));
        shdr.sh_addralign = u64(1);
        out.extend_from_slice(pod::bytes_of(&shdr));
    }
    let mut strtab_shdr = null_shdr;
    strtab_shdr.sh_name = u32(table_name_offset);
    strtab_shdr.sh_type = u32(elf::SHT_STRTAB);
    strtab_shdr.sh_offset = u64(ehdr_size as u64);
    strtab_shdr.sh_size = u64(shstrtab.len() as u64);
    strtab_shdr.sh_addralign = u64(1);
    out.extend_from_slice(pod::bytes_of(&strtab_shdr));
    out
}

#[test]
fn too_many_output_sections_fail_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("a.out");

    // `_start` comes from a normal object; the section flood from a second
    // input pushes the output-section count past the planner's limit.
    let limit = elf::SHN_LORESERVE as usize - 4;
    let start = provider_object(b"_start", EXIT0);
    let err = link_to(&[start, many_sections_object(limit)], &out).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotOk);
    assert!(err.to_string().contains("too many output sections"));

    // An object with no entry symbol fails before planning.
    let err = link_to(&[many_sections_object(8)], &out).unwrap_err();
    assert!(err.to_string().contains("entry symbol"));
}

#[test]
fn got_entries_are_synthesized_and_patched() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("a.out");

    // movq foo@GOTPCREL(%rip),%rax ; movq wsym@GOTPCREL(%rip),%rbx ;
    // movq kabs@GOTPCREL(%rip),%rcx
    let mut code = vec![0x48, 0x8b, 0x05, 0, 0, 0, 0];
    code.extend_from_slice(&[0x48, 0x8b, 0x1d, 0, 0, 0, 0]);
    code.extend_from_slice(&[0x48, 0x8b, 0x0d, 0, 0, 0, 0]);
    code.extend_from_slice(EXIT0);

    let mut obj = TestObject::new();
    let text = obj.section(b".text", SectionKind::Text, &code, 16);
    obj.define(b"_start", text, 0, 0, false);
    let data = obj.section(b".data", SectionKind::Data, &0xfeedu64.to_le_bytes(), 8);
    let foo = obj.define(b"foo", data, 0, 8, false);
    let wsym = obj.undefined(b"wsym", true);
    let kabs = obj.absolute(b"kabs", 0x1000);
    obj.reloc(text, 3, foo, elf::R_X86_64_REX_GOTPCRELX, -4);
    obj.reloc(text, 10, wsym, elf::R_X86_64_REX_GOTPCRELX, -4);
    obj.reloc(text, 17, kabs, elf::R_X86_64_REX_GOTPCRELX, -4);

    link_to(&[obj.build()], &out).unwrap();

    let data = std::fs::read(&out).unwrap();
    let file = object::File::parse(&*data).unwrap();
    let got = section_by_name(&file, ".got");
    let got_body = got.data().unwrap();

    // Three reserved entries plus one per GOT-using symbol.
    assert_eq!(got_body.len(), (3 + 3) * 8);
    let foo_addr = symbol_address(&file, "foo");
    assert_eq!(u64::from_le_bytes(got_body[24..32].try_into().unwrap()), foo_addr);
    // The undefined-weak slot stays zero.
    assert_eq!(u64::from_le_bytes(got_body[32..40].try_into().unwrap()), 0);
    // An absolute definition lands in its slot as-is.
    assert_eq!(u64::from_le_bytes(got_body[40..48].try_into().unwrap()), 0x1000);

    // The first load is patched against its GOT slot.
    let text = section_by_name(&file, ".text");
    let body = text.data().unwrap();
    let disp = i64::from(i32::from_le_bytes(body[3..7].try_into().unwrap()));
    let place = text.address() as i64 + 3;
    assert_eq!(place + 4 + disp, got.address() as i64 + 24);
}
