//! Minimal static ELF32 container
//!
//! Two program headers (a RISC-V attributes segment and the LOAD segment
//! covering the file from offset 0) and four section headers (`NULL`,
//! `.text`, `.riscv.attributes`, `.shstrtab`).  The code is linked at
//! 0x00010074, which is where the text lands when the LOAD segment maps
//! the headers at 0x00010000.

use basil_common::{BasilError, BasilResult};
use std::io::Write;
use std::path::Path;

/// Program entry point and `.text` virtual address.
pub const TEXT_VADDR: u32 = 0x0001_0074;
/// Image base of the LOAD segment.
pub const LOAD_VADDR: u32 = 0x0001_0000;
/// File offset of the code: ELF header plus two program headers.
pub const CODE_OFFSET: u32 = 52 + 2 * 32;

const SHT_PROGBITS: u32 = 1;
const SHT_STRTAB: u32 = 3;
const SHT_RISCV_ATTRIBUTES: u32 = 0x7000_0003;
const PT_LOAD: u32 = 1;
const PT_RISCV_ATTRIBUTES: u32 = 0x7000_0003;

const SHSTRTAB: &[u8] = b"\0.text\0.riscv.attributes\0.shstrtab\0";

/// Build attribute blob declaring `rv32i2p0_m2p0`.
const RISCV_ATTRIBUTES: [u8; 31] = [
    0x41, 0x1e, 0x00, 0x00, 0x00, 0x72, 0x69, 0x73, 0x63, 0x76, 0x00, 0x01, 0x14, 0x00,
    0x00, 0x00, 0x05, 0x72, 0x76, 0x33, 0x32, 0x69, 0x32, 0x70, 0x30, 0x5f, 0x6d, 0x32,
    0x70, 0x30, 0x00,
];

fn u16le(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn u32le(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

struct SectionHeader {
    name: u32,
    shtype: u32,
    flags: u32,
    addr: u32,
    offset: u32,
    size: u32,
    align: u32,
}

fn push_section_header(out: &mut Vec<u8>, sh: &SectionHeader) {
    u32le(out, sh.name);
    u32le(out, sh.shtype);
    u32le(out, sh.flags);
    u32le(out, sh.addr);
    u32le(out, sh.offset);
    u32le(out, sh.size);
    u32le(out, 0); // link
    u32le(out, 0); // info
    u32le(out, sh.align);
    u32le(out, 0); // entsize
}

fn header(code_len: usize) -> Vec<u8> {
    let prog_seg_size = CODE_OFFSET + code_len as u32;
    let tail_end = prog_seg_size + RISCV_ATTRIBUTES.len() as u32 + SHSTRTAB.len() as u32;
    let shoff = (tail_end + 3) & !3;

    let mut out = Vec::with_capacity(CODE_OFFSET as usize);

    // e_ident
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
    out.extend_from_slice(&[1, 1, 1, 0]); // 32-bit, little endian, version, SysV
    out.extend_from_slice(&[0; 8]);

    u16le(&mut out, 2); // ET_EXEC
    u16le(&mut out, 0xf3); // EM_RISCV
    u32le(&mut out, 1); // version
    u32le(&mut out, TEXT_VADDR); // entry
    u32le(&mut out, 52); // phoff
    u32le(&mut out, shoff);
    u32le(&mut out, 0); // flags
    u16le(&mut out, 52); // ehsize
    u16le(&mut out, 32); // phentsize
    u16le(&mut out, 2); // phnum
    u16le(&mut out, 40); // shentsize
    u16le(&mut out, 4); // shnum
    u16le(&mut out, 3); // shstrndx

    // PT_RISCV_ATTRIBUTES
    u32le(&mut out, PT_RISCV_ATTRIBUTES);
    u32le(&mut out, prog_seg_size); // offset
    u32le(&mut out, 0); // vaddr
    u32le(&mut out, 0); // paddr
    u32le(&mut out, RISCV_ATTRIBUTES.len() as u32); // filesz
    u32le(&mut out, 0); // memsz
    u32le(&mut out, 4); // flags
    u32le(&mut out, 1); // align

    // PT_LOAD for headers plus code
    u32le(&mut out, PT_LOAD);
    u32le(&mut out, 0);
    u32le(&mut out, LOAD_VADDR);
    u32le(&mut out, LOAD_VADDR);
    u32le(&mut out, prog_seg_size);
    u32le(&mut out, prog_seg_size);
    u32le(&mut out, 5); // R+X
    u32le(&mut out, 0x1000);

    out
}

fn tail(code_len: usize) -> Vec<u8> {
    let prog_seg_size = CODE_OFFSET + code_len as u32;
    let attrs_off = prog_seg_size;
    let strtab_off = attrs_off + RISCV_ATTRIBUTES.len() as u32;
    let tail_end = strtab_off + SHSTRTAB.len() as u32;
    let padding = ((4 - (tail_end & 3)) & 3) as usize;

    let mut out = Vec::new();
    out.extend_from_slice(&RISCV_ATTRIBUTES);
    out.extend_from_slice(SHSTRTAB);
    out.extend_from_slice(&[0, 0, 0][..padding]);

    push_section_header(
        &mut out,
        &SectionHeader {
            name: 0,
            shtype: 0,
            flags: 0,
            addr: 0,
            offset: 0,
            size: 0,
            align: 0,
        },
    );
    push_section_header(
        &mut out,
        &SectionHeader {
            name: 1,
            shtype: SHT_PROGBITS,
            flags: 6, // ALLOC | EXECINSTR
            addr: TEXT_VADDR,
            offset: CODE_OFFSET,
            size: code_len as u32,
            align: 4,
        },
    );
    push_section_header(
        &mut out,
        &SectionHeader {
            name: 7,
            shtype: SHT_RISCV_ATTRIBUTES,
            flags: 0,
            addr: 0,
            offset: attrs_off,
            size: RISCV_ATTRIBUTES.len() as u32,
            align: 1,
        },
    );
    push_section_header(
        &mut out,
        &SectionHeader {
            name: 25,
            shtype: SHT_STRTAB,
            flags: 0,
            addr: 0,
            offset: strtab_off,
            size: SHSTRTAB.len() as u32,
            align: 1,
        },
    );

    out
}

/// Wraps encoded code into a complete ELF image.
pub fn elf_image(code: &[u8]) -> Vec<u8> {
    let mut out = header(code.len());
    out.extend_from_slice(code);
    out.extend_from_slice(&tail(code.len()));
    out
}

/// Writes the image to a file.
pub fn write_elf(path: &Path, code: &[u8]) -> BasilResult<()> {
    let image = elf_image(code);
    let mut file = std::fs::File::create(path).map_err(|e| {
        BasilError::file_open(path.display().to_string(), e)
    })?;
    file.write_all(&image)
        .map_err(|e| BasilError::FileWrite(e.to_string()))?;
    file.sync_all()
        .map_err(|e| BasilError::FileClose(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32at(buf: &[u8], off: usize) -> u32 {
        u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
    }

    #[test]
    fn test_header_fields() {
        let image = elf_image(&[0u8; 8]);
        assert_eq!(&image[..4], b"\x7fELF");
        assert_eq!(image[4], 1); // 32-bit
        assert_eq!(image[5], 1); // little endian
        assert_eq!(u16::from_le_bytes([image[16], image[17]]), 2); // ET_EXEC
        assert_eq!(u16::from_le_bytes([image[18], image[19]]), 0xf3); // EM_RISCV
        assert_eq!(u32at(&image, 24), TEXT_VADDR); // e_entry
    }

    #[test]
    fn test_code_lands_at_text_offset() {
        let code = [0x13, 0x00, 0x00, 0x00];
        let image = elf_image(&code);
        assert_eq!(&image[CODE_OFFSET as usize..CODE_OFFSET as usize + 4], &code);
    }

    #[test]
    fn test_section_headers_are_4_aligned() {
        for len in [0usize, 4, 8, 12, 16] {
            let image = elf_image(&vec![0u8; len]);
            let shoff = u32at(&image, 32) as usize;
            assert_eq!(shoff % 4, 0, "code len {len}");
            // four headers of 40 bytes close the file
            assert_eq!(image.len(), shoff + 4 * 40, "code len {len}");
        }
    }

    #[test]
    fn test_shstrtab_contents() {
        let image = elf_image(&[0u8; 4]);
        let strtab_off = CODE_OFFSET as usize + 4 + RISCV_ATTRIBUTES.len();
        assert_eq!(
            &image[strtab_off..strtab_off + SHSTRTAB.len()],
            b"\0.text\0.riscv.attributes\0.shstrtab\0"
        );
    }

    #[test]
    fn test_attributes_declare_rv32im() {
        let image = elf_image(&[0u8; 4]);
        let attrs_off = CODE_OFFSET as usize + 4;
        let attrs = &image[attrs_off..attrs_off + RISCV_ATTRIBUTES.len()];
        assert_eq!(attrs[0], 0x41);
        let text = std::str::from_utf8(&attrs[17..30]).unwrap();
        assert_eq!(text, "rv32i2p0_m2p0");
    }

    #[test]
    fn test_text_section_header_describes_code() {
        let code = vec![0u8; 12];
        let image = elf_image(&code);
        let shoff = u32at(&image, 32) as usize;
        let text = shoff + 40;
        assert_eq!(u32at(&image, text + 4), SHT_PROGBITS);
        assert_eq!(u32at(&image, text + 12), TEXT_VADDR);
        assert_eq!(u32at(&image, text + 16), CODE_OFFSET);
        assert_eq!(u32at(&image, text + 20), code.len() as u32);
    }
}
