// kernel/src/user/image.rs
//
// ProgramImage: (va, bytes, memsz) のセグメント列から ELF32（i386, ET_EXEC）を組み立てる。
// hosted machine にはリンカが無いので、テストと sim バイナリはこれで env の中身を作る。
//
// 出力の形:
// - ELF ヘッダ（52 byte）
// - プログラムヘッダ（32 byte × セグメント数）
// - 各セグメントのファイル上の中身を順に並べる
// セクションヘッダは持たない。

use alloc::vec::Vec;

use crate::mem::layout::UTEXT;

const EHDR_SIZE: u32 = 52;
const PHDR_SIZE: u32 = 32;

const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

#[derive(Clone, Debug)]
struct Segment {
    vaddr: u32,
    data: Vec<u8>,
    memsz: u32,
    writable: bool,
}

#[derive(Clone, Debug)]
pub struct ProgramImage {
    entry: u32,
    segments: Vec<Segment>,
}

impl ProgramImage {
    pub fn new(entry: u32) -> Self {
        ProgramImage {
            entry,
            segments: Vec::new(),
        }
    }

    /// UTEXT に数バイトの text を置いただけの最小イメージ
    pub fn minimal() -> Self {
        ProgramImage::new(UTEXT + 0x20).text(UTEXT, &[0x90; 64])
    }

    /// 読み取り + 実行のセグメント
    pub fn text(mut self, vaddr: u32, data: &[u8]) -> Self {
        self.segments.push(Segment {
            vaddr,
            data: data.to_vec(),
            memsz: data.len() as u32,
            writable: false,
        });
        self
    }

    /// 書き込み可能なセグメント。memsz が data より長ければ残りは 0（bss）。
    pub fn data(mut self, vaddr: u32, data: &[u8], memsz: u32) -> Self {
        self.segments.push(Segment {
            vaddr,
            data: data.to_vec(),
            memsz: memsz.max(data.len() as u32),
            writable: true,
        });
        self
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn build(&self) -> Vec<u8> {
        let phnum = self.segments.len() as u32;
        let mut out = Vec::new();

        // e_ident
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
        out.extend_from_slice(&[0u8; 8]);
        put16(&mut out, ET_EXEC);
        put16(&mut out, EM_386);
        put32(&mut out, 1); // e_version
        put32(&mut out, self.entry);
        put32(&mut out, EHDR_SIZE); // e_phoff
        put32(&mut out, 0); // e_shoff
        put32(&mut out, 0); // e_flags
        put16(&mut out, EHDR_SIZE as u16);
        put16(&mut out, PHDR_SIZE as u16);
        put16(&mut out, phnum as u16);
        put16(&mut out, 40); // e_shentsize
        put16(&mut out, 0); // e_shnum
        put16(&mut out, 0); // e_shstrndx

        let mut offset = EHDR_SIZE + PHDR_SIZE * phnum;
        for seg in &self.segments {
            let flags = if seg.writable { PF_R | PF_W } else { PF_R | PF_X };
            put32(&mut out, PT_LOAD);
            put32(&mut out, offset);
            put32(&mut out, seg.vaddr);
            put32(&mut out, seg.vaddr); // p_paddr
            put32(&mut out, seg.data.len() as u32);
            put32(&mut out, seg.memsz);
            put32(&mut out, flags);
            put32(&mut out, 0x1000);
            offset += seg.data.len() as u32;
        }

        for seg in &self.segments {
            out.extend_from_slice(&seg.data);
        }
        out
    }
}

fn put16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
