//! Object-file serialization.
//!
//! An [`ObjectFile`] is the self-contained binary form of a compiled
//! module: target triple, entrypoint symbol, per-function code with
//! relocation records, and the rodata blob. Reloading it through
//! [`crate::executable::Executable::load_from_obj_file`] re-links against a
//! fresh symbol map, so the blob is position- and process-independent.
//!
//! ```text
//! ┌──────────────────────────┐
//! │ magic  b"KILNOBJ\0"      │
//! │ version u32              │
//! │ checksum u32 (payload)   │
//! ├──────────────────────────┤
//! │ target triple            │
//! │ entrypoint symbol        │
//! │ functions[] code+relocs  │
//! │ rodata + rodata relocs   │
//! └──────────────────────────┘
//! ```

use crate::codegen::backend::{
    CompiledFunction, CompiledModule, RelocKind, RelocTarget, Relocation, RodataReloc,
};
use crate::error::{Error, Result};

const MAGIC: [u8; 8] = *b"KILNOBJ\0";
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 16;

/// A serialized compiled module.
#[derive(Debug, Clone)]
pub struct ObjectFile {
    data: Vec<u8>,
}

impl ObjectFile {
    /// Wrap raw bytes (validated on decode).
    pub fn from_bytes(data: Vec<u8>) -> Self {
        ObjectFile { data }
    }

    /// The raw serialized bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size of the blob in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Serialize a compiled module and its entrypoint symbol.
    pub(crate) fn encode(module: &CompiledModule, entrypoint: &str) -> ObjectFile {
        let mut payload = Writer::default();
        payload.str_(&module.target_triple);
        payload.str_(entrypoint);

        payload.u32(module.functions.len() as u32);
        for function in &module.functions {
            payload.str_(&function.name);
            payload.u64(function.code.len() as u64);
            payload.bytes(&function.code);
            payload.u32(function.relocs.len() as u32);
            for reloc in &function.relocs {
                payload.u64(reloc.offset);
                payload.u8(match reloc.kind {
                    RelocKind::Abs8 => 0,
                });
                match &reloc.target {
                    RelocTarget::Rodata => payload.u8(0),
                    RelocTarget::Symbol(name) => {
                        payload.u8(1);
                        payload.str_(name);
                    }
                }
                payload.u64(reloc.addend as u64);
            }
        }

        payload.u64(module.rodata.len() as u64);
        payload.bytes(&module.rodata);
        payload.u32(module.rodata_relocs.len() as u32);
        for reloc in &module.rodata_relocs {
            payload.u64(reloc.at);
            payload.u64(reloc.to);
        }

        let payload = payload.buf;
        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len());
        data.extend_from_slice(&MAGIC);
        data.extend_from_slice(&VERSION.to_le_bytes());
        data.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        data.extend_from_slice(&payload);
        ObjectFile { data }
    }

    /// Deserialize into a compiled module and its entrypoint symbol.
    pub(crate) fn decode(&self) -> Result<(CompiledModule, String)> {
        if self.data.len() < HEADER_SIZE || self.data[..8] != MAGIC {
            return Err(Error::Compilation("not a kiln object file".into()));
        }
        let version = u32::from_le_bytes(self.data[8..12].try_into().unwrap());
        if version != VERSION {
            return Err(Error::Compilation(format!(
                "unsupported object file version {}",
                version
            )));
        }
        let checksum = u32::from_le_bytes(self.data[12..16].try_into().unwrap());
        let payload = &self.data[HEADER_SIZE..];
        if crc32fast::hash(payload) != checksum {
            return Err(Error::Compilation("object file checksum mismatch".into()));
        }

        let mut reader = Reader { buf: payload, pos: 0 };
        let target_triple = reader.str_()?;
        let entrypoint = reader.str_()?;

        let num_functions = reader.u32()? as usize;
        let mut functions = Vec::with_capacity(num_functions);
        for _ in 0..num_functions {
            let name = reader.str_()?;
            let code_len = reader.u64()? as usize;
            let code = reader.bytes(code_len)?.to_vec();
            let num_relocs = reader.u32()? as usize;
            let mut relocs = Vec::with_capacity(num_relocs);
            for _ in 0..num_relocs {
                let offset = reader.u64()?;
                let kind = match reader.u8()? {
                    0 => RelocKind::Abs8,
                    other => {
                        return Err(Error::Compilation(format!(
                            "unknown relocation kind {}",
                            other
                        )))
                    }
                };
                let target = match reader.u8()? {
                    0 => RelocTarget::Rodata,
                    1 => RelocTarget::Symbol(reader.str_()?),
                    other => {
                        return Err(Error::Compilation(format!(
                            "unknown relocation target {}",
                            other
                        )))
                    }
                };
                let addend = reader.u64()? as i64;
                relocs.push(Relocation { offset, kind, target, addend });
            }
            functions.push(CompiledFunction { name, code, relocs });
        }

        let rodata_len = reader.u64()? as usize;
        let rodata = reader.bytes(rodata_len)?.to_vec();
        let num_rodata_relocs = reader.u32()? as usize;
        let mut rodata_relocs = Vec::with_capacity(num_rodata_relocs);
        for _ in 0..num_rodata_relocs {
            let at = reader.u64()?;
            let to = reader.u64()?;
            rodata_relocs.push(RodataReloc { at, to });
        }

        Ok((
            CompiledModule {
                target_triple,
                functions,
                rodata,
                rodata_relocs,
            },
            entrypoint,
        ))
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
    fn str_(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.bytes(s.as_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(Error::Compilation("truncated object file".into())),
        }
    }
    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }
    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }
    fn str_(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        String::from_utf8(self.bytes(len)?.to_vec())
            .map_err(|_| Error::Compilation("invalid string in object file".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_module() -> CompiledModule {
        CompiledModule {
            target_triple: "x86_64-unknown-linux-gnu".into(),
            functions: vec![CompiledFunction {
                name: "compute".into(),
                code: vec![0x90, 0x90, 0xC3],
                relocs: vec![
                    Relocation {
                        offset: 1,
                        kind: RelocKind::Abs8,
                        target: RelocTarget::Rodata,
                        addend: 24,
                    },
                    Relocation {
                        offset: 9,
                        kind: RelocKind::Abs8,
                        target: RelocTarget::Symbol("kiln_rt_custom_call".into()),
                        addend: 0,
                    },
                ],
            }],
            rodata: b"my.intrinsic\0".to_vec(),
            rodata_relocs: vec![RodataReloc { at: 16, to: 0 }],
        }
    }

    #[test]
    fn test_roundtrip() {
        let obj = ObjectFile::encode(&sample_module(), "compute");
        let (module, entrypoint) = obj.decode().unwrap();
        assert_eq!(entrypoint, "compute");
        assert_eq!(module.target_triple, "x86_64-unknown-linux-gnu");
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.functions[0].code, vec![0x90, 0x90, 0xC3]);
        assert_eq!(module.functions[0].relocs.len(), 2);
        assert_eq!(
            module.functions[0].relocs[1].target,
            RelocTarget::Symbol("kiln_rt_custom_call".into())
        );
        assert_eq!(module.rodata, b"my.intrinsic\0");
        assert_eq!(module.rodata_relocs[0].to, 0);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let obj = ObjectFile::encode(&sample_module(), "compute");
        let mut bytes = obj.data().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let corrupted = ObjectFile::from_bytes(bytes);
        assert!(corrupted.decode().is_err());
    }

    #[test]
    fn test_rejects_foreign_blob() {
        let obj = ObjectFile::from_bytes(b"definitely not an object file".to_vec());
        assert!(obj.decode().is_err());
    }
}
