//! Guest module inspection
//!
//! Reads just enough of a WebAssembly binary to link and bind it: the type,
//! import, function, global and export sections. Code bodies are left to the
//! interpreter.

use super::abi::{FuncIndex, FuncType, ValType};
use crate::error::LoadError;

/// WASM magic number: \0asm
const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];

/// WASM version 1
const WASM_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

mod section {
    pub const TYPE: u8 = 1;
    pub const IMPORT: u8 = 2;
    pub const FUNCTION: u8 = 3;
    pub const GLOBAL: u8 = 6;
    pub const EXPORT: u8 = 7;
}

mod kind {
    pub const FUNCTION: u8 = 0;
    pub const TABLE: u8 = 1;
    pub const MEMORY: u8 = 2;
    pub const GLOBAL: u8 = 3;
}

/// A function the module imports
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionImport {
    pub module: String,
    pub name: String,
    pub ty: FuncType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Function(FuncIndex),
    Table(u32),
    Memory(u32),
    Global(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
}

/// Constant initializer of a global
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GlobalInit {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// Copy of another (imported) global
    Global(u32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalInfo {
    pub ty: ValType,
    pub mutable: bool,
    pub init: GlobalInit,
}

/// Link-relevant view of a module
#[derive(Debug, Default)]
pub struct ModuleInfo {
    types: Vec<FuncType>,
    imports: Vec<FunctionImport>,
    imported_globals: u32,
    /// Type index of each defined function
    functions: Vec<u32>,
    globals: Vec<GlobalInfo>,
    exports: Vec<Export>,
}

impl ModuleInfo {
    /// Validate the header and decode the sections the runtime needs
    pub fn parse(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.len() < 8 {
            return Err(LoadError::invalid("module too small"));
        }
        if bytes[0..4] != WASM_MAGIC {
            return Err(LoadError::invalid("invalid magic number"));
        }
        if bytes[4..8] != WASM_VERSION {
            return Err(LoadError::invalid("unsupported WASM version"));
        }

        let mut info = ModuleInfo::default();
        let mut reader = Reader::new(&bytes[8..]);

        while !reader.is_empty() {
            let id = reader.u8()?;
            let size = reader.u32()? as usize;
            let mut body = Reader::new(reader.bytes(size)?);

            match id {
                section::TYPE => info.parse_types(&mut body)?,
                section::IMPORT => info.parse_imports(&mut body)?,
                section::FUNCTION => info.parse_functions(&mut body)?,
                section::GLOBAL => info.parse_globals(&mut body)?,
                section::EXPORT => info.parse_exports(&mut body)?,
                _ => {}
            }
        }

        info.check_exports()?;
        Ok(info)
    }

    fn parse_types(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        for _ in 0..r.u32()? {
            if r.u8()? != 0x60 {
                return Err(LoadError::invalid("expected function type"));
            }
            let params = r.val_types()?;
            let results = r.val_types()?;
            self.types.push(FuncType { params, results });
        }
        Ok(())
    }

    fn parse_imports(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        for _ in 0..r.u32()? {
            let module = r.name()?;
            let name = r.name()?;
            match r.u8()? {
                kind::FUNCTION => {
                    let ty = self.func_type(r.u32()?)?.clone();
                    self.imports.push(FunctionImport { module, name, ty });
                }
                kind::TABLE => {
                    r.u8()?;
                    r.limits()?;
                }
                kind::MEMORY => r.limits()?,
                kind::GLOBAL => {
                    r.val_type()?;
                    r.u8()?;
                    self.imported_globals += 1;
                }
                other => {
                    return Err(LoadError::invalid(format!("unknown import kind {other}")));
                }
            }
        }
        Ok(())
    }

    fn parse_functions(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        for _ in 0..r.u32()? {
            let ty = r.u32()?;
            self.func_type(ty)?;
            self.functions.push(ty);
        }
        Ok(())
    }

    fn parse_globals(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        for _ in 0..r.u32()? {
            let ty = r.val_type()?;
            let mutable = r.u8()? != 0;
            let init = r.const_expr()?;
            self.globals.push(GlobalInfo { ty, mutable, init });
        }
        Ok(())
    }

    fn parse_exports(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        for _ in 0..r.u32()? {
            let name = r.name()?;
            let tag = r.u8()?;
            let index = r.u32()?;
            let kind = match tag {
                kind::FUNCTION => ExportKind::Function(FuncIndex(index)),
                kind::TABLE => ExportKind::Table(index),
                kind::MEMORY => ExportKind::Memory(index),
                kind::GLOBAL => ExportKind::Global(index),
                other => {
                    return Err(LoadError::invalid(format!("unknown export kind {other}")));
                }
            };
            self.exports.push(Export { name, kind });
        }
        Ok(())
    }

    fn check_exports(&self) -> Result<(), LoadError> {
        for export in &self.exports {
            let in_range = match export.kind {
                ExportKind::Function(index) => self.function_type(index).is_some(),
                ExportKind::Global(index) => {
                    (index as usize) < self.imported_globals as usize + self.globals.len()
                }
                ExportKind::Table(_) | ExportKind::Memory(_) => true,
            };
            if !in_range {
                return Err(LoadError::invalid(format!(
                    "export `{}` refers to a missing item",
                    export.name
                )));
            }
        }
        Ok(())
    }

    fn func_type(&self, index: u32) -> Result<&FuncType, LoadError> {
        self.types
            .get(index as usize)
            .ok_or_else(|| LoadError::invalid(format!("type index {index} out of range")))
    }

    /// Signature of any function in the index space
    pub fn function_type(&self, index: FuncIndex) -> Option<&FuncType> {
        let index = index.0 as usize;
        match index.checked_sub(self.imports.len()) {
            None => self.imports.get(index).map(|import| &import.ty),
            Some(defined) => self
                .functions
                .get(defined)
                .and_then(|ty| self.types.get(*ty as usize)),
        }
    }

    pub fn function_imports(&self) -> &[FunctionImport] {
        &self.imports
    }

    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    fn export(&self, name: &str) -> Option<ExportKind> {
        self.exports.iter().find(|e| e.name == name).map(|e| e.kind)
    }

    /// An exported function and its signature
    pub fn exported_function(&self, name: &str) -> Option<(FuncIndex, &FuncType)> {
        match self.export(name)? {
            ExportKind::Function(index) => self.function_type(index).map(|ty| (index, ty)),
            _ => None,
        }
    }

    /// Initial value of an exported, module-defined `i32` global
    pub fn exported_i32_global(&self, name: &str) -> Option<i32> {
        let ExportKind::Global(index) = self.export(name)? else {
            return None;
        };
        let defined = index.checked_sub(self.imported_globals)?;
        match self.globals.get(defined as usize)? {
            GlobalInfo {
                ty: ValType::I32,
                init: GlobalInit::I32(value),
                ..
            } => Some(*value),
            _ => None,
        }
    }

    pub fn exports_memory(&self) -> bool {
        self.exports
            .iter()
            .any(|e| matches!(e.kind, ExportKind::Memory(_)))
    }
}

/// Cursor over a byte slice with LEB128 helpers
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn is_empty(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    fn u8(&mut self) -> Result<u8, LoadError> {
        let byte = *self
            .bytes
            .get(self.offset)
            .ok_or_else(|| LoadError::invalid("unexpected end of section"))?;
        self.offset += 1;
        Ok(byte)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], LoadError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| LoadError::invalid("section extends past end of module"))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    /// Unsigned LEB128, at most 5 bytes
    fn u32(&mut self) -> Result<u32, LoadError> {
        let mut result = 0u32;
        let mut shift = 0;

        for _ in 0..5 {
            let byte = self.u8()?;
            result |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }

        Err(LoadError::invalid("invalid LEB128"))
    }

    /// Signed LEB128 of up to `bits` bits
    fn signed(&mut self, bits: u32) -> Result<i64, LoadError> {
        let mut result = 0i64;
        let mut shift = 0;

        for _ in 0..bits.div_ceil(7) {
            let byte = self.u8()?;
            result |= ((byte & 0x7F) as i64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }

        Err(LoadError::invalid("invalid signed LEB128"))
    }

    fn name(&mut self) -> Result<String, LoadError> {
        let len = self.u32()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| LoadError::invalid("name is not UTF-8"))
    }

    fn val_type(&mut self) -> Result<ValType, LoadError> {
        let byte = self.u8()?;
        ValType::from_byte(byte)
            .ok_or_else(|| LoadError::invalid(format!("unsupported value type 0x{byte:02x}")))
    }

    fn val_types(&mut self) -> Result<Vec<ValType>, LoadError> {
        (0..self.u32()?).map(|_| self.val_type()).collect()
    }

    fn limits(&mut self) -> Result<(), LoadError> {
        let flags = self.u8()?;
        self.u32()?;
        if flags & 1 != 0 {
            self.u32()?;
        }
        Ok(())
    }

    fn const_expr(&mut self) -> Result<GlobalInit, LoadError> {
        let init = match self.u8()? {
            0x41 => GlobalInit::I32(self.signed(32)? as i32),
            0x42 => GlobalInit::I64(self.signed(64)?),
            0x43 => {
                let raw = self.bytes(4)?;
                GlobalInit::F32(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            }
            0x44 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(self.bytes(8)?);
                GlobalInit::F64(f64::from_le_bytes(raw))
            }
            0x23 => GlobalInit::Global(self.u32()?),
            op => {
                return Err(LoadError::invalid(format!(
                    "unsupported constant expression opcode 0x{op:02x}"
                )));
            }
        };
        if self.u8()? != 0x0B {
            return Err(LoadError::invalid("constant expression not terminated"));
        }
        Ok(init)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::WasmBuilder;
    use super::*;
    use ValType::*;

    #[test]
    fn test_rejects_bad_header() {
        assert!(ModuleInfo::parse(&[0x00, 0x61]).is_err());
        assert!(ModuleInfo::parse(&[0xFF, 0x61, 0x73, 0x6D, 1, 0, 0, 0]).is_err());
        assert!(ModuleInfo::parse(&[0x00, 0x61, 0x73, 0x6D, 2, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_empty_module() {
        let info = ModuleInfo::parse(&[0x00, 0x61, 0x73, 0x6D, 1, 0, 0, 0]).unwrap();
        assert!(info.function_imports().is_empty());
        assert!(info.exports().is_empty());
    }

    #[test]
    fn test_truncated_section() {
        let mut bytes = WasmBuilder::new().build();
        bytes.push(7);
        bytes.push(10);
        bytes.push(0);
        let err = ModuleInfo::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("past end"));
    }

    #[test]
    fn test_imports_and_exports() {
        let mut builder = WasmBuilder::new();
        let log = builder.import("env", "log", &[I32, I32, I32, I32, I32], &[]);
        let on_init = builder.entry("on_init", &[]);
        let on_move = builder.entry("on_mouse_move", &[F32, F32, F32, F32]);
        let info = ModuleInfo::parse(&builder.build()).unwrap();

        assert_eq!(log, 0);
        assert_eq!(info.function_imports().len(), 1);
        assert_eq!(info.function_imports()[0].name, "log");
        assert_eq!(info.function_imports()[0].ty.params.len(), 5);

        let (index, ty) = info.exported_function("on_init").unwrap();
        assert_eq!(index, FuncIndex(on_init));
        assert!(ty.matches(&[], &[]));

        let (index, ty) = info.exported_function("on_mouse_move").unwrap();
        assert_eq!(index, FuncIndex(on_move));
        assert_eq!(ty.params, vec![F32, F32, F32, F32]);

        assert!(info.exported_function("missing").is_none());
    }

    #[test]
    fn test_exported_i32_global() {
        let mut builder = WasmBuilder::new();
        builder.export_i32_global("raw_event_slot", 4096);
        builder.export_i32_global("negative", -70000);
        let info = ModuleInfo::parse(&builder.build()).unwrap();

        assert_eq!(info.exported_i32_global("raw_event_slot"), Some(4096));
        assert_eq!(info.exported_i32_global("negative"), Some(-70000));
        assert_eq!(info.exported_i32_global("nope"), None);
        assert!(info.exported_function("raw_event_slot").is_none());
    }

    #[test]
    fn test_export_out_of_range() {
        let mut builder = WasmBuilder::new();
        builder.export_function("on_init", 5);
        assert!(ModuleInfo::parse(&builder.build()).is_err());
    }
}
