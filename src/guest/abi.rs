//! Guest ABI types and constants
//!
//! This module defines the stable interface between the runtime and guest
//! modules: value types, the entry points a guest may export, and the names
//! it imports host functions under.

use std::fmt;

/// Import module namespace for host functions
pub const IMPORT_MODULE: &str = "env";

/// Exported `i32` global holding the guest address of the raw event slot
pub const RAW_EVENT_SLOT_GLOBAL: &str = "raw_event_slot";

/// WebAssembly value types the host ABI uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

impl ValType {
    /// Decode a binary-format value type byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x7F => Some(ValType::I32),
            0x7E => Some(ValType::I64),
            0x7D => Some(ValType::F32),
            0x7C => Some(ValType::F64),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            ValType::I32 => 0x7F,
            ValType::I64 => 0x7E,
            ValType::F32 => 0x7D,
            ValType::F64 => 0x7C,
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
        })
    }
}

/// A runtime value crossing the guest boundary
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    pub fn ty(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            Value::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Value::F32(v) => Some(v),
            _ => None,
        }
    }
}

/// Index into a module's function index space (imports first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncIndex(pub u32);

/// A function signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncType {
    pub fn new(params: &[ValType], results: &[ValType]) -> Self {
        Self {
            params: params.to_vec(),
            results: results.to_vec(),
        }
    }

    pub fn matches(&self, params: &[ValType], results: &[ValType]) -> bool {
        self.params == params && self.results == results
    }
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, types: &[ValType]) -> fmt::Result {
            f.write_str("(")?;
            for (i, ty) in types.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{ty}")?;
            }
            f.write_str(")")
        }
        list(f, &self.params)?;
        f.write_str(" -> ")?;
        list(f, &self.results)
    }
}

/// Functions a guest may export for the runtime to call
///
/// Every entry point is optional. One whose exported signature does not
/// match is left unbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    OnInit,
    OnMouseDown,
    OnMouseUp,
    OnMouseEnter,
    OnMouseLeave,
    OnMouseMove,
    OnMouseWheel,
    OnKeyDown,
    OnKeyUp,
    OnFrameRefresh,
    OnResize,
    OnRawEvent,
    OnTerminate,
}

impl EntryPoint {
    pub const COUNT: usize = 13;

    pub const ALL: [EntryPoint; Self::COUNT] = [
        EntryPoint::OnInit,
        EntryPoint::OnMouseDown,
        EntryPoint::OnMouseUp,
        EntryPoint::OnMouseEnter,
        EntryPoint::OnMouseLeave,
        EntryPoint::OnMouseMove,
        EntryPoint::OnMouseWheel,
        EntryPoint::OnKeyDown,
        EntryPoint::OnKeyUp,
        EntryPoint::OnFrameRefresh,
        EntryPoint::OnResize,
        EntryPoint::OnRawEvent,
        EntryPoint::OnTerminate,
    ];

    /// Export name
    pub fn name(self) -> &'static str {
        match self {
            EntryPoint::OnInit => "on_init",
            EntryPoint::OnMouseDown => "on_mouse_down",
            EntryPoint::OnMouseUp => "on_mouse_up",
            EntryPoint::OnMouseEnter => "on_mouse_enter",
            EntryPoint::OnMouseLeave => "on_mouse_leave",
            EntryPoint::OnMouseMove => "on_mouse_move",
            EntryPoint::OnMouseWheel => "on_mouse_wheel",
            EntryPoint::OnKeyDown => "on_key_down",
            EntryPoint::OnKeyUp => "on_key_up",
            EntryPoint::OnFrameRefresh => "on_frame_refresh",
            EntryPoint::OnResize => "on_resize",
            EntryPoint::OnRawEvent => "on_raw_event",
            EntryPoint::OnTerminate => "on_terminate",
        }
    }

    /// Required parameter types; no entry point returns a value
    pub fn params(self) -> &'static [ValType] {
        use ValType::*;
        match self {
            EntryPoint::OnInit
            | EntryPoint::OnMouseEnter
            | EntryPoint::OnMouseLeave
            | EntryPoint::OnFrameRefresh
            | EntryPoint::OnTerminate => &[],
            EntryPoint::OnMouseDown | EntryPoint::OnMouseUp => &[I32],
            EntryPoint::OnMouseMove => &[F32, F32, F32, F32],
            EntryPoint::OnMouseWheel => &[F32, F32],
            EntryPoint::OnKeyDown | EntryPoint::OnKeyUp => &[I32, I32],
            EntryPoint::OnResize => &[I32, I32],
            EntryPoint::OnRawEvent => &[I32],
        }
    }

    pub fn results(self) -> &'static [ValType] {
        &[]
    }

    pub fn index(self) -> usize {
        self as usize
    }
}
