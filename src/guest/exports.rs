//! Entry point binding

use super::abi::{EntryPoint, FuncIndex, FuncType};
use super::module::ModuleInfo;
use tracing::{debug, warn};

/// Signature-checked entry points of one guest module
///
/// A slot is bound only if the module exports a function under the entry
/// point's name with exactly the expected signature.
#[derive(Debug, Clone, Default)]
pub struct EntryPoints {
    slots: [Option<FuncIndex>; EntryPoint::COUNT],
}

impl EntryPoints {
    pub fn bind(module: &ModuleInfo) -> Self {
        let mut entry_points = Self::default();

        for ep in EntryPoint::ALL {
            let Some((index, ty)) = module.exported_function(ep.name()) else {
                continue;
            };

            if ty.matches(ep.params(), ep.results()) {
                debug!(export = ep.name(), index = index.0, "bound entry point");
                entry_points.slots[ep.index()] = Some(index);
            } else {
                warn!(
                    export = ep.name(),
                    expected = %FuncType::new(ep.params(), ep.results()),
                    found = %ty,
                    "type mismatch for entry point"
                );
            }
        }

        entry_points
    }

    pub fn get(&self, ep: EntryPoint) -> Option<FuncIndex> {
        self.slots[ep.index()]
    }

    pub fn is_bound(&self, ep: EntryPoint) -> bool {
        self.get(ep).is_some()
    }

    pub fn bound_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::abi::ValType::*;
    use crate::guest::module::test_support::WasmBuilder;

    #[test]
    fn test_binds_matching_exports() {
        let mut builder = WasmBuilder::new();
        let init = builder.entry("on_init", &[]);
        let down = builder.entry("on_mouse_down", &[I32]);
        let entry_points = EntryPoints::bind(&ModuleInfo::parse(&builder.build()).unwrap());

        assert_eq!(entry_points.get(EntryPoint::OnInit), Some(FuncIndex(init)));
        assert_eq!(entry_points.get(EntryPoint::OnMouseDown), Some(FuncIndex(down)));
        assert!(!entry_points.is_bound(EntryPoint::OnTerminate));
        assert_eq!(entry_points.bound_count(), 2);
    }

    #[test]
    fn test_mismatched_signature_stays_unbound() {
        let mut builder = WasmBuilder::new();
        builder.entry("on_mouse_down", &[I64]);
        builder.entry("on_resize", &[I32, I32]);
        let on_key = builder.function(&[I32, I32], &[I32]);
        builder.export_function("on_key_down", on_key);
        let entry_points = EntryPoints::bind(&ModuleInfo::parse(&builder.build()).unwrap());

        assert!(!entry_points.is_bound(EntryPoint::OnMouseDown));
        assert!(!entry_points.is_bound(EntryPoint::OnKeyDown));
        assert!(entry_points.is_bound(EntryPoint::OnResize));
    }

    #[test]
    fn test_global_export_is_not_a_function() {
        let mut builder = WasmBuilder::new();
        builder.export_i32_global("on_init", 0);
        let entry_points = EntryPoints::bind(&ModuleInfo::parse(&builder.build()).unwrap());
        assert_eq!(entry_points.bound_count(), 0);
    }
}
