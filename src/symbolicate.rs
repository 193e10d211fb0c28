// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use crate::modules::ModuleMap;
use crate::sample::StackFrame;
use crate::unwind::RawUnwindState;

/// Resolves raw addresses to `{module path, load base, symbol address}`
/// against one [`ModuleMap`] snapshot.
///
/// Resolution fails per frame and silently: an address outside every known
/// module (JIT code, a module loaded after the snapshot) keeps only its
/// address, and an address past the module's known symbols keeps only its
/// module.
#[derive(Clone, Copy)]
pub struct Symbolicator<'a> {
    modules: &'a ModuleMap,
}

impl<'a> Symbolicator<'a> {
    pub fn new(modules: &'a ModuleMap) -> Self {
        Symbolicator { modules }
    }

    /// Resolves one address. Never allocates: the module path is shared
    /// with the snapshot.
    pub fn resolve(&self, address: usize) -> StackFrame {
        match self.modules.find(address) {
            Some(module) => StackFrame {
                address,
                module_path: Some(module.path().clone()),
                module_base: Some(module.base()),
                symbol_address: module.symbols().nearest(address),
            },
            None => StackFrame::unresolved(address),
        }
    }

    /// Writes one frame per address into `out`, in order, and returns how
    /// many were written (`addrs.len()` whenever `out` is large enough).
    /// The frames previously in `out` are dropped.
    pub fn symbolicate_into(&self, addrs: &[usize], out: &mut [StackFrame]) -> usize {
        let mut written = 0;
        for (slot, addr) in out.iter_mut().zip(addrs) {
            *slot = self.resolve(*addr);
            written += 1;
        }

        written
    }

    /// One frame per captured address, same order, same count.
    pub fn symbolicate(&self, raw: &RawUnwindState) -> Vec<StackFrame> {
        raw.addresses()
            .iter()
            .map(|addr| self.resolve(*addr))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{Module, SymbolTable};
    use std::path::Path;

    fn modules() -> ModuleMap {
        ModuleMap::new(
            vec![Module::new(
                "/data/app/lib/arm64/libapp.so",
                0x4000_0000,
                0x4000_0000..0x4001_0000,
                vec![0x4000_1000..0x4000_9000],
                SymbolTable::new(vec![
                    (0x4000_1000, 0x200, Some("app_main")),
                    (0x4000_2000, 0x100, Some("app_loop")),
                ]),
            )],
            vec![0x5000_0000..0x5001_0000],
        )
    }

    #[test]
    fn resolves_module_and_symbol() {
        let map = modules();
        let frame = Symbolicator::new(&map).resolve(0x4000_2040);

        assert_eq!(frame.address, 0x4000_2040);
        assert_eq!(
            frame.module_path.as_deref(),
            Some(Path::new("/data/app/lib/arm64/libapp.so"))
        );
        assert_eq!(frame.module_base, Some(0x4000_0000));
        assert_eq!(frame.symbol_address, Some(0x4000_2000));
        assert_eq!(frame.symbol_offset(), Some(0x40));
    }

    #[test]
    fn past_last_symbol_keeps_module() {
        let map = modules();
        let frame = Symbolicator::new(&map).resolve(0x4000_8000);

        assert!(frame.module_path.is_some());
        assert_eq!(frame.module_base, Some(0x4000_0000));
        assert_eq!(frame.symbol_address, None);
        assert_eq!(frame.symbol_offset(), None);
    }

    #[test]
    fn jit_code_is_address_only() {
        let map = modules();
        let frame = Symbolicator::new(&map).resolve(0x5000_0100);

        assert_eq!(frame, StackFrame::unresolved(0x5000_0100));
    }

    #[test]
    fn output_matches_input() {
        let map = modules();
        let symbolicator = Symbolicator::new(&map);

        assert!(symbolicator.symbolicate(&RawUnwindState::new()).is_empty());

        let addrs = [0x4000_1010, 0x10, 0x4000_8000, usize::MAX, 0x4000_2000];
        let frames = symbolicator.symbolicate(&RawUnwindState::from_addresses(&addrs));
        assert_eq!(frames.len(), addrs.len());
        for (frame, addr) in frames.iter().zip(addrs) {
            assert_eq!(frame.address, addr);
            if let Some(symbol) = frame.symbol_address {
                assert!(symbol <= addr);
            }
        }
        assert_eq!(frames[0].symbol_address, Some(0x4000_1000));
        assert_eq!(frames[1], StackFrame::unresolved(0x10));
        assert_eq!(frames[4].symbol_offset(), Some(0));
    }

    #[test]
    fn symbolicate_into_slots() {
        let map = modules();
        let symbolicator = Symbolicator::new(&map);
        let addrs = [0x4000_1010, 0x10, 0x4000_2000];

        let mut out = vec![StackFrame::default(); 2];
        assert_eq!(symbolicator.symbolicate_into(&addrs, &mut out), 2);
        assert_eq!(out[0].symbol_address, Some(0x4000_1000));

        let mut out = vec![StackFrame::default(); 8];
        assert_eq!(symbolicator.symbolicate_into(&addrs, &mut out), 3);
        assert_eq!(out[2], symbolicator.resolve(0x4000_2000));
        assert_eq!(out[3], StackFrame::default());
    }
}
