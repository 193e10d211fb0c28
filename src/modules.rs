// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::{
    io::BufRead,
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
};

use arc_swap::{ArcSwap, Guard};
use findshlibs::{Segment, SharedLibrary, TargetSharedLibrary};
use memmap2::Mmap;
use object::{Object, ObjectSymbol, SymbolKind};
use once_cell::sync::Lazy;
use smallvec::SmallVec;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
struct SymbolEntry {
    address: usize,
    size: usize,
    name: Option<Box<str>>,
}

/// Function symbols of one module, keyed by their in-memory address.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    entries: Vec<SymbolEntry>,
}

impl SymbolTable {
    /// Builds a table from `(address, size, name)` triples. Aliases sharing
    /// an address collapse into the one with the largest size.
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = (usize, usize, Option<S>)>,
        S: Into<Box<str>>,
    {
        let mut entries: Vec<SymbolEntry> = symbols
            .into_iter()
            .map(|(address, size, name)| SymbolEntry {
                address,
                size,
                name: name.map(Into::into),
            })
            .collect();
        entries.sort_by(|a, b| a.address.cmp(&b.address).then(b.size.cmp(&a.size)));
        entries.dedup_by_key(|entry| entry.address);

        SymbolTable { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn covering(&self, addr: usize) -> Option<&SymbolEntry> {
        let index = self.entries.partition_point(|entry| entry.address <= addr);
        if index == 0 {
            return None;
        }

        let entry = &self.entries[index - 1];
        // unsized symbols run up to the next known symbol
        let end = if entry.size > 0 {
            entry.address.saturating_add(entry.size)
        } else {
            match self.entries.get(index) {
                Some(next) => next.address,
                None => entry.address.saturating_add(1),
            }
        };

        (addr < end).then_some(entry)
    }

    /// Address of the symbol that starts at or before `addr` and still
    /// covers it.
    pub fn nearest(&self, addr: usize) -> Option<usize> {
        self.covering(addr).map(|entry| entry.address)
    }

    fn name_of(&self, addr: usize) -> Option<&str> {
        self.covering(addr).and_then(|entry| entry.name.as_deref())
    }
}

/// A loaded executable image.
#[derive(Debug, Clone)]
pub struct Module {
    path: Arc<Path>,
    base: usize,
    range: Range<usize>,
    text: SmallVec<[Range<usize>; 4]>,
    symbols: SymbolTable,
}

impl Module {
    pub fn new<P, I>(path: P, base: usize, range: Range<usize>, text: I, symbols: SymbolTable) -> Self
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = Range<usize>>,
    {
        Module {
            path: Arc::from(path.as_ref()),
            base,
            range,
            text: text.into_iter().collect(),
            symbols,
        }
    }

    pub fn path(&self) -> &Arc<Path> {
        &self.path
    }

    /// Address the image was loaded at.
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn range(&self) -> &Range<usize> {
        &self.range
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.range.contains(&addr)
    }

    pub fn text(&self) -> &[Range<usize>] {
        &self.text
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }
}

/// One immutable view of the process's loaded modules and executable
/// mappings.
#[derive(Debug, Clone, Default)]
pub struct ModuleMap {
    modules: Vec<Module>,
    executable: Vec<Range<usize>>,
}

impl ModuleMap {
    /// `anonymous` lists executable mappings with no backing module, such as
    /// JIT code caches.
    pub fn new(mut modules: Vec<Module>, anonymous: Vec<Range<usize>>) -> Self {
        modules.sort_by_key(|module| module.range.start);

        let mut executable: Vec<Range<usize>> = modules
            .iter()
            .flat_map(|module| module.text.iter().cloned())
            .chain(anonymous)
            .filter(|range| !range.is_empty())
            .collect();
        executable.sort_by_key(|range| range.start);

        let mut merged: Vec<Range<usize>> = Vec::with_capacity(executable.len());
        for range in executable {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
                _ => merged.push(range),
            }
        }

        ModuleMap {
            modules,
            executable: merged,
        }
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// The module whose mapped range contains `addr`.
    pub fn find(&self, addr: usize) -> Option<&Module> {
        let index = self
            .modules
            .partition_point(|module| module.range.start <= addr);
        if index == 0 {
            return None;
        }

        let module = &self.modules[index - 1];
        module.contains(addr).then_some(module)
    }

    pub fn is_executable(&self, addr: usize) -> bool {
        let index = self
            .executable
            .partition_point(|range| range.start <= addr);
        index > 0 && self.executable[index - 1].contains(&addr)
    }

    /// Demangled name of the symbol covering `addr`. Allocates; meant for
    /// rendering samples after the fact.
    pub fn symbol_name(&self, addr: usize) -> Option<String> {
        let name = self.find(addr)?.symbols.name_of(addr)?;
        Some(symbolic_demangle::demangle(name).into_owned())
    }

    /// Snapshots the modules currently loaded in this process.
    pub fn from_process() -> Result<ModuleMap> {
        let mut modules = Vec::new();

        TargetSharedLibrary::each(|shlib| {
            if let Some(module) = load_module(shlib) {
                modules.push(module);
            }
        });

        let anonymous = exec_mappings()?;
        Ok(ModuleMap::new(modules, anonymous))
    }
}

fn module_path(shlib: &TargetSharedLibrary) -> PathBuf {
    let name = shlib.name();
    if name.is_empty() {
        // the main executable is reported without a name
        std::env::current_exe().unwrap_or_default()
    } else {
        PathBuf::from(name)
    }
}

fn load_module(shlib: &TargetSharedLibrary) -> Option<Module> {
    let path = module_path(shlib);
    let bias = shlib.virtual_memory_bias().0;

    let mut start = usize::MAX;
    let mut end = 0;
    let mut text = SmallVec::<[Range<usize>; 4]>::new();
    for segment in shlib.segments() {
        let avma = segment.actual_virtual_memory_address(shlib).0;
        let range = avma..avma.saturating_add(segment.len());
        start = start.min(range.start);
        end = end.max(range.end);
        if segment.is_code() {
            text.push(range);
        }
    }

    if start >= end {
        log::debug!("skipping module without segments: {}", path.display());
        return None;
    }

    let symbols = match load_symbols(&path, bias) {
        Ok(symbols) => symbols,
        Err(err) => {
            log::warn!("no symbols for {}: {}", path.display(), err);
            SymbolTable::default()
        }
    };

    Some(Module::new(
        path,
        shlib.actual_load_addr().0,
        start..end,
        text,
        symbols,
    ))
}

fn load_symbols(path: &Path, bias: usize) -> Result<SymbolTable> {
    let file = std::fs::File::open(path)?;
    let mmap = unsafe { Mmap::map(&file) }?;
    let object = object::File::parse(&*mmap).map_err(|source| Error::ObjectParse {
        path: path.display().to_string(),
        source,
    })?;

    let symbols = object
        .symbols()
        .chain(object.dynamic_symbols())
        .filter(|symbol| symbol.kind() == SymbolKind::Text && symbol.is_definition())
        .filter(|symbol| symbol.address() != 0)
        .map(|symbol| {
            let address = (symbol.address() as usize).wrapping_add(bias);
            let name = symbol.name().ok().filter(|name| !name.is_empty());
            (address, symbol.size() as usize, name)
        });

    Ok(SymbolTable::new(symbols))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn exec_mappings() -> Result<Vec<Range<usize>>> {
    let file = std::fs::File::open("/proc/self/maps")?;
    Ok(parse_exec_mappings(std::io::BufReader::new(file)))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn exec_mappings() -> Result<Vec<Range<usize>>> {
    Ok(Vec::new())
}

/// Collects executable ranges from `/proc/<pid>/maps` formatted text.
fn parse_exec_mappings<R: BufRead>(reader: R) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    for line in reader.lines() {
        let Ok(line) = line else { break };
        // The format of a maps line is:
        // <start>-<end> <perms> <offset> <dev> <inode> [<path>]
        let mut parts = line.split_whitespace();
        let (Some(span), Some(perms)) = (parts.next(), parts.next()) else {
            continue;
        };
        if !perms.contains('x') {
            continue;
        }
        let Some((start, end)) = span.split_once('-') else {
            continue;
        };
        if let (Ok(start), Ok(end)) = (
            usize::from_str_radix(start, 16),
            usize::from_str_radix(end, 16),
        ) {
            ranges.push(start..end);
        }
    }

    ranges
}

/// Holds the current [`ModuleMap`] and swaps it atomically when modules are
/// loaded or unloaded.
///
/// Readers never block: a sampling attempt loads one snapshot and keeps
/// using it even if a newer one is published meanwhile.
pub struct ModuleRegistry {
    current: ArcSwap<ModuleMap>,
}

impl ModuleRegistry {
    pub fn new(map: ModuleMap) -> Self {
        ModuleRegistry {
            current: ArcSwap::from_pointee(map),
        }
    }

    /// Lock-free load of the current snapshot.
    pub fn snapshot(&self) -> Guard<Arc<ModuleMap>> {
        self.current.load()
    }

    pub fn replace(&self, map: ModuleMap) {
        self.current.store(Arc::new(map));
    }

    /// Rebuilds the snapshot from the live process. Call it after `dlopen`
    /// or `dlclose`, never from a sampling context.
    pub fn refresh(&self) -> Result<()> {
        let map = ModuleMap::from_process()?;
        log::info!(
            "module registry refreshed: {} modules, {} executable ranges",
            map.modules.len(),
            map.executable.len()
        );
        self.replace(map);

        Ok(())
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        ModuleRegistry::new(ModuleMap::default())
    }
}

/// The process-wide registry, built from the live process on first use.
///
/// The first call allocates and reads files, so make it before any sampling
/// context can run.
pub fn registry() -> &'static ModuleRegistry {
    static REGISTRY: Lazy<ModuleRegistry> = Lazy::new(|| match ModuleMap::from_process() {
        Ok(map) => ModuleRegistry::new(map),
        Err(err) => {
            log::error!("failed to snapshot loaded modules: {}", err);
            ModuleRegistry::default()
        }
    });

    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    fn libfoo() -> Module {
        Module::new(
            "/data/app/lib/arm64/libfoo.so",
            0x7000_0000,
            0x7000_0000..0x7001_0000,
            vec![0x7000_1000..0x7000_8000],
            SymbolTable::new(vec![
                (0x7000_1000, 0x100, Some("foo_init")),
                (0x7000_2000, 0, Some("_ZN3foo3runEv")),
                (0x7000_3000, 0x80, Some("foo_tail")),
            ]),
        )
    }

    #[test]
    fn symbol_lookup() {
        let table = libfoo().symbols;

        assert_eq!(table.nearest(0x7000_0fff), None);
        assert_eq!(table.nearest(0x7000_1000), Some(0x7000_1000));
        assert_eq!(table.nearest(0x7000_10ff), Some(0x7000_1000));
        // gap after a sized symbol
        assert_eq!(table.nearest(0x7000_1100), None);
        // unsized symbols extend to the next one
        assert_eq!(table.nearest(0x7000_2fff), Some(0x7000_2000));
        assert_eq!(table.nearest(0x7000_3010), Some(0x7000_3000));
        // past the last symbol
        assert_eq!(table.nearest(0x7000_3080), None);
        assert_eq!(table.nearest(0x7000_7000), None);
    }

    #[test]
    fn aliases_keep_largest_size() {
        let table = SymbolTable::new(vec![
            (0x10, 0, Some("alias")),
            (0x10, 0x20, Some("real")),
        ]);

        assert_eq!(table.len(), 1);
        assert_eq!(table.nearest(0x2f), Some(0x10));
        assert_eq!(table.name_of(0x2f), Some("real"));
    }

    #[test]
    fn find_module() {
        let other = Module::new(
            "/system/lib64/libc.so",
            0x1000,
            0x1000..0x5000,
            vec![0x2000..0x4000],
            SymbolTable::default(),
        );
        let map = ModuleMap::new(vec![libfoo(), other], vec![]);

        assert_eq!(map.find(0x1000).unwrap().base(), 0x1000);
        assert_eq!(map.find(0x4fff).unwrap().base(), 0x1000);
        assert!(map.find(0x5000).is_none());
        assert!(map.find(0xfff).is_none());
        assert_eq!(
            &**map.find(0x7000_2000).unwrap().path(),
            Path::new("/data/app/lib/arm64/libfoo.so")
        );
        assert!(map.find(usize::MAX).is_none());
    }

    #[test]
    fn executable_ranges_merge() {
        let map = ModuleMap::new(
            vec![libfoo()],
            vec![0x9000..0xa000, 0x9800..0xb000, 0x7000_8000..0x7000_9000],
        );

        assert!(map.is_executable(0x9000));
        assert!(map.is_executable(0xafff));
        assert!(!map.is_executable(0xb000));
        assert!(map.is_executable(0x7000_8fff));
        assert!(map.is_executable(0x7000_1000));
        assert!(!map.is_executable(0x7000_0000));
        assert!(!map.is_executable(0));
    }

    #[test]
    fn demangled_names() {
        let map = ModuleMap::new(vec![libfoo()], vec![]);

        assert_eq!(map.symbol_name(0x7000_1004).as_deref(), Some("foo_init"));
        assert!(map.symbol_name(0x7000_2004).is_some());
        assert_eq!(map.symbol_name(0x7000_9000), None);
    }

    #[test]
    fn parse_maps() {
        let maps = "\
5581e2a00000-5581e2a02000 r--p 00000000 fd:01 1234 /usr/bin/app
5581e2a02000-5581e2a05000 r-xp 00002000 fd:01 1234 /usr/bin/app
7f0c40000000-7f0c40021000 rwxp 00000000 00:00 0
7ffd8e5f3000-7ffd8e5f5000 r-xp 00000000 00:00 0 [vdso]
garbage
";
        let ranges = parse_exec_mappings(maps.as_bytes());
        assert_eq!(
            ranges,
            vec![
                0x5581e2a02000..0x5581e2a05000,
                0x7f0c40000000..0x7f0c40021000,
                0x7ffd8e5f3000..0x7ffd8e5f5000,
            ]
        );
    }

    #[inline(never)]
    fn marker() -> usize {
        std::hint::black_box(3)
    }

    #[test]
    fn snapshot_current_process() {
        let map = ModuleMap::from_process().unwrap();
        assert!(!map.modules().is_empty());

        let addr = marker as fn() -> usize as usize;
        assert!(map.is_executable(addr));

        let module = map.find(addr).unwrap();
        assert!(module.base() <= addr);
        if let Some(symbol) = module.symbols().nearest(addr) {
            assert!(symbol <= addr);
        }
    }

    #[test]
    fn registry_swaps_snapshots() {
        let registry = ModuleRegistry::default();
        let before = registry.snapshot();
        assert!(before.find(0x7000_1000).is_none());

        registry.replace(ModuleMap::new(vec![libfoo()], vec![]));

        // a loaded snapshot is unaffected by later swaps
        assert!(before.find(0x7000_1000).is_none());
        assert!(registry.snapshot().find(0x7000_1000).is_some());
    }
}
