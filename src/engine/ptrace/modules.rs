use crate::engine::{EngineError, Module, Section};
use lru::LruCache;
use nix::unistd::Pid;
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol, SectionKind, SymbolKind};
use proc_maps::MapRange;
use std::collections::BTreeMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::rc::Rc;

const PAGE_SIZE: u64 = 4096;
const IMAGE_CACHE_SIZE: usize = 64;

#[derive(Debug, Clone)]
struct Symbol {
    addr: u64,
    size: u64,
    name: String,
}

/// Part of an ELF image needed for module description and symbolization.
#[derive(Debug, Default)]
pub struct ImageInfo {
    pub uuid: Option<String>,
    /// Lowest page of loadable segments.
    pub file_address: u64,
    pub entry: u64,
    sections: Vec<Section>,
    /// Text symbols ordered by address.
    symbols: Vec<Symbol>,
}

impl ImageInfo {
    pub fn parse(path: &Path) -> Result<Self, EngineError> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;

        let file_address = object
            .segments()
            .map(|segment| segment.address())
            .min()
            .unwrap_or_default()
            & !(PAGE_SIZE - 1);

        let uuid = object
            .build_id()
            .ok()
            .flatten()
            .map(|id| id.iter().map(|b| format!("{b:02X}")).collect::<String>());

        let sections = object
            .sections()
            .filter_map(|section| {
                let name = section.name().ok()?;
                if name.is_empty() {
                    return None;
                }
                Some(Section {
                    name: name.to_string(),
                    file_address: section.address(),
                    load_address: None,
                    byte_size: section.size(),
                    file_byte_size: section.file_range().map(|(_, size)| size).unwrap_or(0),
                })
            })
            .collect();

        let mut symbols: Vec<Symbol> = object
            .symbols()
            .chain(object.dynamic_symbols())
            .filter(|symbol| symbol.kind() == SymbolKind::Text && symbol.address() != 0)
            .filter_map(|symbol| {
                let name = symbol.name().ok()?;
                Some(Symbol {
                    addr: symbol.address(),
                    size: symbol.size(),
                    name: rustc_demangle::demangle(name).to_string(),
                })
            })
            .collect();
        symbols.sort_by_key(|s| s.addr);
        symbols.dedup_by_key(|s| s.addr);

        Ok(Self {
            uuid,
            file_address,
            entry: object.entry(),
            sections,
            symbols,
        })
    }

    /// Find a function that contains file address.
    pub fn function_at(&self, file_addr: u64) -> Option<(&str, u64)> {
        let idx = self.symbols.partition_point(|s| s.addr <= file_addr);
        let symbol = self.symbols.get(idx.checked_sub(1)?)?;
        if symbol.size != 0 && file_addr >= symbol.addr + symbol.size {
            return None;
        }
        Some((symbol.name.as_str(), symbol.addr))
    }

    pub fn is_function_start(&self, file_addr: u64) -> bool {
        self.symbols
            .binary_search_by_key(&file_addr, |s| s.addr)
            .is_ok()
    }
}

/// Return bytes and file addresses of executable sections.
pub fn text_sections(path: &Path) -> Result<Vec<(u64, Vec<u8>)>, EngineError> {
    let file = fs::File::open(path)?;
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let object = object::File::parse(&*mmap)?;

    let mut result = vec![];
    for section in object.sections() {
        if section.kind() != SectionKind::Text {
            continue;
        }
        result.push((section.address(), section.data()?.to_vec()));
    }
    Ok(result)
}

/// Images mapped into a process, with parsed ELF files cached by path.
pub struct ModuleRegistry {
    images: LruCache<PathBuf, Rc<ImageInfo>>,
    /// Last observed module set.
    current: Vec<Module>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self {
            images: LruCache::new(NonZeroUsize::new(IMAGE_CACHE_SIZE).expect("infallible")),
            current: vec![],
        }
    }
}

impl ModuleRegistry {
    pub fn image(&mut self, path: &Path) -> Option<Rc<ImageInfo>> {
        if let Some(image) = self.images.get(path) {
            return Some(image.clone());
        }
        let image = Rc::new(crate::muted_error!(ImageInfo::parse(path), "parse image:")?);
        self.images.put(path.to_path_buf(), image.clone());
        Some(image)
    }

    pub fn modules(&self) -> &[Module] {
        &self.current
    }

    pub fn clear(&mut self) {
        self.current.clear();
    }

    /// Read process maps and return (loaded, unloaded) modules since the last call.
    pub fn refresh(
        &mut self,
        pid: Pid,
        main: Option<&Path>,
    ) -> Result<(Vec<Module>, Vec<Module>), EngineError> {
        let maps: Vec<MapRange> = proc_maps::get_process_maps(pid.as_raw())?;

        let mut ranges: BTreeMap<PathBuf, (u64, u64)> = BTreeMap::new();
        for map in &maps {
            let Some(filename) = map.filename() else {
                continue;
            };
            if !filename.is_absolute() {
                continue;
            }
            let start = map.start() as u64;
            let end = start + map.size() as u64;
            let range = ranges
                .entry(filename.to_path_buf())
                .or_insert((start, end));
            range.0 = range.0.min(start);
            range.1 = range.1.max(end);
        }

        let mut modules: Vec<Module> = ranges
            .into_iter()
            .map(|(path, (start, end))| self.describe(path, start, end))
            .collect();
        modules.sort_by_key(|m| (Some(m.path.as_path()) != main, m.load_address));

        let loaded = modules
            .iter()
            .filter(|m| !self.current.contains(m))
            .cloned()
            .collect();
        let unloaded = self
            .current
            .iter()
            .filter(|m| !modules.contains(m))
            .cloned()
            .collect();
        self.current = modules;
        Ok((loaded, unloaded))
    }

    fn describe(&mut self, path: PathBuf, start: u64, end: u64) -> Module {
        let image = self.image(&path);
        let (uuid, file_address, mut sections) = match image {
            Some(image) => (
                image.uuid.clone(),
                image.file_address,
                image.sections.clone(),
            ),
            None => (None, start, vec![]),
        };
        let slide = start.checked_sub(file_address);
        for section in sections.iter_mut() {
            if section.file_address != 0 {
                section.load_address = slide.map(|slide| section.file_address + slide);
            }
        }

        Module {
            path,
            uuid,
            load_address: start,
            file_address,
            size: end - start,
            sections,
        }
    }

    /// Return function name and its load address for a pc.
    pub fn symbolize(&mut self, pc: u64) -> Option<(String, u64)> {
        let module = self.current.iter().find(|m| m.contains(pc))?.clone();
        let slide = module.slide()?;
        let image = self.image(&module.path)?;
        let (name, start) = image.function_at(pc - slide)?;
        Some((name.to_string(), start + slide))
    }

    pub fn module_at(&self, pc: u64) -> Option<&Module> {
        self.current.iter().find(|m| m.contains(pc))
    }
}
