//! Debug-line lookup over the process's own loaded modules.
//!
//! One loader per module path, built lazily on first lookup and kept for the
//! process lifetime. A lookup translates a runtime address into the module's
//! link-time address space (lowest file-backed load segment as the image
//! base) and then consults the DWARF line program and function tree.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::resolve::{SourceLocation, demangle_symbol, strip_rust_hash_suffix};

pub(crate) struct LineTable {
    modules: Mutex<HashMap<String, ModuleLines>>,
}

enum ModuleLines {
    Ready {
        loader: Box<addr2line::Loader>,
        link_base: u64,
    },
    Failed,
}

/// What debug info had to say about one address.
pub(crate) struct DebugInfoHit {
    pub(crate) function: Option<String>,
    pub(crate) source: Option<SourceLocation>,
}

pub(crate) fn line_table() -> &'static LineTable {
    static TABLE: OnceLock<LineTable> = OnceLock::new();
    TABLE.get_or_init(|| LineTable {
        modules: Mutex::new(HashMap::new()),
    })
}

impl LineTable {
    /// Looks up `ip` in the module mapped at `runtime_base`. Returns `None`
    /// when the module has no usable debug info or nothing covers the
    /// address; misses never error.
    pub(crate) fn lookup(
        &self,
        module_path: &str,
        runtime_base: usize,
        ip: usize,
    ) -> Option<DebugInfoHit> {
        let mut modules = self.modules.lock();
        let state = modules
            .entry(module_path.to_owned())
            .or_insert_with(|| load_module(module_path));
        let ModuleLines::Ready { loader, link_base } = state else {
            return None;
        };

        let rel = (ip as u64).checked_sub(runtime_base as u64)?;
        let probe = link_base.checked_add(rel)?;

        let mut hit = DebugInfoHit {
            function: None,
            source: None,
        };
        if let Ok(mut frames) = loader.find_frames(probe) {
            while let Ok(Some(frame)) = frames.next() {
                if hit.function.is_none()
                    && let Some(function) = frame.function
                {
                    match function.demangle() {
                        Ok(name) => {
                            hit.function = Some(strip_rust_hash_suffix(name.as_ref()).to_owned());
                        }
                        Err(_) => {
                            if let Ok(name) = function.raw_name() {
                                hit.function =
                                    Some(strip_rust_hash_suffix(name.as_ref()).to_owned());
                            }
                        }
                    }
                }
                if hit.source.is_none()
                    && let Some(location) = frame.location
                    && let Some(file) = location.file
                {
                    hit.source = Some(SourceLocation {
                        file: file.to_owned(),
                        line: location.line.unwrap_or(0),
                    });
                }
                if hit.function.is_some() && hit.source.is_some() {
                    break;
                }
            }
        }
        if hit.function.is_none()
            && let Some(symbol) = loader.find_symbol(probe)
        {
            hit.function = Some(demangle_symbol(symbol));
        }
        (hit.function.is_some() || hit.source.is_some()).then_some(hit)
    }
}

fn load_module(path: &str) -> ModuleLines {
    let loader = match addr2line::Loader::new(path) {
        Ok(loader) => loader,
        Err(error) => {
            warn!(module = path, %error, "cannot open debug object");
            return ModuleLines::Failed;
        }
    };
    let link_base = match linked_image_base(path) {
        Ok(base) => base,
        Err(reason) => {
            warn!(module = path, reason = %reason, "cannot determine linked image base");
            return ModuleLines::Failed;
        }
    };
    debug!(
        module = path,
        link_base = format_args!("{link_base:#x}"),
        "debug object loaded"
    );
    ModuleLines::Ready {
        loader: Box::new(loader),
        link_base,
    }
}

fn linked_image_base(path: &str) -> Result<u64, String> {
    use object::{Object, ObjectSegment};

    let data = std::fs::read(path).map_err(|error| format!("read debug object: {error}"))?;
    let file = object::File::parse(&*data).map_err(|error| format!("parse debug object: {error}"))?;
    file.segments()
        .filter_map(|segment| {
            let (_, file_size) = segment.file_range();
            if file_size == 0 {
                return None;
            }
            Some(segment.address())
        })
        .min()
        .ok_or_else(|| String::from("no file-backed segments"))
}
