//! Address-to-symbol resolution.
//!
//! The dynamic loader answers "which module, which exported symbol"; the
//! per-module debug info (see `lines`) refines that with the real function
//! name and a source location. Resolution is best-effort: anything the
//! loader cannot place becomes the invalid-frame sentinel.

use std::borrow::Cow;
use std::fmt;

/// Resolved view of one captured instruction pointer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BacktraceEntry {
    /// The captured return address.
    pub ip: usize,
    /// Byte offset from the start of the containing symbol, 0 when unknown.
    pub offset: usize,
    /// Demangled function name, if any symbol covers the address.
    pub function: Option<String>,
    /// Path of the object the address lives in.
    pub module: Option<String>,
    /// Source file and line from debug info, when available.
    pub source: Option<SourceLocation>,
}

/// A `file:line` pair from the debug-line program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl BacktraceEntry {
    pub(crate) fn unresolved(ip: usize) -> Self {
        BacktraceEntry {
            ip,
            ..BacktraceEntry::default()
        }
    }

    /// False for the invalid-frame sentinel: no symbol and no module.
    pub fn is_resolved(&self) -> bool {
        self.function.is_some() || self.module.is_some()
    }
}

impl fmt::Display for BacktraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_resolved() {
            return write!(f, "invalid frame ({:#x})", self.ip);
        }
        match &self.function {
            Some(name) => write!(f, "{name} + {:#x}", self.offset)?,
            None => write!(f, "??? + {:#x}", self.offset)?,
        }
        if let Some(module) = &self.module {
            write!(f, " ({module})")?;
        }
        if let Some(source) = &self.source {
            write!(f, " at {}:{}", source.file, source.line)?;
        }
        Ok(())
    }
}

pub(crate) struct ModuleInfo {
    pub(crate) path: Option<String>,
    pub(crate) runtime_base: usize,
    pub(crate) symbol: Option<String>,
    pub(crate) symbol_addr: Option<usize>,
}

#[cfg(unix)]
pub(crate) fn module_info_for_ip(ip: usize) -> Option<ModuleInfo> {
    use std::ffi::CStr;
    use std::mem::MaybeUninit;

    if ip == 0 {
        return None;
    }
    let mut info = MaybeUninit::<libc::Dl_info>::zeroed();
    let rc = unsafe { libc::dladdr(ip as *const libc::c_void, info.as_mut_ptr()) };
    if rc == 0 {
        return None;
    }
    let info = unsafe { info.assume_init() };
    if info.dli_fbase.is_null() {
        return None;
    }
    let path = if info.dli_fname.is_null() {
        None
    } else {
        let raw = unsafe { CStr::from_ptr(info.dli_fname) };
        Some(raw.to_string_lossy().into_owned()).filter(|p| !p.is_empty())
    };
    let symbol = if info.dli_sname.is_null() {
        None
    } else {
        let raw = unsafe { CStr::from_ptr(info.dli_sname) };
        Some(raw.to_string_lossy().into_owned())
    };
    Some(ModuleInfo {
        path,
        runtime_base: info.dli_fbase as usize,
        symbol,
        symbol_addr: (!info.dli_saddr.is_null()).then(|| info.dli_saddr as usize),
    })
}

#[cfg(not(unix))]
pub(crate) fn module_info_for_ip(_ip: usize) -> Option<ModuleInfo> {
    None
}

pub(crate) fn demangle_symbol(raw: &str) -> String {
    let demangled = addr2line::demangle_auto(Cow::Borrowed(raw), None);
    strip_rust_hash_suffix(demangled.as_ref()).to_owned()
}

/// Drops the `::h<hex>` disambiguator rustc appends to legacy-mangled
/// symbols.
pub(crate) fn strip_rust_hash_suffix(name: &str) -> &str {
    if let Some(index) = name.rfind("::h") {
        let suffix = &name[index + 3..];
        if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            return &name[..index];
        }
    }
    name
}

pub(crate) fn resolve_ip(ip: usize) -> BacktraceEntry {
    let Some(info) = module_info_for_ip(ip) else {
        return BacktraceEntry::unresolved(ip);
    };
    let mut entry = BacktraceEntry {
        ip,
        offset: info.symbol_addr.map_or(0, |start| ip.saturating_sub(start)),
        function: info.symbol.as_deref().map(demangle_symbol),
        module: info.path.clone(),
        source: None,
    };
    if let Some(path) = &info.path
        && let Some(hit) = crate::lines::line_table().lookup(path, info.runtime_base, ip)
    {
        if hit.function.is_some() {
            entry.function = hit.function;
        }
        entry.source = hit.source;
    }
    entry
}
