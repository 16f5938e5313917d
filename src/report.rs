//! Opens the DirectML memory report library, which tells us how much GPU memory is free.

use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::{
    native::{LibraryLoader, LoadError, NativeLibrary, SystemLibrary, U64Fn},
    package::PackageResolver,
    settings::Options,
    Error, Result,
};

/// The functions the report library must export. Both take no arguments and return a number of
/// bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum EntryPoint {
    #[strum(serialize = "GetAvailableGpuMemory")]
    AvailableGpuMemory,

    #[strum(serialize = "GetTotalGpuMemory")]
    TotalGpuMemory,
}

impl EntryPoint {
    /// The exported symbol name.
    pub fn symbol(self) -> &'static str {
        self.into()
    }
}

/// A snapshot of GPU memory, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub available: u64,
    pub total: u64,
}

impl MemoryStats {
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.available)
    }
}

impl Display for MemoryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const MIB: u64 = 1024 * 1024;

        write!(
            f,
            "{} MiB free of {} MiB",
            self.available / MIB,
            self.total / MIB
        )
    }
}

/// A loaded report library with both of its entry points resolved.
///
/// The library is unloaded when this value is dropped.
pub struct MemoryReport<Lib = SystemLibrary> {
    available: U64Fn,
    total: U64Fn,
    path: PathBuf,

    // Keeps the entry points above valid.
    _library: Lib,
}

impl<Lib: NativeLibrary> MemoryReport<Lib> {
    fn new(library: Lib, path: PathBuf) -> Result<MemoryReport<Lib>> {
        let lookup = |entry: EntryPoint| {
            library.u64_fn(entry.symbol()).ok_or_else(|| {
                log::error!("{} function not found in {:?}.", entry, path);

                Error::MissingEntryPoint {
                    function: entry,
                    library: path.clone(),
                }
            })
        };

        let available = lookup(EntryPoint::AvailableGpuMemory)?;
        let total = lookup(EntryPoint::TotalGpuMemory)?;

        Ok(MemoryReport {
            available,
            total,
            path,
            _library: library,
        })
    }

    /// Bytes of GPU memory currently available.
    pub fn available(&self) -> u64 {
        unsafe { (self.available)() }
    }

    /// Total bytes of GPU memory.
    pub fn total(&self) -> u64 {
        unsafe { (self.total)() }
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            available: self.available(),
            total: self.total(),
        }
    }

    /// Where the library was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Loads the report library from the first of the package's library folders that has a loadable
/// copy, then checks that it exports every `EntryPoint`.
pub fn load<R, L>(resolver: &R, loader: &L, options: &Options) -> Result<MemoryReport<L::Library>>
where
    R: PackageResolver + ?Sized,
    L: LibraryLoader,
{
    let folders = match resolver.search_paths(&options.package) {
        Ok(folders) => folders,

        Err(err @ Error::PackageNotFound { .. }) => {
            log::warn!("{}", err);
            vec![]
        }

        Err(err) => return Err(err),
    };

    let mut loaded = None;

    for folder in folders {
        let path = folder
            .join(&options.lib_dir)
            .join(&options.report.library);

        log::info!("Attempting to load DLL from: {:?}", path);

        match loader.open(&path) {
            Ok(library) => {
                loaded = Some((library, path));
                break;
            }

            Err(LoadError::NotFound(_)) => log::warn!("File not found: {:?}", path),

            Err(LoadError::Os(err)) => log::error!("Failed to load DLL {:?}: {}", path, err),
        }
    }

    let (library, path) = loaded.ok_or_else(|| {
        log::error!(
            "{} not found or failed to load. Please ensure the DLL is in the correct location.",
            options.report.library
        );

        Error::DiagnosticsNotFound {
            library: options.report.library.clone(),
        }
    })?;

    MemoryReport::new(library, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::fake::{Behaviour, FakeLoader};

    const GIB: u64 = 1024 * 1024 * 1024;

    extern "C" fn three_gib() -> u64 {
        3 * GIB
    }

    extern "C" fn eight_gib() -> u64 {
        8 * GIB
    }

    fn full_library() -> Behaviour {
        Behaviour::Load(vec![
            ("GetAvailableGpuMemory", three_gib as U64Fn),
            ("GetTotalGpuMemory", eight_gib as U64Fn),
        ])
    }

    fn report_path(folder: &str) -> PathBuf {
        Path::new(folder).join("lib").join("comfyui_dml_report.dll")
    }

    #[test]
    fn missing_package_is_not_found() {
        let resolver = |name: &str| -> Result<Vec<PathBuf>> {
            Err(Error::PackageNotFound {
                package: name.to_string(),
            })
        };

        let loader = FakeLoader::default();
        let result = load(&resolver, &loader, &Options::default());

        assert!(matches!(
            result,
            Err(Error::DiagnosticsNotFound { library }) if library == "comfyui_dml_report.dll"
        ));
        assert!(loader.opened.borrow().is_empty());
    }

    #[test]
    fn other_resolver_errors_propagate() {
        let resolver = |_: &str| -> Result<Vec<PathBuf>> {
            Err(Error::FileNotAccessible {
                path: PathBuf::from("torch.pth"),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            })
        };

        let loader = FakeLoader::default();
        let result = load(&resolver, &loader, &Options::default());

        assert!(matches!(
            result,
            Err(Error::FileNotAccessible { path, .. }) if path == Path::new("torch.pth")
        ));
        assert!(loader.opened.borrow().is_empty());
    }

    #[test]
    fn unloadable_everywhere_is_not_found() {
        let resolver = |_: &str| -> Result<Vec<PathBuf>> {
            Ok(vec![PathBuf::from("a"), PathBuf::from("b")])
        };

        let loader = FakeLoader::default().with(report_path("b"), Behaviour::Denied);
        let result = load(&resolver, &loader, &Options::default());

        assert!(matches!(result, Err(Error::DiagnosticsNotFound { .. })));
        assert_eq!(loader.opened.borrow().len(), 2);
    }

    #[test]
    fn missing_total_entry_point_is_named() {
        let resolver = |_: &str| -> Result<Vec<PathBuf>> { Ok(vec![PathBuf::from("torch")]) };

        let loader = FakeLoader::default().with(
            report_path("torch"),
            Behaviour::Load(vec![("GetAvailableGpuMemory", three_gib as U64Fn)]),
        );

        match load(&resolver, &loader, &Options::default()) {
            Err(Error::MissingEntryPoint { function, library }) => {
                assert_eq!(function, EntryPoint::TotalGpuMemory);
                assert_eq!(function.to_string(), "GetTotalGpuMemory");
                assert_eq!(library, report_path("torch"));
            }

            Err(err) => panic!("unexpected error: {err:?}"),
            Ok(_) => panic!("loaded a library without GetTotalGpuMemory"),
        }
    }

    #[test]
    fn later_folder_is_used_when_earlier_ones_fail() {
        let resolver = |_: &str| -> Result<Vec<PathBuf>> {
            Ok(vec![
                PathBuf::from("missing"),
                PathBuf::from("denied"),
                PathBuf::from("good"),
                PathBuf::from("unused"),
            ])
        };

        let loader = FakeLoader::default()
            .with(report_path("denied"), Behaviour::Denied)
            .with(report_path("good"), full_library())
            .with(report_path("unused"), full_library());

        let report = load(&resolver, &loader, &Options::default()).unwrap();

        assert_eq!(report.path(), report_path("good"));
        assert_eq!(report.available(), 3 * GIB);
        assert_eq!(report.total(), 8 * GIB);
        assert_eq!(
            *loader.opened.borrow(),
            vec![
                report_path("missing"),
                report_path("denied"),
                report_path("good")
            ]
        );
    }

    #[test]
    fn stats_report_usage() {
        let resolver = |_: &str| -> Result<Vec<PathBuf>> { Ok(vec![PathBuf::from("torch")]) };
        let loader = FakeLoader::default().with(report_path("torch"), full_library());

        let stats = load(&resolver, &loader, &Options::default())
            .unwrap()
            .stats();

        assert_eq!(stats.used(), 5 * GIB);
        assert_eq!(stats.to_string(), "3072 MiB free of 8192 MiB");
    }

    #[test]
    fn used_memory_saturates() {
        let stats = MemoryStats {
            available: 10,
            total: 4,
        };

        assert_eq!(stats.used(), 0);
    }

    #[test]
    fn symbol_names() {
        assert_eq!(EntryPoint::AvailableGpuMemory.symbol(), "GetAvailableGpuMemory");
        assert_eq!(EntryPoint::TotalGpuMemory.symbol(), "GetTotalGpuMemory");
    }
}
