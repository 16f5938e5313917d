//! Opens native libraries and looks up the functions they export.

use std::{
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;

/// The only signature we ever call: no arguments, returns a byte count.
pub type U64Fn = unsafe extern "C" fn() -> u64;

/// `ERROR_MOD_NOT_FOUND`, reported by Windows when a library's dependency is missing.
const ERROR_MOD_NOT_FOUND: i32 = 126;

/// Fragments of loader messages that mean a file couldn't be found. `dlopen` on Unix reports
/// failures as strings rather than error codes.
const NOT_FOUND_MESSAGES: &[&str] = &[
    "no such file",
    "image not found",
    "could not find",
    "os error 126",
];

#[derive(Debug, Error)]
pub enum LoadError {
    /// Either the library or something it links against is missing.
    #[error("library or one of its dependencies was not found")]
    NotFound(#[source] io::Error),

    #[error("the library could not be loaded")]
    Os(#[source] io::Error),
}

impl LoadError {
    /// Attaches the path of the library that failed to load.
    pub fn into_error(self, path: PathBuf) -> crate::Error {
        match self {
            LoadError::NotFound(source) => crate::Error::LibraryNotFound { path, source },
            LoadError::Os(source) => crate::Error::LibraryLoad { path, source },
        }
    }
}

fn is_not_found(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::NotFound {
        return true;
    }

    if cfg!(windows) && err.raw_os_error() == Some(ERROR_MOD_NOT_FOUND) {
        return true;
    }

    let message = err.to_string().to_lowercase();
    NOT_FOUND_MESSAGES
        .iter()
        .any(|fragment| message.contains(fragment))
}

impl From<io::Error> for LoadError {
    fn from(err: io::Error) -> LoadError {
        if is_not_found(&err) {
            LoadError::NotFound(err)
        } else {
            LoadError::Os(err)
        }
    }
}

/// A loaded library. Dropping it unloads the library.
pub trait NativeLibrary {
    /// Looks up an exported function with the signature `uint64_t name(void)`.
    ///
    /// The returned pointer is only valid while `self` is alive.
    fn u64_fn(&self, name: &str) -> Option<U64Fn>;
}

pub trait LibraryLoader {
    type Library: NativeLibrary;

    fn open(&self, path: &Path) -> Result<Self::Library, LoadError>;
}

/// Loads libraries through the platform's dynamic loader.
///
/// On Windows the library's own folder is searched for its dependencies, as well as the usual
/// system locations. PyTorch keeps `fbgemm.dll` next to the libraries it links against, so a
/// plain `LoadLibraryW` would report healthy installations as missing a dependency.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemLoader;

pub struct SystemLibrary {
    library: sys::Library,
    path: PathBuf,
}

impl LibraryLoader for SystemLoader {
    type Library = SystemLibrary;

    fn open(&self, path: &Path) -> Result<SystemLibrary, LoadError> {
        // Searching the library's folder only works with absolute paths.
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };

        let library = sys::open(&path)?;

        Ok(SystemLibrary { library, path })
    }
}

impl NativeLibrary for SystemLibrary {
    fn u64_fn(&self, name: &str) -> Option<U64Fn> {
        match sys::u64_fn(&self.library, name) {
            Ok(function) => Some(function),
            Err(err) => {
                log::debug!("No symbol '{}' in {:?}: {}", name, self.path, err);
                None
            }
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::{error::Error as _, io, path::Path};

    use libloading::os::windows::{
        LOAD_LIBRARY_SEARCH_DEFAULT_DIRS, LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR,
    };

    pub use libloading::os::windows::Library;

    use super::{LoadError, U64Fn};

    impl From<libloading::Error> for LoadError {
        fn from(err: libloading::Error) -> LoadError {
            // Keep the OS error code where there is one so that it can be classified.
            let code = err
                .source()
                .and_then(|source| source.downcast_ref::<io::Error>())
                .and_then(io::Error::raw_os_error);

            match code {
                Some(code) => io::Error::from_raw_os_error(code).into(),
                None => io::Error::new(io::ErrorKind::Other, err.to_string()).into(),
            }
        }
    }

    pub fn open(path: &Path) -> Result<Library, LoadError> {
        let flags = LOAD_LIBRARY_SEARCH_DEFAULT_DIRS | LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR;
        Ok(unsafe { Library::load_with_flags(path, flags) }?)
    }

    pub fn u64_fn(library: &Library, name: &str) -> Result<U64Fn, libloading::Error> {
        let symbol = unsafe { library.get::<U64Fn>(name.as_bytes()) }?;
        Ok(*symbol)
    }
}

#[cfg(not(windows))]
mod sys {
    use std::{io, path::Path};

    pub use dlopen::symbor::Library;

    use super::{LoadError, U64Fn};

    impl From<dlopen::Error> for LoadError {
        fn from(err: dlopen::Error) -> LoadError {
            match err {
                dlopen::Error::OpeningLibraryError(err) => err.into(),
                other => LoadError::Os(io::Error::new(io::ErrorKind::Other, other.to_string())),
            }
        }
    }

    pub fn open(path: &Path) -> Result<Library, LoadError> {
        Ok(Library::open(path)?)
    }

    pub fn u64_fn(library: &Library, name: &str) -> Result<U64Fn, dlopen::Error> {
        let symbol = unsafe { library.symbol::<U64Fn>(name) }?;
        Ok(*symbol)
    }
}

/// A loader that hands out libraries made of plain Rust functions.
#[cfg(test)]
pub(crate) mod fake {
    use std::{cell::RefCell, collections::HashMap, io};

    use super::*;

    #[derive(Clone)]
    pub enum Behaviour {
        Load(Vec<(&'static str, U64Fn)>),
        NotFound,
        Denied,
    }

    #[derive(Default)]
    pub struct FakeLoader {
        behaviours: HashMap<PathBuf, Behaviour>,
        pub opened: RefCell<Vec<PathBuf>>,
    }

    impl FakeLoader {
        pub fn with(mut self, path: impl Into<PathBuf>, behaviour: Behaviour) -> FakeLoader {
            self.behaviours.insert(path.into(), behaviour);
            self
        }
    }

    pub struct FakeLibrary {
        symbols: HashMap<&'static str, U64Fn>,
    }

    impl NativeLibrary for FakeLibrary {
        fn u64_fn(&self, name: &str) -> Option<U64Fn> {
            self.symbols.get(name).copied()
        }
    }

    impl LibraryLoader for FakeLoader {
        type Library = FakeLibrary;

        fn open(&self, path: &Path) -> Result<FakeLibrary, LoadError> {
            self.opened.borrow_mut().push(path.to_path_buf());

            match self.behaviours.get(path).cloned() {
                Some(Behaviour::Load(symbols)) => Ok(FakeLibrary {
                    symbols: symbols.into_iter().collect(),
                }),

                Some(Behaviour::Denied) => Err(LoadError::Os(io::Error::from(
                    io::ErrorKind::PermissionDenied,
                ))),

                Some(Behaviour::NotFound) | None => Err(LoadError::NotFound(io::Error::from(
                    io::ErrorKind::NotFound,
                ))),
            }
        }
    }
}
