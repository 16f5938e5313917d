//! Errors produced by the library fix and the memory report loader.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::report::EntryPoint;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The package has no root directory in any search location.
    #[error("package '{package}' is not installed")]
    PackageNotFound { package: String },

    #[error("unable to read {path:?}")]
    FileNotAccessible {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The library itself, or one of the libraries it depends on, could not be found.
    #[error("library {path:?} or one of its dependencies could not be found")]
    LibraryNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to load library {path:?}")]
    LibraryLoad {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{library} not found or failed to load")]
    DiagnosticsNotFound { library: String },

    #[error("{function} function not found in {library:?}")]
    MissingEntryPoint {
        function: EntryPoint,
        library: PathBuf,
    },

    #[error("failed to copy {from:?} to {to:?}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}
