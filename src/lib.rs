//! Fixes for the native libraries that PyTorch ships on Windows.
//!
//! [`patch`] restores the OpenMP runtime that some builds of `fbgemm.dll` link against without
//! shipping, and [`report`] opens the DirectML memory report library and checks its exports.
//! [`apply`] runs both against the system's package directories, and [`ffi`] exposes it to hosts
//! that load this crate as a library.

pub mod error;
pub mod ffi;
pub mod logging;
pub mod native;
pub mod package;
pub mod patch;
pub mod report;
pub mod settings;

use eyre::Context;

pub use error::{Error, Result};

use native::SystemLoader;
use package::SitePackages;
use report::MemoryReport;
use settings::Options;

/// Fixes the package's OpenMP dependency if it needs fixing, then loads the memory report
/// library. A failed fix is logged but doesn't stop the report library from being loaded.
pub fn apply(options: &Options) -> eyre::Result<MemoryReport> {
    let resolver = SitePackages::from_options(options);
    let loader = SystemLoader;

    match patch::fix_dependency(&resolver, &loader, options) {
        Ok(outcomes) => log::info!("Dependency check finished: {:?}", outcomes),
        Err(err) => log::error!("Unable to fix library dependency: {:?}", eyre::Report::new(err)),
    }

    report::load(&resolver, &loader, options).wrap_err("failed to load the GPU memory report")
}

#[cfg(feature = "autoload")]
#[ctor::ctor]
fn load() {
    // Load the logging system before everything else so we can log from constructors.
    if let Err(err) = logging::init() {
        eprintln!("torchfix: {err:?}");
    }

    log::info!("Cargo package version is {}", env!("CARGO_PKG_VERSION"));
}
