//! Repairs PyTorch builds whose `fbgemm.dll` links against an OpenMP runtime that isn't shipped
//! with them.
//!
//! Affected wheels reference `libomp140.x86_64.dll` without bundling it, so loading `fbgemm.dll`
//! fails and `import torch` fails with it. The bundled `libiomp5md.dll` is a usable stand-in, so
//! copying it into place under the missing name is enough to fix the installation.

use std::{
    io,
    path::{Path, PathBuf},
};

use crate::{
    native::{LibraryLoader, LoadError},
    package::PackageResolver,
    settings::{MissingProbe, Options, PatchOptions},
    Error, Result,
};

/// What happened in a single library folder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The dependency already exists at the contained path.
    AlreadyPatched(PathBuf),

    /// The probe at the contained path doesn't reference the dependency.
    NotAffected(PathBuf),

    /// There was no probe at the contained path.
    ProbeMissing(PathBuf),

    /// The probe at the contained path loaded, so its dependencies are all available.
    Loadable(PathBuf),

    /// The substitute was copied over to the dependency's path.
    Patched { from: PathBuf, to: PathBuf },
}

impl Outcome {
    /// Whether this outcome ends the search. Finding a folder that is already fixed or never
    /// needed fixing means the installation is fine.
    fn is_final(&self) -> bool {
        matches!(self, Outcome::AlreadyPatched(_) | Outcome::NotAffected(_))
    }
}

/// Checks each of the package's library folders and copies the substitute runtime into any
/// folder whose probe library fails to load because of the missing dependency.
///
/// The returned outcomes are in the order the folders were visited.
pub fn fix_dependency<R, L>(resolver: &R, loader: &L, options: &Options) -> Result<Vec<Outcome>>
where
    R: PackageResolver + ?Sized,
    L: LibraryLoader,
{
    let mut outcomes = vec![];

    for folder in resolver.search_paths(&options.package)? {
        let lib_folder = folder.join(&options.lib_dir);
        let outcome = fix_folder(&lib_folder, loader, &options.patch)?;

        log::debug!("{:?}: {:?}", lib_folder, outcome);

        let is_final = outcome.is_final();
        outcomes.push(outcome);

        if is_final {
            break;
        }
    }

    Ok(outcomes)
}

fn fix_folder<L: LibraryLoader>(
    lib_folder: &Path,
    loader: &L,
    options: &PatchOptions,
) -> Result<Outcome> {
    let probe = lib_folder.join(&options.probe);
    let dest = lib_folder.join(&options.dependency);

    if dest.exists() {
        return Ok(Outcome::AlreadyPatched(dest));
    }

    let contents = match std::fs::read(&probe) {
        Ok(contents) => contents,

        Err(err)
            if err.kind() == io::ErrorKind::NotFound
                && options.missing_probe == MissingProbe::Skip =>
        {
            log::info!("{:?} doesn't exist, so there is nothing to patch.", probe);
            return Ok(Outcome::ProbeMissing(probe));
        }

        Err(source) => return Err(Error::FileNotAccessible { path: probe, source }),
    };

    if !contains(&contents, options.dependency.as_bytes()) {
        return Ok(Outcome::NotAffected(probe));
    }

    match loader.open(&probe) {
        Ok(_) => Ok(Outcome::Loadable(probe)),

        Err(LoadError::NotFound(_)) => {
            log::warn!("Detected pytorch version with libomp issue, patching.");

            let from = lib_folder.join(&options.substitute);

            if let Err(source) = std::fs::copy(&from, &dest) {
                return Err(Error::Copy {
                    from,
                    to: dest,
                    source,
                });
            }

            log::info!("Copied {:?} to {:?}.", from, dest);
            Ok(Outcome::Patched { from, to: dest })
        }

        Err(err) => Err(err.into_error(probe)),
    }
}

/// Returns whether `needle` appears anywhere in `haystack`.
fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}
