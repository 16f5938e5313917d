//! Finds the directories an installed Python package lives in.

use std::path::{Path, PathBuf};

use itertools::Itertools;

use crate::{settings::Options, Error, Result};

/// Environment variable holding extra site-packages directories, separated like `PATH`.
pub const SITE_PACKAGES_VAR: &str = "TORCHFIX_SITE_PACKAGES";

/// Environment variables naming the prefix of an active Python environment.
const PREFIX_VARS: &[&str] = &["VIRTUAL_ENV", "CONDA_PREFIX"];

pub trait PackageResolver {
    /// Returns every root directory of `package`, or `Error::PackageNotFound` if it isn't
    /// installed anywhere.
    fn search_paths(&self, package: &str) -> Result<Vec<PathBuf>>;
}

impl<F> PackageResolver for F
where
    F: Fn(&str) -> Result<Vec<PathBuf>>,
{
    fn search_paths(&self, package: &str) -> Result<Vec<PathBuf>> {
        self(package)
    }
}

/// Looks for packages as directories directly under a list of site-packages roots.
#[derive(Clone, Debug, Default)]
pub struct SitePackages {
    roots: Vec<PathBuf>,
}

impl SitePackages {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> SitePackages {
        SitePackages {
            roots: roots.into_iter().collect(),
        }
    }

    /// Uses the roots from the settings file, then those in `TORCHFIX_SITE_PACKAGES`, then the
    /// site-packages of the Python environment hosting this process.
    pub fn from_options(options: &Options) -> SitePackages {
        let from_env = std::env::var_os(SITE_PACKAGES_VAR)
            .map(|value| std::env::split_paths(&value).collect_vec())
            .unwrap_or_default();

        SitePackages::new(
            options
                .search_roots
                .iter()
                .cloned()
                .chain(from_env)
                .chain(host_roots())
                .unique(),
        )
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

/// Returns the site-packages directories under a Python prefix, for both the Windows layout
/// (`Lib/site-packages`) and the Unix one (`lib/pythonX.Y/site-packages`).
fn prefix_roots(prefix: &Path) -> Vec<PathBuf> {
    let mut roots = vec![prefix.join("Lib").join("site-packages")];

    if let Ok(entries) = std::fs::read_dir(prefix.join("lib")) {
        let versioned = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("python"))
            .map(|entry| entry.path().join("site-packages"))
            .sorted();

        roots.extend(versioned);
    }

    roots.retain(|root| root.is_dir());
    roots
}

/// Site-packages directories of the environment we're running in. An embedded or system Python
/// keeps them next to the executable, and a virtual environment keeps the executable one level
/// down in `Scripts` or `bin`.
fn host_roots() -> Vec<PathBuf> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));

    let exe_prefixes = exe_dir
        .iter()
        .flat_map(|dir| std::iter::once(dir.clone()).chain(dir.parent().map(Path::to_path_buf)))
        .collect_vec();

    let env_prefixes = PREFIX_VARS
        .iter()
        .filter_map(|var| std::env::var_os(var))
        .map(PathBuf::from);

    exe_prefixes
        .into_iter()
        .chain(env_prefixes)
        .flat_map(|prefix| prefix_roots(&prefix))
        .collect()
}

impl PackageResolver for SitePackages {
    fn search_paths(&self, package: &str) -> Result<Vec<PathBuf>> {
        let paths = self
            .roots
            .iter()
            .map(|root| root.join(package))
            .filter(|path| path.is_dir())
            .unique()
            .collect_vec();

        if paths.is_empty() {
            return Err(Error::PackageNotFound {
                package: package.to_string(),
            });
        }

        log::debug!("Found '{}' in {:?}", package, paths);
        Ok(paths)
    }
}
