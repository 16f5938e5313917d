//! User-editable settings, stored as JSON.

use std::{
    fs::File,
    io::{self, Read},
    path::PathBuf,
};

use cached::proc_macro::cached;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable that overrides the location of the settings file.
pub const SETTINGS_VAR: &str = "TORCHFIX_SETTINGS";

/// What to do when the probe library doesn't exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingProbe {
    /// Treat the installation as one that doesn't need patching. This is the default.
    Skip,

    /// Fail with `Error::FileNotAccessible`.
    Fail,
}

impl Default for MissingProbe {
    fn default() -> Self {
        MissingProbe::Skip
    }
}

/// File names used when repairing the OpenMP dependency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchOptions {
    /// The library whose contents and loadability reveal the broken dependency.
    pub probe: String,

    /// The dependency that may be missing. Its name is searched for in the probe's bytes.
    pub dependency: String,

    /// The bundled library copied into place under the dependency's name.
    pub substitute: String,

    pub missing_probe: MissingProbe,
}

impl Default for PatchOptions {
    fn default() -> Self {
        PatchOptions {
            probe: "fbgemm.dll".to_string(),
            dependency: "libomp140.x86_64.dll".to_string(),
            substitute: "libiomp5md.dll".to_string(),
            missing_probe: MissingProbe::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportOptions {
    /// File name of the GPU memory report library.
    pub library: String,
}

impl Default for ReportOptions {
    fn default() -> Self {
        ReportOptions {
            library: "comfyui_dml_report.dll".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Name of the package whose native libraries we fix.
    pub package: String,

    /// Directory inside each package root that holds the native libraries.
    pub lib_dir: String,

    /// Site-packages directories searched for the package, ahead of `TORCHFIX_SITE_PACKAGES`.
    pub search_roots: Vec<PathBuf>,

    pub patch: PatchOptions,
    pub report: ReportOptions,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            package: "torch".to_string(),
            lib_dir: "lib".to_string(),
            search_roots: vec![],
            patch: PatchOptions::default(),
            report: ReportOptions::default(),
        }
    }
}

/// Returns the path of the settings file: `TORCHFIX_SETTINGS` if set, otherwise `torchfix.json`
/// next to the executable.
#[cached]
fn settings_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(SETTINGS_VAR) {
        return Some(PathBuf::from(path));
    }

    let exe = std::env::current_exe().ok()?;
    Some(exe.parent()?.join("torchfix.json"))
}

impl Options {
    /// Attempts to parse the contents of `reader` to get an `Options` value.
    pub fn parse_json(reader: impl Read) -> Result<Options> {
        // Coerce with `?`.
        Ok(serde_json::from_reader(reader)?)
    }

    /// Looks for a settings file at `path` and loads it.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Option<Options>> {
        let path = path.into();

        let file = match File::open(&path) {
            Ok(file) => file,

            // This isn't an error, but we didn't find any settings.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),

            Err(err) => return Err(err).wrap_err_with(|| format!("failed to open {:?}", path)),
        };

        Options::parse_json(file)
            .wrap_err_with(|| format!("failed to parse {:?}", path))
            .map(Some)
    }

    /// Either loads the settings from disk or generates default values for them.
    pub fn load() -> Options {
        let loaded = match settings_path() {
            Some(path) => Options::load_from(path),
            None => Ok(None),
        };

        match loaded {
            Ok(Some(options)) => return options,

            Ok(None) => log::info!("No settings file found. Defaults will be used."),

            Err(err) => {
                log::error!("Error loading settings file: {err:?}. Defaults will be used.")
            }
        };

        Options::default()
    }
}
