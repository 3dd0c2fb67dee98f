//! Locating the shim library that gets preloaded into managed processes.

use std::path::PathBuf;

use anyhow::Context;
use umbra_shim_helper::SHIM_ENV_LIB_PATH;

pub const SHIM_LIB_NAME: &str = "libumbra_shim.so";

/// The path of the shim library: an explicit override from the environment,
/// or the library sitting next to the engine binary.
pub fn shim_library_path() -> anyhow::Result<PathBuf> {
    if let Some(path) = std::env::var_os(SHIM_ENV_LIB_PATH) {
        return Ok(PathBuf::from(path));
    }

    let exe = std::env::current_exe().context("Looking up the engine binary path")?;
    let dir = exe
        .parent()
        .context("The engine binary has no parent directory")?;

    let path = dir.join(SHIM_LIB_NAME);
    if !path.exists() {
        anyhow::bail!(
            "Shim library not found at {path:?}; build it or point {SHIM_ENV_LIB_PATH} at it"
        );
    }
    Ok(path)
}
