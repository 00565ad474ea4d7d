//! Executable lookup along a PATH-style search list.

use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::unistd::{access, AccessFlags};

use crate::error::{PtyError, Result};

const PATH_PREFIX: &[u8] = b"PATH=";

/// Locate `name` as an executable.
///
/// Names starting with `/` or `.` are checked as given and never searched
/// for. Any other name is looked up in each directory of `search` in
/// order; when `search` is `None` the ambient `PATH` is used.
pub fn resolve(name: &OsStr, search: Option<&OsStr>) -> Result<PathBuf> {
    let result = find(name, search);
    if result.is_none() {
        log::warn!("Unable to find full path for {:?}", name);
    }
    result.ok_or_else(|| PtyError::NotFound(name.to_string_lossy().into_owned()))
}

/// Resolve `name` against the `PATH=` entry of a child environment.
///
/// An empty environment means the child inherits the launcher's, so the
/// ambient `PATH` applies. A non-empty environment without `PATH=` has
/// nothing to search.
pub fn resolve_in_env(name: &OsStr, env: &[CString]) -> Result<PathBuf> {
    if env.is_empty() {
        return resolve(name, None);
    }
    resolve(name, Some(search_path_from_env(env).unwrap_or_default()))
}

/// The value of the first `PATH=` entry of an environment vector.
pub fn search_path_from_env(env: &[CString]) -> Option<&OsStr> {
    env.iter()
        .map(|entry| entry.as_bytes())
        .find(|bytes| bytes.starts_with(PATH_PREFIX))
        .map(|bytes| OsStr::from_bytes(&bytes[PATH_PREFIX.len()..]))
}

fn find(name: &OsStr, search: Option<&OsStr>) -> Option<PathBuf> {
    let bytes = name.as_bytes();
    if bytes.is_empty() {
        return None;
    }

    if bytes[0] == b'/' || bytes[0] == b'.' {
        let path = Path::new(name);
        return is_executable(path).then(|| path.to_path_buf());
    }

    let ambient;
    let search = match search {
        Some(search) => search,
        None => {
            ambient = std::env::var_os("PATH")?;
            ambient.as_os_str()
        }
    };

    search
        .as_bytes()
        .split(|&b| b == b':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(OsStr::from_bytes(dir)).join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    !path.is_dir() && access(path, AccessFlags::X_OK).is_ok()
}
