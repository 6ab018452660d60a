//! C4: working-directory resolution (spec §4.4).
//!
//! Precedence: `command.workdir` > `group.workdir` > the group's lazily
//! created temp dir. The chosen directory must exist, be a directory, and
//! not sit under a world-writable parent lacking the sticky bit.

use crate::codec::ResolvedPath;
use crate::error::{Error, Result};
use crate::host::ProcessHost;

pub fn resolve_workdir(
    command_workdir: Option<&ResolvedPath>,
    group_workdir: Option<&ResolvedPath>,
    group_temp_dir: &ResolvedPath,
    host: &dyn ProcessHost,
) -> Result<ResolvedPath> {
    let chosen = command_workdir.or(group_workdir).unwrap_or(group_temp_dir).clone();
    if !host.path_exists(chosen.as_path()) {
        return Err(Error::InvalidPath {
            path: chosen.to_string(),
            reason: "working directory does not exist".into(),
        });
    }
    if !host.is_directory(chosen.as_path()) {
        return Err(Error::InvalidPath {
            path: chosen.to_string(),
            reason: "working directory is not a directory".into(),
        });
    }
    if !host.is_safe_workdir(chosen.as_path()) {
        return Err(Error::InvalidPath {
            path: chosen.to_string(),
            reason: "working directory's parent is world-writable without the sticky bit".into(),
        });
    }
    Ok(chosen)
}
