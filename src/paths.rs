use std::path::{Path, PathBuf};

use stacked_errors::{bail, Result, StackableErr};
use tokio::fs;

/// Canonicalizes and checks the existence of a path. `dunce` strips the
/// verbatim prefix on Windows so that the path can be handed to the engine.
///
/// Note: this does not prevent TOCTOU bugs.
pub async fn acquire_path(path_str: impl AsRef<Path>) -> Result<PathBuf> {
    // note: we don't need fs::try_exists because the canonicalization deals with
    // testing for existence and the symbolic links
    let path = path_str.as_ref();
    let canonical = fs::canonicalize(path)
        .await
        .stack_err_with(|| format!("acquire_path(path_str: {path:?})"))?;
    Ok(dunce::simplified(&canonical).to_owned())
}

/// Canonicalizes and checks the existence of a file path
pub async fn acquire_file_path(file_path_str: impl AsRef<Path>) -> Result<PathBuf> {
    let file_path_str = file_path_str.as_ref();
    let path = acquire_path(file_path_str)
        .await
        .stack_err_with(|| format!("acquire_file_path(file_path_str: {file_path_str:?})"))?;
    if !path.is_file() {
        bail!("acquire_file_path(file_path_str: {file_path_str:?}) -> is not a file")
    }
    Ok(path)
}

/// Canonicalizes and checks the existence of a directory path
pub async fn acquire_dir_path(dir_path_str: impl AsRef<Path>) -> Result<PathBuf> {
    let dir_path_str = dir_path_str.as_ref();
    let path = acquire_path(dir_path_str)
        .await
        .stack_err_with(|| format!("acquire_dir_path(dir_path_str: {dir_path_str:?})"))?;
    if !path.is_dir() {
        bail!("acquire_dir_path(dir_path_str: {dir_path_str:?}) -> is not a directory")
    }
    Ok(path)
}
