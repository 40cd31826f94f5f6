//! Files inside upload and run directories.

use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use walkdir::WalkDir;

/// Name of the layout file in both upload and run directories.
pub const INPUT_FILE: &str = "input.gds";

/// Directory (at any depth) holding the final layout of a successful run.
const OUTPUT_STEP_DIR: &str = "KLayout.GenerateID";

/// Locate `**/KLayout.GenerateID/<top_cell>.gds` under `run_dir`.
///
/// The precheck flow nests its output under `<top_cell>/<timestamp>/`, so
/// the search is recursive; the first match in sorted order wins.
pub fn find_output(run_dir: &Path, top_cell: &str) -> Option<PathBuf> {
    let file_name = format!("{}.gds", top_cell);
    WalkDir::new(run_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .find(|entry| {
            entry.file_name().to_str() == Some(file_name.as_str())
                && entry
                    .path()
                    .parent()
                    .and_then(Path::file_name)
                    .and_then(|n| n.to_str())
                    == Some(OUTPUT_STEP_DIR)
        })
        .map(|entry| entry.into_path())
}

/// Gzip'd tarball of `dir`, with every entry rooted at `root_name/`.
/// Blocking; call from `spawn_blocking` in async code.
pub fn archive_dir(dir: &Path, root_name: &str) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(root_name, dir)?;
    let tar_bytes = builder.into_inner()?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes)?;
    encoder.finish()
}

/// Remove a directory tree, treating "already gone" as success.
pub async fn remove_dir_if_exists(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
