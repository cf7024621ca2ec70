//! Input file sequencing for `-r`, `-R` and `-M`.
//!
//! The processing loop consumes archives strictly one at a time, in the
//! order resolved here:
//!
//! - `-r file` — a single archive, `-` for stdin.
//! - `-R /any/dir` — every regular file in the directory, name-sorted.
//! - `-R /dir/prefix` — every file whose name starts with `prefix`.
//! - `-R /dir/first:last` — the name-sorted, inclusive range.
//! - `-M /base/d1:d2:…` — the `-r`/`-R` spec re-applied under each listed
//!   sibling directory of `/base/d1`.
//!
//! Hidden files (leading dot) never participate in directory expansion.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use walkdir::WalkDir;

/// Resolved, ordered list of input archives.
pub struct FileSequence {
    files: Vec<PathBuf>,
    pos: usize,
}

fn dir_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("'{}' is not a directory", dir.display());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| anyhow!("can't read '{}': {}", dir.display(), e))?;
        let hidden = entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with('.'))
            .unwrap_or(false);
        if entry.file_type().is_file() && !hidden {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Expand one `-R` spec against a base directory.
fn expand_spec(dir: &Path, spec: &str) -> Result<Vec<PathBuf>> {
    if spec.is_empty() || spec == "." {
        return dir_entries(dir);
    }
    if let Some((first, last)) = spec.split_once(':') {
        let last = last.trim_end_matches(':');
        let all = dir_entries(dir)?;
        return Ok(all
            .into_iter()
            .filter(|p| {
                let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
                name >= first && (last.is_empty() || name <= last)
            })
            .collect());
    }
    let candidate = dir.join(spec);
    if candidate.is_dir() {
        return dir_entries(&candidate);
    }
    let all = dir_entries(dir)?;
    let matched: Vec<PathBuf> = all
        .into_iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(spec))
                .unwrap_or(false)
        })
        .collect();
    if matched.is_empty() {
        bail!("no files matching '{}' in '{}'", spec, dir.display());
    }
    Ok(matched)
}

/// Expand `-M /base/d1:d2:…` into the directory list.
fn expand_mdirs(mdirs: &str) -> Result<Vec<PathBuf>> {
    let mut parts = mdirs.split(':');
    let first = PathBuf::from(parts.next().unwrap_or(""));
    let parent = first
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut dirs = vec![first];
    for alt in parts {
        if alt.is_empty() {
            continue;
        }
        dirs.push(parent.join(alt));
    }
    Ok(dirs)
}

impl FileSequence {
    /// Resolve the input set.  With `-M`, the `-r` name or `-R` spec is
    /// interpreted relative to each directory.
    pub fn setup(
        mdirs: Option<&str>,
        rfile: Option<&str>,
        rspec: Option<&str>,
    ) -> Result<FileSequence> {
        let mut files = Vec::new();
        match mdirs {
            Some(m) => {
                let dirs = expand_mdirs(m)?;
                for dir in &dirs {
                    if let Some(r) = rfile {
                        files.push(dir.join(r));
                    } else if let Some(spec) = rspec {
                        files.extend(expand_spec(dir, spec)?);
                    }
                }
            }
            None => {
                if let Some(r) = rfile {
                    files.push(PathBuf::from(r));
                } else if let Some(spec) = rspec {
                    let p = Path::new(spec);
                    if p.is_dir() {
                        files.extend(dir_entries(p)?);
                    } else {
                        let dir = p.parent().filter(|d| !d.as_os_str().is_empty());
                        let name = p
                            .file_name()
                            .and_then(|n| n.to_str())
                            .ok_or_else(|| anyhow!("invalid file spec '{}'", spec))?;
                        files.extend(expand_spec(
                            dir.unwrap_or_else(|| Path::new(".")),
                            name,
                        )?);
                    }
                }
            }
        }
        Ok(FileSequence { files, pos: 0 })
    }

    /// A sequence over an explicit path list (tests, library callers).
    pub fn from_paths(paths: Vec<PathBuf>) -> FileSequence {
        FileSequence { files: paths, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Iterator for FileSequence {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        let p = self.files.get(self.pos)?.clone();
        self.pos += 1;
        Some(p)
    }
}
