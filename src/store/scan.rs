//! Directory scanning helpers for the JSON strategy.
//!
//! Sequence-named files (`img1`, `img2`, ..., `img10`) must come out in
//! numeric order, so every listing is sorted with [`natural_cmp`].

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Supported image file extensions
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "tif", "tiff"];

/// Supported 3D mesh file extensions
pub const OBJECT_MODEL_EXTENSIONS: [&str; 4] = ["obj", "ply", "3ds", "fbx"];

/// Compare two strings treating embedded digit runs as numbers
///
/// Ties between equal numbers with different zero padding are broken by the
/// shorter run first, and the final fallback is plain byte order so the
/// ordering is total.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let l_run = take_digits(&mut left);
                let r_run = take_digits(&mut right);
                let ordering = compare_digit_runs(&l_run, &r_run);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(l), Some(r)) => {
                let ordering = l.to_ascii_lowercase().cmp(&r.to_ascii_lowercase());
                if ordering != Ordering::Equal {
                    return ordering;
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(&c) = chars.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        run.push(c);
        chars.next();
    }
    run
}

fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let a_trimmed = a.trim_start_matches('0');
    let b_trimmed = b.trim_start_matches('0');
    a_trimmed
        .len()
        .cmp(&b_trimmed.len())
        .then_with(|| a_trimmed.cmp(b_trimmed))
        .then_with(|| a.len().cmp(&b.len()))
}

/// Check a path's extension against a list (case-insensitive)
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map(|ext| extensions.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// List the file names in `dir` (not recursive) with one of `extensions`,
/// naturally sorted
pub fn list_files(dir: &Path, extensions: &[&str]) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || !has_extension(&path, extensions) {
            continue;
        }
        if let Some(name) = path.file_name() {
            names.push(name.to_string_lossy().to_string());
        }
    }
    names.sort_by(|a, b| natural_cmp(a, b));
    Ok(names)
}

/// Mesh file found by [`find_object_models`]
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFile {
    /// Path relative to the scan root, '/' separated
    pub relative: String,
    pub file_name: String,
    pub directory: PathBuf,
}

/// Recursively find mesh files below `root`, at most one per directory
///
/// Within a directory the naturally-first matching file wins. The result is
/// naturally sorted by relative path.
pub fn find_object_models(root: &Path) -> Vec<ModelFile> {
    let mut seen_dirs = HashSet::new();
    let mut models = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(true)
        .sort_by(|a, b| natural_cmp(&a.file_name().to_string_lossy(), &b.file_name().to_string_lossy()));

    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() || !has_extension(path, &OBJECT_MODEL_EXTENSIONS) {
            continue;
        }
        let Some(directory) = path.parent() else {
            continue;
        };
        if !seen_dirs.insert(directory.to_path_buf()) {
            continue;
        }

        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");

        models.push(ModelFile {
            relative,
            file_name: entry.file_name().to_string_lossy().to_string(),
            directory: directory.to_path_buf(),
        });
    }

    models.sort_by(|a, b| natural_cmp(&a.relative, &b.relative));
    models
}
