// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Source-path canonicalisation.
//!
//! DWARF records whatever paths the build system happened to use: absolute
//! paths into the build tree, paths relative to the compilation dir, or —
//! for Android split builds — paths into subtrees that only exist spliced
//! together under the source checkout. Everything here maps such a recorded
//! path to a `(display, on-disk)` pair. POSIX separators only; the kernel
//! build machinery this feeds from never produces anything else.

use crate::backend::KernelDirs;

/// Lexically cleans a path: collapses duplicate separators, resolves `.`
/// and `..` components, drops trailing separators.
pub fn clean(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut out: Vec<&str> = Vec::new();

    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if matches!(out.last(), Some(x) if *x != "..") {
                    out.pop();
                } else if !rooted {
                    out.push("..");
                }
            }
            c => out.push(c),
        }
    }

    let joined = out.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_owned()
    } else {
        joined
    }
}

/// Joins two path fragments and cleans the result.
///
/// Unlike [`std::path::Path::join`], an absolute second fragment does not
/// replace the first one; `join("/obj", "/sub/f.c")` is `/obj/sub/f.c`.
fn join(a: &str, b: &str) -> String {
    clean(&format!("{a}/{b}"))
}

/// Makes a path absolute against the current working directory.
fn abs(path: &str) -> String {
    if path.starts_with('/') {
        return clean(path);
    }
    match std::env::current_dir() {
        Ok(cwd) => join(&cwd.to_string_lossy(), path),
        Err(_) => clean(path),
    }
}

/// Android split-tree resolution.
///
/// Source files for Android may be split between two subdirectories: the
/// common AOSP kernel and the device-specific drivers. The build system
/// references these subdirectories in various ways, which often results in
/// paths to non-existent files being recorded in the debug info.
///
/// The subdirectories are assumed to reside in `src_dir` under the names
/// listed in `delimiters`. If one of the delimiters occurs in `path`, it is
/// stripped together with the path prefix and the remaining file path is
/// appended to `src_dir + delimiter`. Otherwise `path` is treated as a
/// relative path and looked up in every `src_dir + delimiter` in turn.
pub fn clean_path_android(
    path: &str,
    src_dir: &str,
    delimiters: &[String],
    exists: &dyn Fn(&str) -> bool,
) -> Option<(String, String)> {
    // Leftmost delimiter occurrence wins; on a tie, earlier list entries win.
    let mut best: Option<(usize, &str)> = None;
    for delimiter in delimiters {
        if let Some(pos) = path.find(delimiter.as_str()) {
            if best.map_or(true, |(best_pos, _)| pos < best_pos) {
                best = Some((pos, delimiter));
            }
        }
    }

    if let Some((pos, delimiter)) = best {
        let filename = &path[pos + delimiter.len()..];
        let abs_path = clean(&format!("{src_dir}{delimiter}{filename}"));
        return Some((filename.to_owned(), abs_path));
    }

    // None of the delimiters occur in `path`: it is probably a relative path
    // to the source file. Try to look it up in every subdirectory of src_dir.
    for delimiter in delimiters {
        let abs_path = clean(&format!("{src_dir}{delimiter}{path}"));
        if exists(&abs_path) {
            return Some((path.to_owned(), abs_path));
        }
    }

    None
}

/// Maps a recorded source path to a canonical `(display, absolute)` pair.
pub fn clean_path(
    path: &str,
    dirs: &KernelDirs,
    split_build_delimiters: &[String],
) -> (String, String) {
    clean_path_with(path, dirs, split_build_delimiters, &|p| {
        std::path::Path::new(p).exists()
    })
}

/// [`clean_path`] with an injected existence probe.
pub fn clean_path_with(
    path: &str,
    dirs: &KernelDirs,
    split_build_delimiters: &[String],
    exists: &dyn Fn(&str) -> bool,
) -> (String, String) {
    let path = clean(path);

    if let Some(android) = clean_path_android(&path, &dirs.src, split_build_delimiters, exists) {
        return android;
    }

    let abs_path = abs(&path);
    let (display, abs_name) = if let Some(rest) = strip_dir_prefix(&abs_path, &dirs.obj) {
        // Assume the file was built there.
        (rest.to_owned(), join(&dirs.obj, rest))
    } else if let Some(rest) = strip_dir_prefix(&abs_path, &dirs.build_src) {
        // Assume the file was moved from the build dir to the source dir.
        (rest.to_owned(), join(&dirs.src, rest))
    } else {
        // Assume this is a path relative to the source dir.
        (path.clone(), join(&dirs.src, &path))
    };

    let display = clean(&display);
    (
        display.trim_start_matches(['/', '\\']).to_owned(),
        abs_name,
    )
}

fn strip_dir_prefix<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    if dir.is_empty() {
        return None;
    }
    path.strip_prefix(dir)
}
