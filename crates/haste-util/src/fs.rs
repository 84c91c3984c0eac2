use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Read a file to string, replacing invalid UTF-8 sequences with the replacement character.
///
/// # Errors
/// Returns an error if the file cannot be read.
pub fn read_to_string_lossy(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Atomically write bytes to a file by writing a sibling temp file then renaming it.
///
/// # Errors
/// Returns an error if the write or rename fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id()
    ));

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        // Windows refuses to rename over an existing file.
        if cfg!(windows) {
            fs::copy(&temp_path, path)?;
            let _ = fs::remove_file(&temp_path);
            return Ok(());
        }
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}

/// Modification time of a file in milliseconds since the Unix epoch.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn mtime_ms(path: &Path) -> Option<u64> {
    path.metadata()
        .ok()?
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
}

/// Lexically normalize a path: drops `.` components and folds `..` into
/// its parent. Never touches the filesystem, so symlinks are not resolved.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Whether `path` is `root` itself or lives underneath it.
#[must_use]
pub fn is_descendant(root: &Path, path: &Path) -> bool {
    path.starts_with(root)
}

/// `path` relative to `root`, with `/` separators. `None` if `path` is not under `root`.
#[must_use]
pub fn relative_slash(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Recursively list the files under `root`.
///
/// `skip` is consulted for every entry below the root; a skipped directory
/// is not descended into. `keep` filters the files that are returned.
/// Entries that cannot be stat'ed (broken symlinks) are ignored.
///
/// # Errors
/// Returns an error if `root` itself cannot be read.
pub fn collect_files<S, K>(root: &Path, skip: S, keep: K) -> io::Result<Vec<PathBuf>>
where
    S: Fn(&Path) -> bool,
    K: Fn(&Path) -> bool,
{
    fs::read_dir(root)?;

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !skip(entry.path()));

    for entry in walker.flatten() {
        if entry.file_type().is_file() && keep(entry.path()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_read_to_string_lossy_invalid_utf8() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0x48, 0x65, 0x6c, 0x6c, 0x6f, 0x80, 0x81])
            .unwrap();
        file.flush().unwrap();

        let content = read_to_string_lossy(file.path()).unwrap();
        assert!(content.starts_with("Hello"));
        assert!(content.contains('\u{FFFD}'));
    }

    #[test]
    fn test_atomic_write_creates_parent_and_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");

        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");

        let entries: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d.js")), PathBuf::from("/a/c/d.js"));
        assert_eq!(normalize(Path::new("/a/./b/")), PathBuf::from("/a/b"));
        assert_eq!(normalize(Path::new("../x")), PathBuf::from("../x"));
    }

    #[test]
    fn test_is_descendant_is_component_wise() {
        assert!(is_descendant(Path::new("/proj"), Path::new("/proj/a.js")));
        assert!(is_descendant(Path::new("/proj"), Path::new("/proj")));
        assert!(!is_descendant(Path::new("/proj"), Path::new("/project/a.js")));
    }

    #[test]
    fn test_relative_slash() {
        assert_eq!(
            relative_slash(Path::new("/proj"), Path::new("/proj/lib/a.js")).as_deref(),
            Some("lib/a.js")
        );
        assert!(relative_slash(Path::new("/proj"), Path::new("/other/a.js")).is_none());
    }

    #[test]
    fn test_collect_files_skips_directories() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("ignored")).unwrap();
        fs::write(dir.path().join("src/a.js"), "").unwrap();
        fs::write(dir.path().join("src/b.txt"), "").unwrap();
        fs::write(dir.path().join("ignored/c.js"), "").unwrap();

        let files = collect_files(
            dir.path(),
            |p| p.ends_with("ignored"),
            |p| p.extension().is_some_and(|e| e == "js"),
        )
        .unwrap();

        assert_eq!(files, vec![dir.path().join("src/a.js")]);
    }

    #[test]
    fn test_collect_files_missing_root() {
        let result = collect_files(Path::new("/nonexistent/root"), |_| false, |_| true);
        assert!(result.is_err());
    }
}
