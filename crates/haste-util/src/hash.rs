use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Compute one BLAKE3 digest over the contents of several files, in order.
///
/// Used for asset groups (every scale variant contributes to the hash).
///
/// # Errors
/// Returns an error if any file cannot be read.
pub fn blake3_files<P: AsRef<Path>>(paths: &[P]) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    for path in paths {
        feed_file(&mut hasher, path.as_ref())?;
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Hash a sequence of string parts into a stable key.
///
/// Parts are length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
#[must_use]
pub fn blake3_key<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        let part = part.as_ref();
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn feed_file(hasher: &mut blake3::Hasher, path: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            return Ok(());
        }
        hasher.update(&buffer[..bytes_read]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn hex(data: &[u8]) -> String {
        blake3::hash(data).to_hex().to_string()
    }

    #[test]
    fn test_blake3_single_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        assert_eq!(
            blake3_files(&[file.path()]).unwrap(),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_blake3_files_is_concatenation() {
        let mut a = NamedTempFile::new().unwrap();
        a.write_all(b"hello ").unwrap();
        let mut b = NamedTempFile::new().unwrap();
        b.write_all(b"world").unwrap();

        let hash = blake3_files(&[a.path(), b.path()]).unwrap();
        assert_eq!(hash, hex(b"hello world"));
    }

    #[test]
    fn test_blake3_key_is_boundary_sensitive() {
        assert_ne!(blake3_key(&["ab", "c"]), blake3_key(&["a", "bc"]));
        assert_eq!(blake3_key(&["x", "y"]), blake3_key(&["x", "y"]));
    }

    #[test]
    fn test_blake3_files_not_found() {
        assert!(blake3_files(&[Path::new("/nonexistent/file")]).is_err());
    }
}
