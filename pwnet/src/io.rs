// src/io.rs
//
// Persistence primitives for datasets, checkpoints, summaries and exemplar
// images. An artifact is staged in memory, written to a sibling `.partial`
// file, synced and renamed over its final path.
//
// Dataset arrays are `.npy` files. Their SHA256 is taken from the staged
// bytes, so the digest recorded in the dataset manifest describes exactly
// what was renamed into place, and loading checks the same bytes it parses.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use sha2::{Digest, Sha256};

/// `sha256:<hex>` of a byte buffer.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

fn partial_path(path: &Path) -> PathBuf {
    let mut staged = OsString::from(path.as_os_str());
    staged.push(".partial");
    PathBuf::from(staged)
}

/// Replace `path` with `bytes` in one rename. Missing parent directories are
/// created.
pub fn persist(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let staged = partial_path(path);
    let mut file = File::create(&staged)
        .with_context(|| format!("Failed to create {}", staged.display()))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("Failed to write {}", staged.display()))?;
    fs::rename(&staged, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))
}

/// Encode `array` as `.npy`, persist it and return its digest.
pub fn persist_npy<T: WriteNpyExt>(path: &Path, array: &T) -> Result<String> {
    let mut bytes = Vec::new();
    array
        .write_npy(&mut bytes)
        .with_context(|| format!("Failed to encode {}", path.display()))?;
    persist(path, &bytes)?;
    Ok(sha256_digest(&bytes))
}

/// Read an `.npy` file whose bytes must hash to `expected`.
pub fn load_npy_verified<T: ReadNpyExt>(path: &Path, expected: &str) -> Result<T> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let actual = sha256_digest(&bytes);
    if actual != expected {
        bail!(
            "digest mismatch for {}: manifest says {expected}, file is {actual}",
            path.display()
        );
    }
    T::read_npy(bytes.as_slice()).with_context(|| format!("Failed to decode {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1, Array2};

    #[test]
    fn persist_creates_parents_and_leaves_nothing_staged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights/run/iter_0.json");
        persist(&path, b"{}").unwrap();
        persist(&path, b"{\"epoch\":1}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"epoch\":1}");
        assert!(!partial_path(&path).exists());
    }

    #[test]
    fn npy_digest_matches_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("X_train.npy");
        let x = array![[0.5, -1.0], [2.0, 3.25]];
        let digest = persist_npy(&path, &x).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"\x93NUMPY"));
        assert_eq!(digest, sha256_digest(&bytes));

        let back: Array2<f64> = load_npy_verified(&path, &digest).unwrap();
        assert_eq!(back, x);
    }

    #[test]
    fn wrong_digest_or_dtype_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a_train.npy");
        let digest = persist_npy(&path, &array![1i64, 0, 3]).unwrap();
        assert!(load_npy_verified::<Array1<i64>>(&path, "sha256:00").is_err());
        assert!(load_npy_verified::<Array1<f64>>(&path, &digest).is_err());
    }

    #[test]
    fn sha256_of_known_input() {
        assert_eq!(
            sha256_digest(b"abc"),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
