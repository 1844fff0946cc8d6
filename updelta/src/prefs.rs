// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Durable key-value storage for state that must survive an interruption.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid preference key: {0:?}")]
    InvalidKey(String),
    #[error("Preference {key:?} is not an integer: {value:?}")]
    InvalidInt { key: String, value: String },
    #[error("Failed to read preference file: {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
    #[error("Failed to write preference file: {0:?}")]
    WriteFile(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A string key-value store. Integers are stored as their decimal string
/// representation.
pub trait Prefs {
    fn get_string(&self, key: &str) -> Result<Option<String>>;

    fn set_string(&mut self, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Removing a key that does not exist is not an error.
    fn delete(&mut self, key: &str) -> Result<()>;

    fn get_int(&self, key: &str) -> Result<Option<i64>> {
        let Some(value) = self.get_string(key)? else {
            return Ok(None);
        };

        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidInt {
                key: key.to_owned(),
                value,
            })
    }

    fn set_int(&mut self, key: &str, value: i64) -> Result<()> {
        self.set_string(key, &value.to_string())
    }
}

impl<P: Prefs + ?Sized> Prefs for &mut P {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        (**self).get_string(key)
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        (**self).set_string(key, value)
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn get_int(&self, key: &str) -> Result<Option<i64>> {
        (**self).get_int(key)
    }

    fn set_int(&mut self, key: &str, value: i64) -> Result<()> {
        (**self).set_int(key, value)
    }
}

/// In-memory store. Nothing survives the process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryPrefs {
    values: BTreeMap<String, String>,
}

impl MemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }
}

impl Prefs for MemoryPrefs {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}

/// Store backed by a directory with one file per key. Values are replaced
/// atomically by writing to a temporary file and renaming it over the old one.
#[derive(Clone, Debug)]
pub struct FilePrefs {
    dir: PathBuf,
}

impl FilePrefs {
    /// Open the store at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::WriteFile(dir.clone(), e))?;

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(Error::InvalidKey(key.to_owned()));
        }

        Ok(self.dir.join(key))
    }
}

impl Prefs for FilePrefs {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key)?;

        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::ReadFile(path, e)),
        }
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        let path = self.key_path(key)?;
        trace!("Setting {key} in {:?}", self.dir);

        let mut file =
            NamedTempFile::new_in(&self.dir).map_err(|e| Error::WriteFile(path.clone(), e))?;
        file.write_all(value.as_bytes())
            .map_err(|e| Error::WriteFile(path.clone(), e))?;
        file.as_file()
            .sync_all()
            .map_err(|e| Error::WriteFile(path.clone(), e))?;
        file.persist(&path)
            .map_err(|e| Error::WriteFile(path.clone(), e.error))?;

        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::WriteFile(path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn exercise(prefs: &mut dyn Prefs) {
        assert_eq!(prefs.get_string("foo").unwrap(), None);
        assert_eq!(prefs.get_int("foo").unwrap(), None);

        prefs.set_string("foo", "bar").unwrap();
        assert_eq!(prefs.get_string("foo").unwrap().as_deref(), Some("bar"));
        assert_matches!(prefs.get_int("foo"), Err(Error::InvalidInt { .. }));

        prefs.set_int("foo", -1).unwrap();
        assert_eq!(prefs.get_int("foo").unwrap(), Some(-1));
        prefs.set_int("foo", i64::MAX).unwrap();
        assert_eq!(prefs.get_int("foo").unwrap(), Some(i64::MAX));

        prefs.delete("foo").unwrap();
        assert_eq!(prefs.get_string("foo").unwrap(), None);
        prefs.delete("foo").unwrap();
    }

    #[test]
    fn memory_prefs() {
        let mut prefs = MemoryPrefs::new();
        exercise(&mut prefs);
        assert!(prefs.is_empty());
    }

    #[test]
    fn file_prefs() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut prefs = FilePrefs::new(temp_dir.path().join("prefs")).unwrap();
        exercise(&mut prefs);

        prefs.set_int("update-state-next-operation", 5).unwrap();

        // A second instance sees the same values.
        let prefs2 = FilePrefs::new(prefs.dir()).unwrap();
        assert_eq!(
            prefs2.get_int("update-state-next-operation").unwrap(),
            Some(5)
        );
    }

    #[test]
    fn file_prefs_invalid_key() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut prefs = FilePrefs::new(temp_dir.path()).unwrap();

        for key in ["", "../escape", "a/b", "a b"] {
            assert_matches!(prefs.set_string(key, "x"), Err(Error::InvalidKey(_)));
            assert_matches!(prefs.get_string(key), Err(Error::InvalidKey(_)));
        }
    }

    #[test]
    fn forward_through_mut_ref() {
        fn set_one(mut prefs: impl Prefs) {
            prefs.set_int("a", 1).unwrap();
        }

        let mut prefs = MemoryPrefs::new();
        set_one(&mut prefs);
        assert_eq!(prefs.get_int("a").unwrap(), Some(1));
    }
}
