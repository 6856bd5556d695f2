//! Finding the audio files an instrument refers to.
//!
//! Instruments are often moved between machines, so the stored path is
//! only a hint. The search falls back to the usual library layouts and
//! finally to matching the note token in the file name.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::MissingResourceError;

static NOTE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)-([A-G][#b]?\d+)-").expect("note token pattern is valid"));

const ANCESTOR_LEVELS: usize = 6;
const MAX_HINT_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct SampleQuery<'a> {
    /// Path stored in the instrument: a file, or a directory holding
    /// `file_name`. Absolute or relative to `instrument_dir`.
    pub stored_path: Option<&'a str>,
    pub file_name: &'a str,
    pub instrument_dir: &'a Path,
    pub instrument_stem: &'a str,
}

pub trait SampleLocator {
    fn locate(&self, query: &SampleQuery<'_>) -> Result<PathBuf, MissingResourceError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsSampleLocator;

/// Lexically resolves `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
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
    out
}

impl FsSampleLocator {
    fn from_stored_path(&self, query: &SampleQuery<'_>, stored: &str) -> Option<PathBuf> {
        let stored = Path::new(stored);
        let base = if stored.is_absolute() {
            stored.to_path_buf()
        } else {
            normalize(&query.instrument_dir.join(stored))
        };
        if base.is_file() {
            return Some(base);
        }
        let joined = base.join(query.file_name);
        (base.is_dir() && joined.is_file()).then_some(joined)
    }

    fn candidate_dirs(&self, query: &SampleQuery<'_>, stored: Option<&str>) -> Vec<PathBuf> {
        let dir = query.instrument_dir;
        let stem = query.instrument_stem;
        let mut dirs = vec![
            dir.to_path_buf(),
            dir.join(stem),
            normalize(&dir.join("..").join(stem)),
            normalize(&dir.join("..").join("Samples").join(stem)),
        ];

        // Libraries often keep instruments and samples in sibling trees,
        // so re-root the tail of the stored path at each ancestor.
        if let Some(stored) = stored {
            let parts: Vec<&str> = stored.split('/').filter(|p| !p.is_empty()).collect();
            for depth in 1..parts.len().min(MAX_HINT_DEPTH + 1) {
                let tail: PathBuf = parts[parts.len() - depth..].iter().collect();
                for ancestor in dir.ancestors().take(ANCESTOR_LEVELS) {
                    let candidate = normalize(&ancestor.join(&tail));
                    if candidate.is_dir() && !dirs.contains(&candidate) {
                        dirs.push(candidate);
                    }
                }
            }
        }
        dirs
    }

    fn search_dir(&self, dir: &Path, file_name: &str) -> Option<PathBuf> {
        if !dir.is_dir() {
            return None;
        }
        let exact = dir.join(file_name);
        if exact.is_file() {
            return Some(exact);
        }

        let entries: Vec<String> = match fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(e) => {
                log::debug!("Cannot list {}: {e}", dir.display());
                return None;
            }
        };

        let wanted = file_name.to_lowercase();
        if let Some(found) = entries.iter().find(|f| f.to_lowercase() == wanted) {
            return Some(dir.join(found));
        }

        let note = NOTE_TOKEN.captures(file_name)?.get(1)?.as_str().to_uppercase();
        entries
            .iter()
            .find(|f| {
                NOTE_TOKEN
                    .captures(f)
                    .and_then(|c| c.get(1))
                    .is_some_and(|m| m.as_str().to_uppercase() == note)
            })
            .map(|f| dir.join(f))
    }
}

impl SampleLocator for FsSampleLocator {
    fn locate(&self, query: &SampleQuery<'_>) -> Result<PathBuf, MissingResourceError> {
        let stored = query
            .stored_path
            .map(|p| p.replace('\\', "/"))
            .filter(|p| !p.is_empty());
        let file_name = query.file_name.replace('\\', "/");
        let query = SampleQuery {
            file_name: &file_name,
            ..*query
        };

        if let Some(found) = stored
            .as_deref()
            .and_then(|s| self.from_stored_path(&query, s))
        {
            return Ok(found);
        }

        let dirs = self.candidate_dirs(&query, stored.as_deref());
        for dir in &dirs {
            if let Some(found) = self.search_dir(dir, &file_name) {
                log::debug!("Found '{}' in {}", file_name, dir.display());
                return Ok(found);
            }
        }

        Err(MissingResourceError {
            sample: file_name,
            searched: dirs.len() + usize::from(stored.is_some()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"RIFF").unwrap();
    }

    fn query<'a>(dir: &'a Path, stored: Option<&'a str>, name: &'a str) -> SampleQuery<'a> {
        SampleQuery {
            stored_path: stored,
            file_name: name,
            instrument_dir: dir,
            instrument_stem: "Strings",
        }
    }

    #[test]
    fn test_relative_stored_file() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("samples/piano C3.wav"));
        let found = FsSampleLocator
            .locate(&query(tmp.path(), Some("samples\\piano C3.wav"), "piano C3.wav"))
            .unwrap();
        assert_eq!(found, tmp.path().join("samples/piano C3.wav"));
    }

    #[test]
    fn test_stored_directory_plus_name() {
        let tmp = tempfile::tempdir().unwrap();
        let abs = tmp.path().join("lib/wav");
        touch(&abs.join("a.wav"));
        let stored = abs.to_string_lossy().to_string();
        let found = FsSampleLocator
            .locate(&query(tmp.path(), Some(&stored), "a.wav"))
            .unwrap();
        assert_eq!(found, abs.join("a.wav"));
    }

    #[test]
    fn test_case_insensitive_in_instrument_subdir() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("Strings/VIOLIN-C3.WAV"));
        let found = FsSampleLocator
            .locate(&query(tmp.path(), Some("/old/machine/gone"), "violin-c3.wav"))
            .unwrap();
        assert_eq!(found, tmp.path().join("Strings/VIOLIN-C3.WAV"));
    }

    #[test]
    fn test_sibling_tree_from_stored_path_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let exs_dir = tmp.path().join("Library/Logic EXS/Strings");
        fs::create_dir_all(&exs_dir).unwrap();
        touch(&tmp.path().join("Library/WAV/Violins/v1.wav"));
        let found = FsSampleLocator
            .locate(&query(&exs_dir, Some("C:\\Users\\me\\WAV\\Violins"), "v1.wav"))
            .unwrap();
        assert_eq!(found, tmp.path().join("Library/WAV/Violins/v1.wav"));
    }

    #[test]
    fn test_note_token_match() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("Strings-Legato-C#3-v1.wav"));
        let found = FsSampleLocator
            .locate(&query(tmp.path(), None, "Old Name-c#3-x.wav"))
            .unwrap();
        assert_eq!(found, tmp.path().join("Strings-Legato-C#3-v1.wav"));
    }

    #[test]
    fn test_missing_sample() {
        let tmp = tempfile::tempdir().unwrap();
        let err = FsSampleLocator
            .locate(&query(tmp.path(), Some("nowhere"), "gone.wav"))
            .unwrap_err();
        assert_eq!(err.sample, "gone.wav");
        assert!(err.searched >= 4);
    }
}
