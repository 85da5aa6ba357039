use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub const BACKGROUND_IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to prepare backgrounds directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to list backgrounds directory '{path}': {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Named background images available for `replace_background`.
///
/// The entry list is a snapshot; it only changes through [`BackgroundCatalog::refresh`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundCatalog {
    dir: PathBuf,
    entries: Vec<String>,
}

impl BackgroundCatalog {
    pub fn scan(dir: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let mut catalog = Self::empty(dir);
        catalog.refresh()?;
        Ok(catalog)
    }

    pub fn empty(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            entries: Vec::new(),
        }
    }

    /// Catalog over a known entry list, without touching the filesystem.
    pub fn from_entries(dir: impl Into<PathBuf>, mut entries: Vec<String>) -> Self {
        entries.sort();
        Self {
            dir: dir.into(),
            entries,
        }
    }

    pub fn refresh(&mut self) -> Result<(), CatalogError> {
        self.entries = scan_background_dir(self.dir.as_path())?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        self.dir.as_path()
    }

    pub fn entries(&self) -> &[String] {
        self.entries.as_slice()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Finds the entry whose stem equals the requested name's stem, ignoring
    /// case, so `"Beach"`, `"beach.JPG"` and `"beach.png"` all hit `beach.png`.
    pub fn match_by_name(&self, requested: &str) -> Option<&str> {
        let wanted = stem_key(requested.trim());
        if wanted.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|entry| stem_key(entry.as_str()) == wanted)
            .map(String::as_str)
    }

    pub fn path_for(&self, entry: &str) -> PathBuf {
        self.dir.join(entry)
    }
}

pub fn stem_key(name: &str) -> String {
    let path = Path::new(name);
    let stem = match path.extension() {
        Some(_) => path.file_stem().and_then(|v| v.to_str()).unwrap_or(name),
        None => name,
    };
    stem.to_lowercase()
}

pub fn is_background_image_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|v| v.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            BACKGROUND_IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn scan_background_dir(dir: &Path) -> Result<Vec<String>, CatalogError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|source| CatalogError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        return Ok(Vec::new());
    }
    let read_dir = fs::read_dir(dir).map_err(|source| CatalogError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut entries = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|source| CatalogError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;
        if !entry.path().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if is_background_image_name(name.as_str()) {
            entries.push(name);
        }
    }
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("backdrop_catalog_{label}_{}", Uuid::new_v4()))
    }

    #[test]
    fn scan_creates_missing_directory_and_returns_empty() {
        let dir = temp_dir("missing");
        assert!(!dir.exists());

        let catalog = BackgroundCatalog::scan(dir.as_path()).expect("scan should succeed");
        assert!(catalog.is_empty());
        assert!(dir.is_dir());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn scan_filters_extensions_case_insensitively_and_sorts() {
        let dir = temp_dir("filter");
        fs::create_dir_all(dir.join("nested.png")).expect("nested dir");
        for name in ["sunset.JPG", "beach.png", "notes.txt", "office.jpeg", "raw.webp"] {
            fs::write(dir.join(name), b"x").expect("fixture write");
        }

        let catalog = BackgroundCatalog::scan(dir.as_path()).expect("scan should succeed");
        assert_eq!(
            catalog.entries(),
            &[
                String::from("beach.png"),
                String::from("office.jpeg"),
                String::from("sunset.JPG")
            ][..]
        );

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn refresh_picks_up_new_files() {
        let dir = temp_dir("refresh");
        let mut catalog = BackgroundCatalog::scan(dir.as_path()).expect("scan should succeed");
        assert!(catalog.is_empty());

        fs::write(dir.join("bg4.png"), b"x").expect("fixture write");
        assert!(catalog.is_empty());
        catalog.refresh().expect("refresh should succeed");
        assert_eq!(catalog.entries(), &[String::from("bg4.png")][..]);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn match_by_name_ignores_extension_and_case() {
        let catalog = BackgroundCatalog::from_entries(
            "backgrounds",
            vec![String::from("bg4.jpg"), String::from("Beach.png")],
        );
        assert_eq!(catalog.entries()[0], "Beach.png");

        assert_eq!(catalog.match_by_name("beach"), Some("Beach.png"));
        assert_eq!(catalog.match_by_name("BEACH.jpeg"), Some("Beach.png"));
        assert_eq!(catalog.match_by_name(" bg4.png "), Some("bg4.jpg"));
        assert_eq!(catalog.match_by_name("bg"), None);
        assert_eq!(catalog.match_by_name(""), None);
        assert_eq!(
            catalog.path_for("bg4.jpg"),
            PathBuf::from("backgrounds").join("bg4.jpg")
        );
    }

    #[test]
    fn stem_key_strips_only_the_last_extension() {
        assert_eq!(stem_key("city.night.PNG"), "city.night");
        assert_eq!(stem_key("Forest"), "forest");
    }
}
