//! Filesystem access to the markdown corpus.
//!
//! All document paths handled by the engine are relative to the configured
//! root and use `/` separators. [`DocumentFiles`] resolves them, rejects
//! paths that would escape the root, and enumerates the corpus with the
//! configured include/exclude globs.

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::config::StorageConfig;
use crate::error::{Error, Result};

pub struct DocumentFiles {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl DocumentFiles {
    pub fn new(root: impl Into<PathBuf>, include: &[String], exclude: &[String]) -> Result<Self> {
        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/.obsidian/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(exclude.iter().cloned());

        Ok(Self {
            root: root.into(),
            include: build_globset(include)?,
            exclude: build_globset(&default_excludes)?,
        })
    }

    pub fn from_config(storage: &StorageConfig) -> Result<Self> {
        Self::new(&storage.root, &storage.include_globs, &storage.exclude_globs)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a relative document path.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if path.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::Validation(format!(
                "invalid document path '{}': must be relative to the memory root",
                path
            )));
        }
        Ok(self.root.join(relative))
    }

    pub async fn read(&self, path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("document '{}'", path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write a document, creating parent directories as needed.
    pub async fn write(&self, path: &str, text: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, text).await?;
        Ok(())
    }

    /// Delete a document. Returns false if it did not exist.
    pub async fn delete(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&full).await?)
    }

    /// Every document under the root matching the include globs, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let include = self.include.clone();
        let exclude = self.exclude.clone();
        tokio::task::spawn_blocking(move || scan(&root, &include, &exclude))
            .await
            .map_err(|e| Error::Transient(format!("directory scan aborted: {}", e)))?
    }
}

fn scan(root: &Path, include: &GlobSet, exclude: &GlobSet) -> Result<Vec<String>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| Error::Transient(format!("directory scan failed: {}", e)))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude.is_match(&rel_str) || !include.is_match(&rel_str) {
            continue;
        }
        paths.push(rel_str);
    }

    paths.sort();
    Ok(paths)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::Validation(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Validation(format!("invalid glob set: {}", e)))
}

/// Hex SHA-256 of a document's full text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Display title derived from a file name: `api_design.md` → `Api Design`.
pub fn title_from_path(path: &str) -> String {
    let stem = Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut title = String::with_capacity(stem.len());
    let mut prev_alpha = false;
    for c in stem.replace('_', " ").chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                title.extend(c.to_lowercase());
            } else {
                title.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            title.push(c);
            prev_alpha = false;
        }
    }
    title
}

/// File name for a document titled `title`: `API Design` → `api_design.md`.
pub fn file_name_for_title(title: &str) -> Result<String> {
    let slug: String = title
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    if slug.is_empty() || slug.chars().all(|c| c == '.') {
        return Err(Error::Validation(format!(
            "title '{}' does not yield a usable file name",
            title
        )));
    }
    Ok(format!("{}.md", slug))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn files(root: &Path) -> DocumentFiles {
        DocumentFiles::new(root, &["**/*.md".to_string()], &[]).unwrap()
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let tmp = TempDir::new().unwrap();
        let fs = files(tmp.path());

        fs.write("projects/a.md", "# A\n").await.unwrap();
        assert_eq!(fs.read("projects/a.md").await.unwrap(), "# A\n");
        assert!(fs.exists("projects/a.md").await.unwrap());
        assert!(fs.delete("projects/a.md").await.unwrap());
        assert!(!fs.delete("projects/a.md").await.unwrap());

        let err = fs.read("projects/a.md").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_filtered() {
        let tmp = TempDir::new().unwrap();
        let fs = files(tmp.path());
        fs.write("projects/b.md", "b").await.unwrap();
        fs.write("main.md", "m").await.unwrap();
        fs.write("concepts/a.md", "a").await.unwrap();
        fs.write("files_index.json", "{}").await.unwrap();
        fs.write(".git/HEAD.md", "x").await.unwrap();

        let listed = fs.list().await.unwrap();
        assert_eq!(listed, vec!["concepts/a.md", "main.md", "projects/b.md"]);
    }

    #[tokio::test]
    async fn test_list_missing_root_is_empty() {
        let tmp = TempDir::new().unwrap();
        let fs = files(&tmp.path().join("nope"));
        assert!(fs.list().await.unwrap().is_empty());
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let fs = files(Path::new("/tmp/mem"));
        assert!(fs.resolve("../etc/passwd").is_err());
        assert!(fs.resolve("/etc/passwd").is_err());
        assert!(fs.resolve("").is_err());
        assert!(fs.resolve("projects/a.md").is_ok());
    }

    #[test]
    fn test_title_from_path() {
        assert_eq!(title_from_path("projects/test_project.md"), "Test Project");
        assert_eq!(title_from_path("concepts/API_design.md"), "Api Design");
        assert_eq!(title_from_path("main.md"), "Main");
    }

    #[test]
    fn test_file_name_for_title() {
        assert_eq!(file_name_for_title("API Design").unwrap(), "api_design.md");
        assert_eq!(file_name_for_title("  Two   Words ").unwrap(), "two_words.md");
        assert!(file_name_for_title("   ").is_err());
        assert!(file_name_for_title("..").is_err());
    }

    #[test]
    fn test_word_count_and_hash() {
        assert_eq!(word_count("one two\nthree\t four"), 4);
        assert_eq!(word_count(""), 0);
        assert_eq!(content_hash("a"), content_hash("a"));
        assert_ne!(content_hash("a"), content_hash("b"));
    }
}
