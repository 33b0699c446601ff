use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::text::layout::Viewport;

pub const VERTICAL_PADDING: usize = 1;
pub const HORIZONTAL_PADDING: usize = 2;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReaderSettings {
    pub line_spacing: usize,
    pub library_paths: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub max_list_pages: u32,
    pub max_fragments: u32,
    pub content_cache_chapters: usize,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            line_spacing: 1,
            library_paths: Vec::new(),
            cache_dir: None,
            request_timeout_secs: 60,
            user_agent: DEFAULT_USER_AGENT.into(),
            max_list_pages: 500,
            max_fragments: 64,
            content_cache_chapters: 64,
        }
    }
}

impl ReaderSettings {
    /// Expands `~` in paths and clamps limits that must stay positive.
    pub fn normalize(mut self) -> Self {
        self.library_paths = self
            .library_paths
            .into_iter()
            .map(|path| expand_home(&path))
            .collect();
        self.cache_dir = self.cache_dir.take().map(|path| expand_home(&path));
        let agent = self.user_agent.trim();
        self.user_agent = if agent.is_empty() {
            DEFAULT_USER_AGENT.into()
        } else {
            agent.to_string()
        };
        self.request_timeout_secs = self.request_timeout_secs.max(1);
        self.max_list_pages = self.max_list_pages.max(1);
        self.max_fragments = self.max_fragments.max(1);
        self.content_cache_chapters = self.content_cache_chapters.max(1);
        self
    }

    pub fn viewport(&self, width: usize, height: usize) -> Viewport {
        Viewport {
            width,
            height,
            vertical_padding: VERTICAL_PADDING,
            horizontal_padding: HORIZONTAL_PADDING,
            line_spacing: self.line_spacing,
        }
    }

    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| default_data_dir().join("cache"))
    }
}

pub fn load_settings(path: &Path) -> io::Result<ReaderSettings> {
    let bytes = fs::read(path)?;
    let settings: ReaderSettings = serde_json::from_slice(&bytes)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(settings.normalize())
}

/// Loads the settings file, writing defaults when it does not exist yet.
pub fn load_or_init_settings(path: &Path) -> io::Result<ReaderSettings> {
    match load_settings(path) {
        Ok(settings) => Ok(settings),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let settings = ReaderSettings::default();
            save_settings(path, &settings)?;
            Ok(settings)
        }
        Err(err) => Err(err),
    }
}

pub fn save_settings(path: &Path, settings: &ReaderSettings) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut on_disk = settings.clone();
    on_disk.library_paths = on_disk
        .library_paths
        .iter()
        .map(|path| collapse_home(path))
        .collect();
    on_disk.cache_dir = on_disk.cache_dir.as_deref().map(collapse_home);
    let json = serde_json::to_vec_pretty(&on_disk)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json)?;
    fs::rename(tmp_path, path)
}

pub fn default_config_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "natsurei", "novel_reader")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "natsurei", "novel_reader")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_settings_path(root: &Path) -> PathBuf {
    root.join("settings.json")
}

pub fn default_progress_path(root: &Path) -> PathBuf {
    root.join("progress.json")
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

fn collapse_home(path: &Path) -> PathBuf {
    let Some(home) = home_dir() else {
        return path.to_path_buf();
    };
    if path == home {
        return PathBuf::from("~");
    }
    match path.strip_prefix(&home) {
        Ok(rest) => Path::new("~").join(rest),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = TempDir::new().expect("temp dir");
        let path = default_settings_path(dir.path());
        let settings = load_or_init_settings(&path).expect("load defaults");
        assert_eq!(settings, ReaderSettings::default());
        assert!(path.exists(), "defaults should be written back");
    }

    #[test]
    fn roundtrip_keeps_custom_values() {
        let dir = TempDir::new().expect("temp dir");
        let path = default_settings_path(dir.path());
        let settings = ReaderSettings {
            line_spacing: 0,
            library_paths: vec![dir.path().join("books")],
            max_fragments: 8,
            ..ReaderSettings::default()
        };
        save_settings(&path, &settings).expect("save");
        let loaded = load_settings(&path).expect("load");
        assert_eq!(loaded.line_spacing, 0);
        assert_eq!(loaded.library_paths, vec![dir.path().join("books")]);
        assert_eq!(loaded.max_fragments, 8);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = TempDir::new().expect("temp dir");
        let path = default_settings_path(dir.path());
        fs::write(&path, r#"{"lineSpacing": 2, "userAgent": "  "}"#).expect("write");
        let loaded = load_settings(&path).expect("load");
        assert_eq!(loaded.line_spacing, 2);
        assert_eq!(loaded.max_list_pages, 500);
        assert_eq!(loaded.user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn corrupt_file_is_invalid_data() {
        let dir = TempDir::new().expect("temp dir");
        let path = default_settings_path(dir.path());
        fs::write(&path, "{ not json").expect("write");
        let err = load_settings(&path).expect_err("should fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn viewport_uses_fixed_paddings() {
        let settings = ReaderSettings::default();
        let viewport = settings.viewport(80, 24);
        assert_eq!(viewport.vertical_padding, VERTICAL_PADDING);
        assert_eq!(viewport.horizontal_padding, HORIZONTAL_PADDING);
        assert_eq!(viewport.line_spacing, 1);
    }
}
