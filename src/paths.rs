use fs4::fs_std::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::caption::Page;
use crate::error::{PipelineError, Result};

const BASE_DIR_ENV: &str = "MANGA_CAPTION_DIR";
const STORE_FILE_NAME: &str = "captions.json";

pub(crate) fn base_dir() -> PathBuf {
    if let Some(dir) = base_dir_override() {
        return dir;
    }
    home_join(".manga-caption").unwrap_or_else(|| PathBuf::from(".manga-caption"))
}

fn base_dir_override() -> Option<PathBuf> {
    std::env::var(BASE_DIR_ENV)
        .ok()
        .and_then(|value| normalize_dir(&value))
}

fn home_join(suffix: &str) -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(suffix))
        }
    })
}

pub(crate) fn normalize_dir(value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let expanded = expand_tilde(trimmed);
    let mut normalized = PathBuf::new();
    for component in Path::new(&expanded).components() {
        normalized.push(component.as_os_str());
    }
    Some(normalized)
}

fn expand_tilde(value: &str) -> String {
    if value == "~" || value.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            let home = home.trim();
            if home.is_empty() {
                return value.to_string();
            }
            return format!("{}{}", home, &value[1..]);
        }
    }
    value.to_string()
}

/// On-disk layout of pipeline artifacts below one data directory.
///
/// ```text
/// <root>/captions.json
/// <root>/pages/<page-id>-<page-slug>/patches/<caption-slug>.png
/// <root>/pages/<page-id>-<page-slug>/cleaned.png
/// <root>/locks/page-<page-id>.lock
/// ```
///
/// The id prefix keeps page directories distinct even when two slugs
/// sanitize to the same name.
#[derive(Debug, Clone)]
pub struct PageLayout {
    root: PathBuf,
}

impl PageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store_path(&self) -> PathBuf {
        self.root.join(STORE_FILE_NAME)
    }

    pub fn page_dir(&self, page: &Page) -> PathBuf {
        self.root
            .join("pages")
            .join(format!("{}-{}", page.id, sanitize_component(&page.slug)))
    }

    pub fn patch_dir(&self, page: &Page) -> PathBuf {
        self.page_dir(page).join("patches")
    }

    /// Stable for the caption's lifetime; regenerating overwrites it.
    pub fn patch_path(&self, page: &Page, caption_slug: &str) -> PathBuf {
        self.patch_dir(page)
            .join(format!("{}.png", sanitize_component(caption_slug)))
    }

    pub fn cleaned_path(&self, page: &Page) -> PathBuf {
        self.page_dir(page).join("cleaned.png")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }
}

fn sanitize_component(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Opens `path` (creating it if needed) and blocks until this handle holds
/// an exclusive advisory lock on it. The lock is released when the returned
/// file is dropped.
pub(crate) fn lock_exclusive(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|err| PipelineError::io(dir, err))?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|err| PipelineError::io(path, err))?;
    file.lock_exclusive()
        .map_err(|err| PipelineError::io(path, err))?;
    Ok(file)
}

/// Replaces `path` in one rename so readers never observe a partial file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|err| PipelineError::io(dir, err))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|err| PipelineError::io(dir, err))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.flush())
        .map_err(|err| PipelineError::io(tmp.path(), err))?;
    tmp.persist(path)
        .map_err(|err| PipelineError::io(path, err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn page(id: u64, slug: &str) -> Page {
        Page {
            id,
            slug: slug.to_string(),
            image_path: PathBuf::from("/tmp/page.png"),
        }
    }

    #[test]
    fn layout_keys_patches_by_caption_slug() {
        let layout = PageLayout::new("/data");
        assert_eq!(
            layout.patch_path(&page(1, "page-1"), "ab12cd"),
            PathBuf::from("/data/pages/1-page-1/patches/ab12cd.png")
        );
        assert_eq!(
            layout.patch_dir(&page(2, "../escape")),
            PathBuf::from("/data/pages/2-___escape/patches")
        );
    }

    #[test]
    fn slugs_that_sanitize_alike_get_separate_dirs() {
        let layout = PageLayout::new("/data");
        let dotted = page(1, "ch1.p1");
        let underscored = page(2, "ch1_p1");
        assert_ne!(layout.patch_dir(&dotted), layout.patch_dir(&underscored));
        assert_ne!(layout.cleaned_path(&dotted), layout.cleaned_path(&underscored));
    }

    #[test]
    fn exclusive_lock_blocks_a_second_handle() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("locks/a.lock");
        let held = lock_exclusive(&path).expect("lock");
        let (tx, rx) = std::sync::mpsc::channel();
        let waiter_path = path.clone();
        let waiter = std::thread::spawn(move || {
            let _second = lock_exclusive(&waiter_path).expect("second lock");
            tx.send(()).expect("send");
        });
        assert!(rx.recv_timeout(std::time::Duration::from_millis(50)).is_err());
        drop(held);
        rx.recv_timeout(std::time::Duration::from_secs(5))
            .expect("acquired after release");
        waiter.join().expect("join");
    }

    #[test]
    fn write_atomic_creates_and_replaces() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested/out.bin");
        write_atomic(&path, b"first").expect("first write");
        write_atomic(&path, b"second").expect("second write");
        assert_eq!(fs::read(&path).expect("read"), b"second");
        let leftovers = fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .count();
        assert_eq!(leftovers, 1);
    }
}
