use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::collaborators::FontStyle;
use crate::patch::PatchStyle;
use crate::paths::{base_dir, normalize_dir};

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OcrTransport {
    Http,
    FileDrop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompositorKind {
    Remote,
    Local,
}

#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub base_url: String,
    pub transport: OcrTransport,
    pub timeout: Duration,
    pub drop_dir: Option<PathBuf>,
    pub results_file: Option<PathBuf>,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct TranslationConfig {
    pub enabled: bool,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub source_lang: String,
    pub target_lang: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub ocr: OcrConfig,
    pub translation: TranslationConfig,
    pub patch: PatchStyle,
    pub compositor: CompositorKind,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: base_dir(),
            ocr: OcrConfig {
                base_url: crate::collaborators::DEFAULT_OCR_URL.to_string(),
                transport: OcrTransport::Http,
                timeout: Duration::from_secs(60),
                drop_dir: None,
                results_file: None,
                poll_interval: Duration::from_millis(250),
            },
            translation: TranslationConfig {
                enabled: true,
                base_url: None,
                model: None,
                source_lang: "ja".to_string(),
                target_lang: "en".to_string(),
                timeout: Duration::from_secs(60),
            },
            patch: PatchStyle::default(),
            compositor: CompositorKind::Remote,
        }
    }
}

impl Settings {
    pub fn drop_dir(&self) -> PathBuf {
        self.ocr
            .drop_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("ocr-drop"))
    }

    pub fn results_file(&self) -> PathBuf {
        self.ocr
            .results_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("ocr-results.jsonl"))
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    storage: Option<StorageSection>,
    ocr: Option<OcrSection>,
    translation: Option<TranslationSection>,
    patch: Option<PatchSection>,
    merge: Option<MergeSection>,
}

#[derive(Debug, Default, Deserialize)]
struct StorageSection {
    data_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OcrSection {
    base_url: Option<String>,
    transport: Option<OcrTransport>,
    timeout_secs: Option<u64>,
    drop_dir: Option<String>,
    results_file: Option<String>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TranslationSection {
    enabled: Option<bool>,
    base_url: Option<String>,
    model: Option<String>,
    source_lang: Option<String>,
    target_lang: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PatchSection {
    font_size: Option<u32>,
    font_style: Option<String>,
    text_color: Option<String>,
    stroke_color: Option<String>,
    stroke_width: Option<u32>,
    cleaner_threshold: Option<u8>,
    outline_points: Option<usize>,
    transparent_background: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct MergeSection {
    compositor: Option<CompositorKind>,
}

/// Loads the embedded defaults, then `./settings.toml`,
/// `./settings.local.toml`, the same two files in the base directory, and
/// finally `extra_path`. Later files override earlier ones field by field.
pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    let defaults: SettingsFile =
        toml::from_str(DEFAULT_SETTINGS_TOML).with_context(|| "failed to parse default settings")?;
    settings.merge(defaults)?;
    ensure_base_settings_file()?;

    let mut ordered_paths = vec![
        PathBuf::from("settings.toml"),
        PathBuf::from("settings.local.toml"),
    ];
    let base = base_dir();
    ordered_paths.push(base.join("settings.toml"));
    ordered_paths.push(base.join("settings.local.toml"));

    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            let parsed: SettingsFile = toml::from_str(&content)
                .with_context(|| format!("failed to parse settings: {}", path.display()))?;
            settings
                .merge(parsed)
                .with_context(|| format!("invalid settings in {}", path.display()))?;
        }
    }

    Ok(settings)
}

impl Settings {
    fn merge(&mut self, incoming: SettingsFile) -> Result<()> {
        if let Some(storage) = incoming.storage
            && let Some(dir) = storage.data_dir.as_deref().and_then(normalize_dir)
        {
            self.data_dir = dir;
        }
        if let Some(ocr) = incoming.ocr {
            if let Some(url) = non_blank(ocr.base_url) {
                self.ocr.base_url = url;
            }
            if let Some(transport) = ocr.transport {
                self.ocr.transport = transport;
            }
            if let Some(secs) = ocr.timeout_secs.filter(|secs| *secs > 0) {
                self.ocr.timeout = Duration::from_secs(secs);
            }
            if let Some(dir) = ocr.drop_dir.as_deref().and_then(normalize_dir) {
                self.ocr.drop_dir = Some(dir);
            }
            if let Some(file) = ocr.results_file.as_deref().and_then(normalize_dir) {
                self.ocr.results_file = Some(file);
            }
            if let Some(ms) = ocr.poll_interval_ms.filter(|ms| *ms > 0) {
                self.ocr.poll_interval = Duration::from_millis(ms);
            }
        }
        if let Some(translation) = incoming.translation {
            if let Some(enabled) = translation.enabled {
                self.translation.enabled = enabled;
            }
            if let Some(url) = non_blank(translation.base_url) {
                self.translation.base_url = Some(url);
            }
            if let Some(model) = non_blank(translation.model) {
                self.translation.model = Some(model);
            }
            if let Some(lang) = non_blank(translation.source_lang) {
                self.translation.source_lang = lang;
            }
            if let Some(lang) = non_blank(translation.target_lang) {
                self.translation.target_lang = lang;
            }
            if let Some(secs) = translation.timeout_secs.filter(|secs| *secs > 0) {
                self.translation.timeout = Duration::from_secs(secs);
            }
        }
        if let Some(patch) = incoming.patch {
            if let Some(size) = patch.font_size.filter(|size| *size > 0) {
                self.patch.font_size = size;
            }
            if let Some(style) = non_blank(patch.font_style) {
                self.patch.font_style = style.parse::<FontStyle>().map_err(|err| anyhow!(err))?;
            }
            if let Some(color) = non_blank(patch.text_color) {
                self.patch.text_color = color;
            }
            if let Some(color) = non_blank(patch.stroke_color) {
                self.patch.stroke_color = Some(color);
            }
            if let Some(width) = patch.stroke_width {
                self.patch.stroke_width = width;
            }
            if let Some(threshold) = patch.cleaner_threshold {
                self.patch.cleaner_threshold = Some(threshold);
            }
            if let Some(points) = patch.outline_points.filter(|points| *points >= 3) {
                self.patch.outline_points = points;
            }
            if let Some(transparent) = patch.transparent_background {
                self.patch.transparent_background = transparent;
            }
        }
        if let Some(merge) = incoming.merge
            && let Some(compositor) = merge.compositor
        {
            self.compositor = compositor;
        }
        Ok(())
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn ensure_base_settings_file() -> Result<()> {
    let base = base_dir();
    fs::create_dir_all(&base)
        .with_context(|| format!("failed to create settings directory: {}", base.display()))?;
    let path = base.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_temp_base_dir;

    #[test]
    fn defaults_come_from_embedded_settings() {
        with_temp_base_dir(|base| {
            let settings = load_settings(None).expect("settings");
            assert_eq!(settings.data_dir, base.to_path_buf());
            assert_eq!(settings.ocr.transport, OcrTransport::Http);
            assert_eq!(settings.compositor, CompositorKind::Remote);
            assert_eq!(settings.patch, PatchStyle::default());
            assert_eq!(settings.drop_dir(), base.join("ocr-drop"));
            assert!(base.join("settings.toml").exists());
        });
    }

    #[test]
    fn explicit_file_overrides_field_by_field() {
        with_temp_base_dir(|base| {
            let extra = base.join("extra.toml");
            fs::write(
                &extra,
                r##"
[ocr]
transport = "file-drop"
base_url = "  "

[patch]
font_style = "Bold"
stroke_color = "#ffffff"

[translation]
timeout_secs = 5

[merge]
compositor = "local"
"##,
            )
            .expect("write");
            let settings = load_settings(Some(&extra)).expect("settings");
            assert_eq!(settings.ocr.transport, OcrTransport::FileDrop);
            assert_eq!(settings.ocr.base_url, "http://127.0.0.1:8710");
            assert_eq!(settings.patch.font_style, FontStyle::Bold);
            assert_eq!(settings.patch.stroke_color.as_deref(), Some("#ffffff"));
            assert_eq!(settings.patch.font_size, 24);
            assert_eq!(settings.compositor, CompositorKind::Local);
            assert_eq!(settings.translation.timeout, Duration::from_secs(5));
        });
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        with_temp_base_dir(|base| {
            let err = load_settings(Some(&base.join("nope.toml"))).expect_err("missing");
            assert!(err.to_string().contains("settings file not found"));
        });
    }

    #[test]
    fn unknown_font_style_is_rejected() {
        with_temp_base_dir(|base| {
            let extra = base.join("bad.toml");
            fs::write(&extra, "[patch]\nfont_style = \"heavy\"\n").expect("write");
            let err = load_settings(Some(&extra)).expect_err("bad style");
            assert!(format!("{:#}", err).contains("unknown font style"));
        });
    }
}
