use anyhow::{Context, Result};
use media_io::{persist_atomically, FfmpegKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("framepress")
}

pub fn settings_path() -> PathBuf {
    app_data_dir().join("settings.json")
}

/// Machine-wide encoder configuration: where the tools live and the defaults
/// applied to jobs that leave a knob unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// Explicit ffmpeg binary; `PATH` is searched when unset.
    pub ffmpeg_path: Option<PathBuf>,
    /// Explicit gifski library; the platform library name is tried when unset.
    pub gifski_path: Option<PathBuf>,
    /// Forces the gifski calling convention, e.g. `"0.8"`.
    pub gifski_version: Option<String>,
    pub gifski_quality: u8,
    pub gifski_looped: bool,
    pub gif_template: String,
    pub gif_extra_parameters: String,
    pub apng_template: String,
    pub apng_extra_parameters: String,
    pub video_template: String,
    pub video_extra_parameters: String,
    pub post_command: String,
    pub upload_command: Option<String>,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            gifski_path: None,
            gifski_version: None,
            gifski_quality: 90,
            gifski_looped: true,
            gif_template: FfmpegKind::Gif.default_template().to_string(),
            gif_extra_parameters:
                "-lavfi palettegen=stats_mode=diff[pal],[0:v][pal]paletteuse=new=1:diff_mode=rectangle"
                    .to_string(),
            apng_template: FfmpegKind::Apng.default_template().to_string(),
            apng_extra_parameters: "-pred mixed".to_string(),
            video_template: FfmpegKind::Video.default_template().to_string(),
            video_extra_parameters: "-c:v libx264 -pix_fmt yuv420p -vf \"pad=width=ceil(iw/2)*2:height=ceil(ih/2)*2\""
                .to_string(),
            post_command: String::new(),
            upload_command: None,
        }
    }
}

impl EncoderSettings {
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&settings_path())
    }

    /// Reads settings from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("read settings from {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
    }

    pub fn save(&self) -> Result<PathBuf> {
        let path = settings_path();
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        persist_atomically(path, &json)
            .with_context(|| format!("write settings to {}", path.display()))
    }

    pub fn template_for(&self, kind: FfmpegKind) -> &str {
        match kind {
            FfmpegKind::Gif => &self.gif_template,
            FfmpegKind::Apng => &self.apng_template,
            FfmpegKind::Video => &self.video_template,
        }
    }

    pub fn extra_parameters_for(&self, kind: FfmpegKind) -> &str {
        match kind {
            FfmpegKind::Gif => &self.gif_extra_parameters,
            FfmpegKind::Apng => &self.apng_extra_parameters,
            FfmpegKind::Video => &self.video_extra_parameters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = EncoderSettings::load_from(&dir.path().join("settings.json")).unwrap();
        assert_eq!(loaded, EncoderSettings::default());
    }

    #[test]
    fn saved_settings_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = EncoderSettings {
            ffmpeg_path: Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg")),
            gifski_version: Some("0.8".into()),
            gifski_quality: 70,
            ..Default::default()
        };

        settings.save_to(&path).unwrap();

        assert_eq!(EncoderSettings::load_from(&path).unwrap(), settings);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "gifski_looped": false }"#).unwrap();

        let loaded = EncoderSettings::load_from(&path).unwrap();

        assert!(!loaded.gifski_looped);
        assert_eq!(loaded.gifski_quality, 90);
        assert_eq!(
            loaded.template_for(FfmpegKind::Apng),
            FfmpegKind::Apng.default_template()
        );
    }

    #[test]
    fn data_dir_is_namespaced() {
        assert!(settings_path().ends_with("framepress/settings.json"));
    }
}
