use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Timing policy for the graceful → SIGTERM → SIGKILL shutdown ladder.
/// The stage durations are empirically tuned, so they live in the config
/// file instead of the code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub quit_grace_ms: u64,
    pub term_wait_ms: u64,
    pub kill_wait_ms: u64,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            quit_grace_ms: 1000,
            term_wait_ms: 1000,
            kill_wait_ms: 1000,
        }
    }
}

impl EscalationPolicy {
    pub fn quit_grace(&self) -> Duration {
        Duration::from_millis(self.quit_grace_ms)
    }

    pub fn term_wait(&self) -> Duration {
        Duration::from_millis(self.term_wait_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }
}

/// Patterns the text backend scans its child's output with. Users can
/// adjust these when a player build prints slightly different markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputPatterns {
    pub movie_size: String,
    pub cache_fill: String,
    pub movie_position: String,
    pub movie_length: String,
    pub reference_url: String,
    pub reference_file: String,
    pub start_playing: String,
}

impl Default for OutputPatterns {
    fn default() -> Self {
        Self {
            movie_size: r"VO:.*[^0-9]([0-9]+)x([0-9]+)".to_string(),
            cache_fill: r"Cache fill:[^0-9]*([0-9\.]+)%".to_string(),
            movie_position: r"V:\s*([0-9\.]+)".to_string(),
            movie_length: r"ID_LENGTH=([0-9\.]+)".to_string(),
            reference_url: r"Playing\s+(.*[^\.])\.?\s*$".to_string(),
            reference_file: r"Reference Media file".to_string(),
            start_playing: r"Start[^ ]* play".to_string(),
        }
    }
}

/// Global tuning shared by the coordinator and every backend, persisted
/// as JSON in the user's config directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Slave-protocol player executable; `None` means plain "mplayer".
    pub player_path: Option<PathBuf>,
    /// Callback-channel player executable.
    pub callback_player_path: Option<PathBuf>,
    pub additional_arguments: String,
    /// Streaming cache in kB; values of 3 or less disable caching.
    pub cache_size_kb: u32,
    pub frame_drop: bool,
    pub loop_playback: bool,
    pub autoplay: bool,
    /// Propagate the reported movie aspect to the viewer collaborator.
    pub keep_aspect: bool,
    pub auto_adjust_colors: bool,
    pub contrast: i32,
    pub brightness: i32,
    pub hue: i32,
    pub saturation: i32,
    pub patterns: OutputPatterns,
    pub escalation: EscalationPolicy,
    /// Seconds to wait for a callback channel before reporting a
    /// connection failure.
    pub callback_connect_timeout_secs: u64,
    /// Persisted backend preference per mime type.
    pub mime_backends: HashMap<String, String>,
    /// Persisted backend preference per source kind.
    pub kind_backends: HashMap<String, String>,
}

pub type SharedSettings = Arc<Mutex<Settings>>;

impl Default for Settings {
    fn default() -> Self {
        Self {
            player_path: None,
            callback_player_path: None,
            additional_arguments: String::new(),
            cache_size_kb: 384,
            frame_drop: false,
            loop_playback: false,
            autoplay: true,
            keep_aspect: true,
            auto_adjust_colors: false,
            contrast: 0,
            brightness: 0,
            hue: 0,
            saturation: 0,
            patterns: OutputPatterns::default(),
            escalation: EscalationPolicy::default(),
            callback_connect_timeout_secs: 10,
            mime_backends: HashMap::new(),
            kind_backends: HashMap::new(),
        }
    }
}

impl Settings {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to read config file at {}: {}",
                    config_path.display(),
                    e
                )
            })?;

            // If the file is damaged or from an older layout, fall back to
            // defaults rather than refusing to start.
            match serde_json::from_str::<Self>(&content) {
                Ok(settings) => {
                    log::info!("Loaded settings from {}", config_path.display());
                    Ok(settings)
                }
                Err(e) => {
                    log::warn!("Settings file has issues ({}), recreating with defaults", e);
                    let settings = Self::default();
                    settings.save()?;
                    Ok(settings)
                }
            }
        } else {
            log::info!("No settings file found, creating defaults");
            let settings = Self::default();
            settings.save()?;
            Ok(settings)
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("procplay")
            .join("config.json")
    }

    pub fn shared(self) -> SharedSettings {
        Arc::new(Mutex::new(self))
    }

    pub fn player_program(&self) -> String {
        self.player_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mplayer".to_string())
    }

    pub fn callback_player_program(&self) -> String {
        self.callback_player_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "xineplayer".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_default_roundtrip() {
        let mut settings = Settings::default();
        settings.cache_size_kb = 1024;
        settings
            .mime_backends
            .insert("video/x-matroska".to_string(), "mplayer".to_string());

        let serialized = serde_json::to_string(&settings).expect("serialize settings");
        let parsed: Settings = serde_json::from_str(&serialized).expect("parse settings");
        assert_eq!(parsed.cache_size_kb, 1024);
        assert_eq!(
            parsed.mime_backends.get("video/x-matroska").map(String::as_str),
            Some("mplayer")
        );
        assert_eq!(parsed.escalation.term_wait_ms, 1000);
    }

    #[test]
    fn test_default_patterns_compile() {
        let patterns = OutputPatterns::default();
        for p in [
            &patterns.movie_size,
            &patterns.cache_fill,
            &patterns.movie_position,
            &patterns.movie_length,
            &patterns.reference_url,
            &patterns.reference_file,
            &patterns.start_playing,
        ] {
            assert!(regex::Regex::new(p).is_ok(), "bad default pattern: {}", p);
        }
    }
}
