//! Host Settings
//!
//! Settings of the `sight` launcher, merged from an optional TOML file and
//! `SIGHT_`-prefixed environment variables, the environment winning.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Settings file looked up in the working directory when none is given
pub const DEFAULT_SETTINGS_FILE: &str = "sight.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log: LogSettings,
    /// Directory searched for application documents given by name
    #[serde(default = "default_apps_dir")]
    pub apps_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log: LogSettings::default(),
            apps_dir: default_apps_dir(),
        }
    }
}

fn default_apps_dir() -> PathBuf {
    PathBuf::from("apps")
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    /// `EnvFilter` directives, overridden by `RUST_LOG`
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

fn default_filter() -> String {
    "sight=info,sight_service=info,sight_com=warn".to_string()
}

impl Settings {
    /// Load settings. A missing file is not an error.
    pub fn load(file: Option<&Path>) -> Result<Self, figment::Error> {
        let file = file.unwrap_or_else(|| Path::new(DEFAULT_SETTINGS_FILE));
        Self::figment(file).extract()
    }

    /// Resolve an application argument: an existing path as is, otherwise
    /// `<apps_dir>/<name>.toml`
    pub fn resolve_app(&self, app: &Path) -> PathBuf {
        if app.exists() || app.extension().is_some() {
            return app.to_path_buf();
        }
        self.apps_dir.join(app).with_extension("toml")
    }

    fn figment(file: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("SIGHT_").split("__"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap();

        assert_eq!(settings, Settings::default());
        assert_eq!(settings.apps_dir, PathBuf::from("apps"));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[log]\nfilter = \"debug\"\njson = true").unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.log.filter, "debug");
        assert!(settings.log.json);
        assert_eq!(settings.apps_dir, PathBuf::from("apps"));
    }

    #[test]
    fn test_resolve_app_by_name() {
        let settings = Settings {
            apps_dir: PathBuf::from("/opt/sight/apps"),
            ..Settings::default()
        };

        assert_eq!(
            settings.resolve_app(Path::new("matrix_demo")),
            PathBuf::from("/opt/sight/apps/matrix_demo.toml")
        );
        assert_eq!(
            settings.resolve_app(Path::new("custom/app.toml")),
            PathBuf::from("custom/app.toml")
        );
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[log]\njson = \"sometimes\"").unwrap();

        assert!(Settings::load(Some(file.path())).is_err());
    }
}
