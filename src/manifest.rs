//! Source manifest and the rest of the project configuration.
//!
//! The configuration is read once from `assetflow.json` (when present) and is
//! immutable afterwards. Every field has a default, and the defaults describe
//! the project layout this tool was written for, so an empty file or no file
//! at all gives a working setup.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::loader::image::{ResponsiveOptions, ResponsiveRule, UnusedImages, Variant};
use crate::loader::script::ScriptCompiler;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "assetflow.json";

/// Globs and base directory for one asset class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSource {
    /// Patterns relative to the project root. A leading `!` excludes.
    pub patterns: Vec<String>,
    /// Directory stripped from matched paths to obtain the output-relative
    /// path. Without it the static prefix of each glob is stripped instead.
    #[serde(default)]
    pub base: Option<Utf8PathBuf>,
}

impl AssetSource {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
            base: None,
        }
    }

    pub fn base(mut self, base: impl Into<Utf8PathBuf>) -> Self {
        self.base = Some(base.into());
        self
    }
}

/// Asset class name → sources, plus the roots everything is resolved against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceManifest {
    /// Project root; every pattern is relative to it.
    pub root: Utf8PathBuf,
    /// Destination root, relative to `root`.
    pub dest: Utf8PathBuf,
    pub assets: BTreeMap<String, AssetSource>,
}

impl SourceManifest {
    /// Look up the sources of an asset class.
    pub fn resolve(&self, class: &str) -> Result<&AssetSource, ConfigError> {
        self.assets
            .get(class)
            .ok_or_else(|| ConfigError::UndeclaredAssetClass(class.to_string()))
    }

    /// Absolute (or root-relative) destination directory.
    pub fn dest_root(&self) -> Utf8PathBuf {
        self.root.join(&self.dest)
    }
}

impl Default for SourceManifest {
    fn default() -> Self {
        let assets = [
            ("package", AssetSource::new(["package.json"])),
            ("scripts", AssetSource::new(["src/scripts/**/*.js"]).base("src")),
            ("markup", AssetSource::new(["src/*.html"]).base("src")),
            ("styles", AssetSource::new(["src/styles/*.scss"]).base("src")),
            (
                "images",
                AssetSource::new(["src/images/**/*.*", "!src/images/favicon/**/*.*"]).base("src"),
            ),
            (
                "staticImages",
                AssetSource::new(["src/images/favicon/**/*.*"]).base("src"),
            ),
            ("icons", AssetSource::new(["src/icons/svg/*.svg"])),
            (
                "staticFiles",
                AssetSource::new(["src/browserconfig.xml", "src/favicon.ico", "src/CNAME"])
                    .base("src"),
            ),
        ];

        Self {
            root: Utf8PathBuf::from("."),
            dest: Utf8PathBuf::from("dist"),
            assets: assets
                .into_iter()
                .map(|(name, source)| (name.to_string(), source))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StyleOptions {
    /// Extra SCSS load paths, relative to the root.
    pub include: Vec<Utf8PathBuf>,
}

impl Default for StyleOptions {
    fn default() -> Self {
        Self {
            include: vec![Utf8PathBuf::from("node_modules/foundation-sites/scss")],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptOptions {
    pub compiler: ScriptCompiler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LintOptions {
    pub enabled: bool,
    /// Turn lint findings into task failures.
    pub fatal: bool,
}

impl Default for LintOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            fatal: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IconOptions {
    /// Space added on every side of each icon, in user units.
    pub padding: u32,
    /// File stem of the published sprite (`<name>.svg`, `<name>.png`).
    pub sprite: String,
    /// Name of the SCSS map in the generated partial.
    pub mapname: String,
    /// Directory below the destination root the sprite is published to.
    pub dest: Utf8PathBuf,
    /// URL prefix stylesheets use to reference the sprite.
    pub url: String,
    /// Optional minijinja template for the partial, relative to the root.
    pub template: Option<Utf8PathBuf>,
}

impl Default for IconOptions {
    fn default() -> Self {
        Self {
            padding: 5,
            sprite: "sprite".into(),
            mapname: "icons".into(),
            dest: Utf8PathBuf::from("images"),
            url: "../images/".into(),
            template: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerOptions {
    /// HTTP port of the dev server.
    pub port: u16,
    /// Websocket port for reload signals.
    pub reload_port: u16,
    /// Quiet period before a burst of file events is handled.
    pub debounce_ms: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 3000,
            reload_port: 3001,
            debounce_ms: 250,
        }
    }
}

/// The whole configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    #[serde(flatten)]
    pub manifest: SourceManifest,
    pub scripts: ScriptOptions,
    pub styles: StyleOptions,
    pub lint: LintOptions,
    pub icons: IconOptions,
    pub images: ResponsiveOptions,
    pub server: ServerOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manifest: SourceManifest::default(),
            scripts: ScriptOptions::default(),
            styles: StyleOptions::default(),
            lint: LintOptions::default(),
            icons: IconOptions::default(),
            images: default_responsive(),
            server: ServerOptions::default(),
        }
    }
}

impl Config {
    /// Read `path`, or fall back to the defaults when it does not exist.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(%path, "no configuration file, using defaults");
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Resolve the project root to an absolute path so globs and watch
    /// events agree on the same prefix.
    pub fn canonicalize(mut self) -> Result<Self, ConfigError> {
        let root = &self.manifest.root;
        self.manifest.root = root
            .canonicalize_utf8()
            .map_err(|source| ConfigError::Root {
                path: root.clone(),
                source,
            })?;
        Ok(self)
    }
}

fn default_responsive() -> ResponsiveOptions {
    let logo = [
        (320, "-small", true),
        (512, "-medium", true),
        (720, "-large", true),
        (960, "-xlarge", false),
    ]
    .into_iter()
    .map(|(width, suffix, without_enlargement)| Variant {
        width,
        suffix: suffix.into(),
        without_enlargement,
        ..Variant::default()
    })
    .collect();

    let background = [(640, "-small"), (1024, "-medium"), (1440, "-large"), (1920, "-xlarge")]
        .into_iter()
        .map(|(width, suffix)| Variant {
            width,
            suffix: suffix.into(),
            ..Variant::default()
        })
        .collect();

    ResponsiveOptions {
        rules: vec![
            ResponsiveRule {
                pattern: "**/logo.jpg".into(),
                variants: logo,
            },
            ResponsiveRule {
                pattern: "**/background/bg-*.jpg".into(),
                variants: background,
            },
        ],
        error_on_enlargement: true,
        unused_images: UnusedImages::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_declared_class() {
        let manifest = SourceManifest::default();
        let scripts = manifest.resolve("scripts").unwrap();
        assert_eq!(scripts.patterns, vec!["src/scripts/**/*.js"]);
        assert_eq!(scripts.base.as_deref(), Some(Utf8Path::new("src")));
    }

    #[test]
    fn resolve_undeclared_class() {
        let manifest = SourceManifest::default();
        let err = manifest.resolve("fonts").unwrap_err();
        assert!(matches!(err, ConfigError::UndeclaredAssetClass(name) if name == "fonts"));
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_override() {
        let config = Config::parse(
            r#"{
                "root": "site",
                "assets": { "scripts": { "patterns": ["js/*.js"], "base": "js" } },
                "lint": { "fatal": true },
                "scripts": { "compiler": { "kind": "passthrough" } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.manifest.root, "site");
        assert_eq!(config.manifest.dest, "dist");
        assert_eq!(config.manifest.dest_root(), "site/dist");
        assert!(config.lint.fatal);
        assert!(config.lint.enabled);
        assert_eq!(config.scripts.compiler, ScriptCompiler::Passthrough);
        assert!(config.manifest.resolve("markup").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join(CONFIG_FILE)).unwrap();
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }
}
