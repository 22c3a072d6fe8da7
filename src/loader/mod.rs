//! Reading source files and the transformation steps applied to them.

mod audit;
mod glob;
pub mod icons;
pub mod image;
pub mod markup;
pub mod script;
pub mod styles;

pub use audit::{Audit, AuditReport, Dependency};
pub use glob::{GlobTask, Written};

use std::fs;

use ::glob::Pattern;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::error::{ConfigError, TaskError};
use crate::manifest::AssetSource;
use crate::pipeline::SourceMap;

/// A file travelling through a pipeline.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Output path, relative to the destination root.
    pub path: Utf8PathBuf,
    /// Where the content originally came from. Used for error attribution.
    pub origin: Utf8PathBuf,
    pub contents: Vec<u8>,
    /// Present between `sourcemap-init` and `sourcemap-write`.
    pub source_map: Option<SourceMap>,
}

impl SourceFile {
    pub fn new(
        path: impl Into<Utf8PathBuf>,
        origin: impl Into<Utf8PathBuf>,
        contents: Vec<u8>,
    ) -> Self {
        Self {
            path: path.into(),
            origin: origin.into(),
            contents,
            source_map: None,
        }
    }

    pub fn text(&self) -> anyhow::Result<&str> {
        Ok(std::str::from_utf8(&self.contents)?)
    }
}

struct Include {
    /// Absolute pattern passed to `glob`.
    glob: String,
    /// Static directory prefix of the pattern, used when there's no base.
    prefix: Utf8PathBuf,
    pattern: Pattern,
}

/// Compiled form of an [`AssetSource`], anchored at the project root.
pub struct Sources {
    root: Utf8PathBuf,
    base: Option<Utf8PathBuf>,
    include: Vec<Include>,
    exclude: Vec<Pattern>,
}

impl Sources {
    pub fn new(root: impl Into<Utf8PathBuf>, source: &AssetSource) -> Result<Self, ConfigError> {
        let root = root.into();
        let escaped = Pattern::escape(root.as_str());

        let mut include = Vec::new();
        let mut exclude = Vec::new();

        for pattern in &source.patterns {
            match pattern.strip_prefix('!') {
                Some(negated) => {
                    exclude.push(Pattern::new(&format!("{escaped}/{negated}"))?);
                }
                None => {
                    let glob = format!("{escaped}/{pattern}");
                    include.push(Include {
                        pattern: Pattern::new(&glob)?,
                        prefix: root.join(static_prefix(pattern)),
                        glob,
                    });
                }
            }
        }

        Ok(Self {
            base: source.base.as_ref().map(|base| root.join(base)),
            root,
            include,
            exclude,
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Directories that need to be watched to observe every matching file.
    pub fn watch_roots(&self) -> Vec<Utf8PathBuf> {
        self.include
            .iter()
            .map(|include| {
                // Concrete files are watched through their parent directory.
                if include.prefix.is_file() {
                    include
                        .prefix
                        .parent()
                        .map(Utf8Path::to_path_buf)
                        .unwrap_or_else(|| include.prefix.clone())
                } else {
                    include.prefix.clone()
                }
            })
            .collect()
    }

    /// Whether an absolute path is selected by these sources.
    pub fn matches(&self, path: &Utf8Path) -> bool {
        self.include.iter().any(|i| i.pattern.matches_path(path.as_std_path()))
            && !self.exclude.iter().any(|e| e.matches_path(path.as_std_path()))
    }

    /// Matching files in a stable order, paired with their output-relative
    /// path.
    pub fn collect(&self) -> Result<Vec<(Utf8PathBuf, Utf8PathBuf)>, TaskError> {
        let mut found = Vec::new();

        for include in &self.include {
            for path in ::glob::glob(&include.glob).map_err(anyhow::Error::from)? {
                let path = Utf8PathBuf::try_from(path?).map_err(anyhow::Error::from)?;

                let excluded = self
                    .exclude
                    .iter()
                    .any(|e| e.matches_path(path.as_std_path()));
                if !path.is_file() || excluded {
                    continue;
                }

                let relative = self.relative(&path, &include.prefix);
                found.push((path, relative));
            }
        }

        found.sort();
        found.dedup_by(|a, b| a.0 == b.0);
        Ok(found)
    }

    /// Read every matching file.
    pub fn read(&self) -> Result<Vec<SourceFile>, TaskError> {
        self.collect()?
            .into_iter()
            .map(|(path, relative)| {
                let contents = fs::read(&path)?;
                let origin = path
                    .strip_prefix(&self.root)
                    .map(Utf8Path::to_path_buf)
                    .unwrap_or(path);
                Ok(SourceFile::new(relative, origin, contents))
            })
            .collect()
    }

    fn relative(&self, path: &Utf8Path, prefix: &Utf8Path) -> Utf8PathBuf {
        let anchor = self.base.as_deref().unwrap_or(prefix);

        match path.strip_prefix(anchor) {
            Ok(relative) if !relative.as_str().is_empty() => relative.to_path_buf(),
            _ => path.file_name().map(Utf8PathBuf::from).unwrap_or_else(|| path.to_path_buf()),
        }
    }
}

/// Leading components of a glob without any wildcard.
fn static_prefix(pattern: &str) -> Utf8PathBuf {
    Utf8Path::new(pattern)
        .components()
        .take_while(|c| !c.as_str().contains(['*', '?', '[']))
        .filter(|c| !matches!(c, Utf8Component::CurDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(files: &[&str]) -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        for file in files {
            let path = root.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, file.as_bytes()).unwrap();
        }
        (dir, root)
    }

    #[test]
    fn static_prefix_stops_at_wildcard() {
        assert_eq!(static_prefix("src/scripts/**/*.js"), "src/scripts");
        assert_eq!(static_prefix("./src/*.html"), "src");
        assert_eq!(static_prefix("src/CNAME"), "src/CNAME");
    }

    #[test]
    fn base_preserves_structure() {
        let (_dir, root) = project(&[
            "src/scripts/app.js",
            "src/scripts/lib/util.js",
            "src/other.js",
        ]);
        let source = AssetSource::new(["src/scripts/**/*.js"]).base("src");
        let sources = Sources::new(&root, &source).unwrap();

        let relative: Vec<_> = sources.collect().unwrap().into_iter().map(|(_, r)| r).collect();
        assert_eq!(relative, vec!["scripts/app.js", "scripts/lib/util.js"]);
    }

    #[test]
    fn exclusions_are_dropped() {
        let (_dir, root) = project(&[
            "src/images/logo.jpg",
            "src/images/favicon/icon.png",
            "src/images/background/bg-1.jpg",
        ]);
        let source =
            AssetSource::new(["src/images/**/*.*", "!src/images/favicon/**/*.*"]).base("src");
        let sources = Sources::new(&root, &source).unwrap();

        let relative: Vec<_> = sources.collect().unwrap().into_iter().map(|(_, r)| r).collect();
        assert_eq!(relative, vec!["images/background/bg-1.jpg", "images/logo.jpg"]);

        assert!(sources.matches(&root.join("src/images/logo.jpg")));
        assert!(!sources.matches(&root.join("src/images/favicon/icon.png")));
    }

    #[test]
    fn without_base_strips_glob_parent() {
        let (_dir, root) = project(&["src/icons/svg/home.svg", "src/icons/svg/user.svg"]);
        let source = AssetSource::new(["src/icons/svg/*.svg"]);
        let files = Sources::new(&root, &source).unwrap().read().unwrap();

        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["home.svg", "user.svg"]);
        assert_eq!(files[0].origin, "src/icons/svg/home.svg");
    }

    #[test]
    fn concrete_files_are_listed() {
        let (_dir, root) = project(&["src/CNAME", "src/favicon.ico"]);
        let source =
            AssetSource::new(["src/browserconfig.xml", "src/favicon.ico", "src/CNAME"]).base("src");
        let sources = Sources::new(&root, &source).unwrap();

        let relative: Vec<_> = sources.collect().unwrap().into_iter().map(|(_, r)| r).collect();
        assert_eq!(relative, vec!["CNAME", "favicon.ico"]);
        assert!(sources.watch_roots().contains(&root.join("src")));
    }
}
