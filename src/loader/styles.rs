//! SCSS through grass.

use std::io;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use grass::{Fs, OutputStyle, StdFs};

use crate::core::Mode;
use crate::engine::TaskContext;
use crate::error::TransformError;
use crate::loader::SourceFile;
use crate::loader::icons::PublishedSprite;
use crate::pipeline::{Dest, NotifyReload, Pipeline, SourceMapInit, SourceMapWrite, Step, each};

/// Load path under which generated partials are served. It never exists on
/// disk.
const VIRTUAL_DIR: &str = ".assetflow/generated";

/// The `css` pipeline for `mode`.
///
/// grass reports no mappings, so development maps are line-for-line and only
/// lead to the right stylesheet and roughly the right place in it.
pub fn pipeline(mode: Mode, compile: Compile, dest: &Utf8Path) -> Pipeline {
    match mode {
        Mode::Development => {
            let maps = SourceMapWrite::new(dest, &compile.root);
            Pipeline::development()
                .step(SourceMapInit)
                .step(compile)
                .step(maps)
                .step(Dest::new(dest))
                .step(NotifyReload::inject())
        }
        Mode::Production => Pipeline::production()
            .step(compile)
            .step(Minify)
            .step(Dest::new(dest).prune_source_maps()),
    }
}

/// Compiles every stylesheet that isn't a partial to CSS.
pub struct Compile {
    root: Utf8PathBuf,
    load_paths: Vec<Utf8PathBuf>,
    sprite: Option<String>,
}

impl Compile {
    /// `include` is resolved against `root`.
    pub fn new(root: impl Into<Utf8PathBuf>, include: &[Utf8PathBuf]) -> Self {
        let root = root.into();
        Self {
            load_paths: include.iter().map(|path| root.join(path)).collect(),
            root,
            sprite: None,
        }
    }

    /// Make the partial of the sprite published by task `task` importable.
    pub fn with_sprite(mut self, task: impl Into<String>) -> Self {
        self.sprite = Some(task.into());
        self
    }
}

impl Step for Compile {
    fn name(&self) -> &'static str {
        "compile"
    }

    fn apply(
        &self,
        ctx: &TaskContext<'_>,
        files: Vec<SourceFile>,
    ) -> Result<Vec<SourceFile>, TransformError> {
        let generated = self.root.join(VIRTUAL_DIR);

        let overlay = match &self.sprite {
            Some(task) => {
                let sprite = ctx
                    .dependency::<PublishedSprite>(task)
                    .map_err(|e| {
                        TransformError::new(generated.join("_sprite.scss"), self.name(), e)
                    })?;
                Overlay::new(&generated, &sprite.partial_name, sprite.partial.as_bytes())
            }
            None => Overlay::default(),
        };

        // Files starting with an underscore are only ever imported.
        let files = files
            .into_iter()
            .filter(|file| !file.path.file_name().is_some_and(|name| name.starts_with('_')))
            .collect();

        each(files, self.name(), |mut file| {
            let mut options = grass::Options::default().fs(&overlay).load_path(&generated);

            if let Some(dir) = self.root.join(&file.origin).parent() {
                options = options.load_path(dir);
            }
            for path in &self.load_paths {
                options = options.load_path(path);
            }

            let css = grass::from_string(file.text()?.to_string(), &options)
                .map_err(|e| anyhow::anyhow!("{e}"))?;

            file.path.set_extension("css");
            file.contents = css.into_bytes();
            Ok(file)
        })
    }
}

/// Recompile the CSS with compressed output.
pub struct Minify;

impl Step for Minify {
    fn name(&self) -> &'static str {
        "minify"
    }

    fn apply(
        &self,
        _: &TaskContext<'_>,
        files: Vec<SourceFile>,
    ) -> Result<Vec<SourceFile>, TransformError> {
        each(files, self.name(), |mut file| {
            let options = grass::Options::default().style(OutputStyle::Compressed);
            let css = grass::from_string(file.text()?.to_string(), &options)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            file.contents = css.into_bytes();
            Ok(file)
        })
    }
}

/// The real filesystem plus a handful of in-memory files.
#[derive(Debug, Default)]
struct Overlay<'a> {
    dir: Option<PathBuf>,
    files: Vec<(PathBuf, &'a [u8])>,
}

impl<'a> Overlay<'a> {
    fn new(dir: &Utf8Path, name: &str, content: &'a [u8]) -> Self {
        let dir = dir.as_std_path().to_path_buf();
        Self {
            files: vec![
                (dir.join(format!("_{name}.scss")), content),
                (dir.join(format!("{name}.scss")), content),
            ],
            dir: Some(dir),
        }
    }

    fn find(&self, path: &Path) -> Option<&'a [u8]> {
        self.files
            .iter()
            .find(|(virtual_path, _)| virtual_path == path)
            .map(|(_, content)| *content)
    }
}

impl Fs for Overlay<'_> {
    fn is_dir(&self, path: &Path) -> bool {
        self.dir.as_deref() == Some(path) || StdFs.is_dir(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.find(path).is_some() || StdFs.is_file(path)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        match self.find(path) {
            Some(content) => Ok(content.to_vec()),
            None => StdFs.read(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use super::*;
    use crate::core::{Dynamic, Environment};

    fn project() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("src/styles")).unwrap();
        fs::create_dir_all(root.join("vendor/scss")).unwrap();
        fs::write(root.join("src/styles/_colors.scss"), "$accent: #ff0000;\n").unwrap();
        fs::write(root.join("vendor/scss/_grid.scss"), "$gutter: 10px;\n").unwrap();
        (dir, root)
    }

    fn stylesheet(root: &Utf8Path, text: &str) -> SourceFile {
        fs::write(root.join("src/styles/main.scss"), text).unwrap();
        SourceFile::new("styles/main.scss", "src/styles/main.scss", text.as_bytes().to_vec())
    }

    #[test]
    fn compiles_with_siblings_and_load_paths() {
        let (_dir, root) = project();
        let file = stylesheet(
            &root,
            "@import \"colors\";\n@import \"grid\";\na { color: $accent; margin: $gutter; }\n",
        );
        let colors = b"$accent: red;".to_vec();
        let partial = SourceFile::new("styles/_colors.scss", "src/styles/_colors.scss", colors);

        let env = Environment::new(Mode::Development);
        let ctx = TaskContext::detached("css", &env);
        let out = Compile::new(&root, &[Utf8PathBuf::from("vendor/scss")])
            .apply(&ctx, vec![partial, file])
            .unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, "styles/main.css");
        let css = out[0].text().unwrap();
        assert!(css.contains("color: #ff0000;"));
        assert!(css.contains("margin: 10px;"));
    }

    #[test]
    fn sprite_partial_is_importable() {
        let (_dir, root) = project();
        let file = stylesheet(&root, "@import \"sprite\";\n.icon { width: $icon-size; }\n");

        let sprite: Dynamic = Arc::new(PublishedSprite {
            files: vec!["images/sprite.svg".into(), "images/sprite.png".into()],
            partial_name: "sprite".into(),
            partial: "$icon-size: 24px;\n".into(),
        });

        let env = Environment::new(Mode::Development);
        let ctx = TaskContext::new("css", &env, vec![("icons", sprite)]);
        let out = Compile::new(&root, &[])
            .with_sprite("icons")
            .apply(&ctx, vec![file])
            .unwrap();
        assert!(out[0].text().unwrap().contains("width: 24px;"));
    }

    #[test]
    fn missing_sprite_is_reported() {
        let (_dir, root) = project();
        let file = stylesheet(&root, "a { b: c; }\n");

        let env = Environment::new(Mode::Development);
        let ctx = TaskContext::detached("css", &env);
        let err = Compile::new(&root, &[])
            .with_sprite("icons")
            .apply(&ctx, vec![file])
            .unwrap_err();
        assert_eq!(err.step, "compile");
    }

    #[test]
    fn syntax_errors_name_the_file() {
        let (_dir, root) = project();
        let file = stylesheet(&root, "a { color: ; \n");

        let env = Environment::new(Mode::Development);
        let ctx = TaskContext::detached("css", &env);
        let err = Compile::new(&root, &[]).apply(&ctx, vec![file]).unwrap_err();
        assert_eq!(err.file, "src/styles/main.scss");
    }

    #[test]
    fn minify_compresses() {
        let env = Environment::new(Mode::Production);
        let ctx = TaskContext::detached("css", &env);
        let css = b"a {\n  color: red;\n}\n".to_vec();
        let file = SourceFile::new("styles/main.css", "src/styles/main.scss", css);

        let out = Minify.apply(&ctx, vec![file]).unwrap();
        assert_eq!(out[0].text().unwrap().trim(), "a{color:red}");
    }

    #[test]
    fn variants_differ_by_mode() {
        let dest = Utf8Path::new("/site/dist");
        let dev = pipeline(Mode::Development, Compile::new("/site", &[]), dest);
        assert_eq!(dev.step_names(), vec![
            "sourcemap-init",
            "compile",
            "sourcemap-write",
            "dest",
            "reload"
        ]);

        let prod = pipeline(Mode::Production, Compile::new("/site", &[]), dest);
        assert_eq!(prod.step_names(), vec!["compile", "minify", "dest"]);
    }
}
