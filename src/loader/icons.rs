//! Icon sprites.
//!
//! Three chained tasks, each handing a typed value to the next:
//!
//! 1. [`SvgSpriteTask`] optimises every icon, lays them out diagonally and
//!    produces a [`VectorSprite`] together with the SCSS partial describing
//!    it.
//! 2. [`RasterFallback`] renders that sprite to PNG at the canvas size,
//!    producing a [`SpriteSheet`].
//! 3. [`Publish`] writes both forms below the destination root and hands
//!    the partial on as a [`PublishedSprite`].

use std::fs;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use image::{ExtendedColorType, ImageEncoder, codecs::png::PngEncoder};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::Serialize;

use crate::engine::{TaskContext, TypedTask};
use crate::error::{TaskError, TransformError};
use crate::loader::Sources;
use crate::manifest::IconOptions;
use crate::pipeline::write_if_changed;

const DEFAULT_TEMPLATE: &str = r#"// Generated by assetflow, do not edit.
$sprite-url: "{{ url }}{{ sprite }}.svg";
$sprite-fallback-url: "{{ url }}{{ sprite }}.png";
$sprite-width: {{ width }}px;
$sprite-height: {{ height }}px;

${{ mapname }}: (
{%- for icon in icons %}
  "{{ icon.name }}": (width: {{ icon.width }}px, height: {{ icon.height }}px, x: -{{ icon.x }}px, y: -{{ icon.y }}px),
{%- endfor %}
);

@mixin sprite($name) {
  $icon: map-get(${{ mapname }}, $name);
  width: map-get($icon, width);
  height: map-get($icon, height);
  background-image: url($sprite-fallback-url);
  background-image: url($sprite-url), none;
  background-position: map-get($icon, x) map-get($icon, y);
  background-repeat: no-repeat;
}
"#;

/// Where one icon ended up in the sprite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IconPlacement {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

/// Output of `icons-svg`.
#[derive(Debug, Clone)]
pub struct VectorSprite {
    pub svg: String,
    pub width: u32,
    pub height: u32,
    pub icons: Vec<IconPlacement>,
    /// Rendered SCSS partial.
    pub partial: String,
}

/// Output of `icons-png`. The raster is absent when there are no icons.
#[derive(Debug, Clone)]
pub struct SpriteSheet {
    pub vector: VectorSprite,
    pub png: Option<Vec<u8>>,
}

/// Output of `icons`.
#[derive(Debug, Clone)]
pub struct PublishedSprite {
    /// Written files, relative to the destination root.
    pub files: Vec<Utf8PathBuf>,
    /// Import name of the partial, `@import "<name>"`.
    pub partial_name: String,
    pub partial: String,
}

/// Lay icons out diagonally: each one starts where the previous one ends on
/// both axes, with `padding` on every side. Returns the placements and the
/// canvas size.
pub fn layout(sizes: &[(String, u32, u32)], padding: u32) -> (Vec<IconPlacement>, u32, u32) {
    let mut x = 0;
    let mut y = 0;
    let mut placements = Vec::with_capacity(sizes.len());

    for (name, width, height) in sizes {
        placements.push(IconPlacement {
            name: name.clone(),
            width: *width,
            height: *height,
            x: x + padding,
            y: y + padding,
        });
        x += width + 2 * padding;
        y += height + 2 * padding;
    }

    (placements, x, y)
}

/// Nest each optimised icon document in a sprite document at its placement.
fn assemble(icons: &[(IconPlacement, String)], width: u32, height: u32) -> String {
    let mut svg = format!(concat!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" "#,
        r#"width="{width}" height="{height}" viewBox="0 0 {width} {height}">"#
    ), width = width, height = height);

    for (place, document) in icons {
        let start = document.find("<svg").unwrap_or(0);
        let (open, rest) = document[start..].split_at(4.min(document.len() - start));
        svg.push('\n');
        svg.push_str(open);
        svg.push_str(&format!(
            r#" id="{}" x="{}" y="{}""#,
            place.name, place.x, place.y
        ));
        svg.push_str(rest.trim_end());
    }

    svg.push_str("\n</svg>\n");
    svg
}

/// Optimise one icon: normalise it through usvg and prefix all ids with the
/// icon name so they can't clash inside the sprite. Returns the document and
/// its size rounded up to whole units.
fn optimise(name: &str, data: &[u8]) -> anyhow::Result<(String, u32, u32)> {
    let tree = usvg::Tree::from_data(data, &usvg::Options::default())?;

    let options = usvg::WriteOptions {
        id_prefix: Some(format!("{name}-")),
        ..usvg::WriteOptions::default()
    };

    let size = tree.size();
    Ok((
        tree.to_string(&options),
        size.width().ceil() as u32,
        size.height().ceil() as u32,
    ))
}

/// `icons-svg`.
pub struct SvgSpriteTask {
    sources: Sources,
    options: IconOptions,
}

impl SvgSpriteTask {
    pub fn new(sources: Sources, options: IconOptions) -> Self {
        Self { sources, options }
    }

    fn partial(
        &self,
        placements: &[IconPlacement],
        width: u32,
        height: u32,
    ) -> Result<String, TransformError> {
        let (origin, template) = match &self.options.template {
            Some(path) => {
                let full = self.sources.root().join(path);
                let text = fs::read_to_string(&full)
                    .map_err(|e| TransformError::new(path, "template", e))?;
                (path.clone(), text)
            }
            None => (Utf8PathBuf::from("<builtin>"), DEFAULT_TEMPLATE.to_string()),
        };

        render_partial(&template, &self.options, placements, width, height)
            .map_err(|e| TransformError::new(origin, "template", e))
    }
}

/// Render the SCSS partial describing a sprite.
fn render_partial(
    template: &str,
    options: &IconOptions,
    icons: &[IconPlacement],
    width: u32,
    height: u32,
) -> Result<String, minijinja::Error> {
    minijinja::Environment::new().render_str(
        template,
        minijinja::context! {
            mapname => &options.mapname,
            sprite => &options.sprite,
            url => &options.url,
            width => width,
            height => height,
            icons => icons,
        },
    )
}

/// Icon names end up in SVG ids and SCSS map keys, neither of which is
/// escaped.
fn check_name(name: &str) -> anyhow::Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if !valid {
        anyhow::bail!("icon name '{name}' may only contain letters, digits, '-', '_' and '.'");
    }
    Ok(())
}

impl TypedTask for SvgSpriteTask {
    type Output = VectorSprite;

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<VectorSprite, TaskError> {
        let mut files = self.sources.read()?;
        files.sort_by(|a, b| a.path.file_stem().cmp(&b.path.file_stem()));

        if files.is_empty() {
            tracing::warn!(task = ctx.name, "no icons found");
        }

        let optimised = files
            .into_par_iter()
            .map(|file| {
                let name = file.path.file_stem().unwrap_or(file.path.as_str()).to_string();
                check_name(&name)
                    .and_then(|_| optimise(&name, &file.contents))
                    .map(|(svg, width, height)| (name, svg, width, height))
                    .map_err(|e| TransformError::new(&file.origin, "svgmin", e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let sizes: Vec<_> = optimised
            .iter()
            .map(|(name, _, width, height)| (name.clone(), *width, *height))
            .collect();

        let (placements, width, height) = layout(&sizes, self.options.padding);

        let icons: Vec<_> = placements
            .iter()
            .cloned()
            .zip(optimised.into_iter().map(|(_, svg, _, _)| svg))
            .collect();

        let partial = self.partial(&placements, width, height)?;

        tracing::debug!(task = ctx.name, "sprite {width}x{height} with {} icon(s)", icons.len());

        Ok(VectorSprite {
            svg: assemble(&icons, width, height),
            width,
            height,
            icons: placements,
            partial,
        })
    }
}

/// `icons-png`: render the vector sprite of task `from`.
pub struct RasterFallback {
    from: String,
}

impl RasterFallback {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }
}

/// Render `svg` onto a transparent canvas of exactly `width` × `height`
/// pixels and encode it as PNG.
pub fn rasterize(svg: &str, width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
    let tree = usvg::Tree::from_str(svg, &usvg::Options::default())?;

    let mut pixmap = resvg::tiny_skia::Pixmap::new(width, height)
        .context("failed to allocate sprite pixmap")?;
    resvg::render(&tree, resvg::tiny_skia::Transform::default(), &mut pixmap.as_mut());

    let mut rgba = Vec::with_capacity(pixmap.data().len());
    for pixel in pixmap.pixels() {
        let color = pixel.demultiply();
        rgba.extend_from_slice(&[color.red(), color.green(), color.blue(), color.alpha()]);
    }

    let mut png = Vec::new();
    PngEncoder::new(&mut png).write_image(&rgba, width, height, ExtendedColorType::Rgba8)?;
    Ok(png)
}

impl TypedTask for RasterFallback {
    type Output = SpriteSheet;

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<SpriteSheet, TaskError> {
        let vector = ctx.dependency::<VectorSprite>(&self.from)?.clone();

        if vector.icons.is_empty() {
            return Ok(SpriteSheet { vector, png: None });
        }

        let png = rasterize(&vector.svg, vector.width, vector.height)
            .map_err(|e| TransformError::new("sprite.svg", "svg2png", e))?;

        Ok(SpriteSheet {
            vector,
            png: Some(png),
        })
    }
}

/// `icons`: write the sprite sheet of task `from` to `<dest>/<sprite>.{svg,png}`.
pub struct Publish {
    from: String,
    dest_root: Utf8PathBuf,
    options: IconOptions,
}

impl Publish {
    pub fn new(
        from: impl Into<String>,
        dest_root: impl Into<Utf8PathBuf>,
        options: IconOptions,
    ) -> Self {
        Self {
            from: from.into(),
            dest_root: dest_root.into(),
            options,
        }
    }

    fn write(&self, name: &Utf8Path, data: &[u8]) -> Result<(), TaskError> {
        let path = self.dest_root.join(name);
        if write_if_changed(&path, data)? {
            tracing::debug!(%path, "written");
        }
        Ok(())
    }
}

impl TypedTask for Publish {
    type Output = PublishedSprite;

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<PublishedSprite, TaskError> {
        let sheet = ctx.dependency::<SpriteSheet>(&self.from)?;
        let mut files = Vec::new();

        if let Some(png) = &sheet.png {
            let svg_path = self.options.dest.join(format!("{}.svg", self.options.sprite));
            let png_path = self.options.dest.join(format!("{}.png", self.options.sprite));

            self.write(&svg_path, sheet.vector.svg.as_bytes())?;
            self.write(&png_path, png)?;

            files.push(svg_path);
            files.push(png_path);
        } else {
            tracing::warn!(task = ctx.name, "nothing to publish");
        }

        Ok(PublishedSprite {
            files,
            partial_name: self.options.sprite.clone(),
            partial: sheet.vector.partial.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::{Dynamic, Environment, Mode};
    use crate::manifest::AssetSource;

    const SQUARE: &str = concat!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="16" height="16" viewBox="0 0 16 16">"#,
        r#"<defs><linearGradient id="g">"#,
        r##"<stop offset="0" stop-color="#000"/><stop offset="1" stop-color="#fff"/>"##,
        r#"</linearGradient></defs>"#,
        r#"<rect x="2" y="2" width="12" height="12" fill="url(#g)"/></svg>"#
    );
    const WIDE: &str = concat!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" "#,
        r#"width="30.5" height="10" viewBox="0 0 30.5 10">"#,
        r##"<rect width="30" height="10" fill="#f00"/></svg>"##
    );

    fn project(icons: &[(&str, &str)]) -> (tempfile::TempDir, Utf8PathBuf, Sources) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("src/icons/svg")).unwrap();
        for (name, svg) in icons {
            fs::write(root.join("src/icons/svg").join(name), svg).unwrap();
        }
        let sources = Sources::new(&root, &AssetSource::new(["src/icons/svg/*.svg"])).unwrap();
        (dir, root, sources)
    }

    /// Run the three stages in order, feeding outputs by hand.
    fn run_chain(
        sources: Sources,
        dest: &Utf8Path,
    ) -> (VectorSprite, SpriteSheet, PublishedSprite) {
        let env = Environment::new(Mode::Production);
        let options = IconOptions::default();

        let vector = SvgSpriteTask::new(sources, options.clone())
            .execute(&TaskContext::detached("icons-svg", &env))
            .unwrap();

        let input: Dynamic = Arc::new(vector.clone());
        let sheet = RasterFallback::new("icons-svg")
            .execute(&TaskContext::new("icons-png", &env, vec![("icons-svg", input)]))
            .unwrap();

        let input: Dynamic = Arc::new(sheet.clone());
        let published = Publish::new("icons-png", dest, options)
            .execute(&TaskContext::new("icons", &env, vec![("icons-png", input)]))
            .unwrap();

        (vector, sheet, published)
    }

    #[test]
    fn diagonal_layout_with_padding() {
        let sizes = vec![("a".to_string(), 16, 16), ("b".to_string(), 31, 10)];
        let (placements, width, height) = layout(&sizes, 5);

        assert_eq!(placements[0], IconPlacement {
            name: "a".into(),
            width: 16,
            height: 16,
            x: 5,
            y: 5
        });
        assert_eq!(placements[1], IconPlacement {
            name: "b".into(),
            width: 31,
            height: 10,
            x: 31,
            y: 31
        });
        assert_eq!((width, height), (26 + 41, 26 + 20));
    }

    #[test]
    fn sprite_is_sorted_prefixed_and_described() {
        let (_dir, root, sources) = project(&[("wide.svg", WIDE), ("square.svg", SQUARE)]);
        let (vector, _, _) = run_chain(sources, &root.join("dist"));

        let names: Vec<_> = vector.icons.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["square", "wide"]);
        assert_eq!((vector.icons[1].width, vector.icons[1].height), (31, 10));
        assert_eq!((vector.width, vector.height), (26 + 41, 26 + 20));

        assert!(vector.svg.contains(r#"id="square" x="5" y="5""#));
        assert!(vector.svg.contains(r#"id="square-"#));
        let wide = r#""wide": (width: 31px, height: 10px, x: -31px, y: -31px)"#;
        assert!(vector.partial.contains(wide));
        assert!(vector.partial.contains("$icons: ("));
        assert!(vector.partial.contains(r#"$sprite-url: "../images/sprite.svg";"#));
    }

    #[test]
    fn raster_matches_canvas() {
        let (_dir, root, sources) = project(&[("square.svg", SQUARE), ("wide.svg", WIDE)]);
        let (vector, sheet, _) = run_chain(sources, &root.join("dist"));

        let png = image::load_from_memory(sheet.png.as_deref().unwrap()).unwrap();
        assert_eq!((png.width(), png.height()), (vector.width, vector.height));
    }

    #[test]
    fn publishes_two_files_idempotently() {
        let (_dir, root, sources) = project(&[("home.svg", SQUARE)]);
        let dest = root.join("dist");

        let (_, _, published) = run_chain(sources, &dest);
        assert_eq!(published.files, vec!["images/sprite.svg", "images/sprite.png"]);
        assert_eq!(published.partial_name, "sprite");

        let mut entries: Vec<_> = fs::read_dir(dest.join("images"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        entries.sort();
        assert_eq!(entries, vec!["sprite.png", "sprite.svg"]);

        let first_svg = fs::read(dest.join("images/sprite.svg")).unwrap();
        let first_png = fs::read(dest.join("images/sprite.png")).unwrap();

        let sources = Sources::new(&root, &AssetSource::new(["src/icons/svg/*.svg"])).unwrap();
        run_chain(sources, &dest);

        assert_eq!(fs::read(dest.join("images/sprite.svg")).unwrap(), first_svg);
        assert_eq!(fs::read(dest.join("images/sprite.png")).unwrap(), first_png);
    }

    #[test]
    fn broken_icon_is_attributed() {
        let (_dir, _root, sources) = project(&[("bad.svg", "<svg")]);
        let env = Environment::new(Mode::Development);
        let err = SvgSpriteTask::new(sources, IconOptions::default())
            .execute(&TaskContext::detached("icons-svg", &env))
            .unwrap_err();

        match err {
            TaskError::Transform(e) => {
                assert_eq!(e.file, "src/icons/svg/bad.svg");
                assert_eq!(e.step, "svgmin");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn custom_template() {
        let (_dir, root, sources) = project(&[("home.svg", SQUARE)]);
        let template = "{% for i in icons %}${{ i.name }}: {{ i.width }}px;{% endfor %}";
        fs::write(root.join("src/icons/tpl.scss"), template).unwrap();

        let options = IconOptions {
            template: Some("src/icons/tpl.scss".into()),
            ..IconOptions::default()
        };

        let env = Environment::new(Mode::Development);
        let vector = SvgSpriteTask::new(sources, options)
            .execute(&TaskContext::detached("icons-svg", &env))
            .unwrap();
        assert_eq!(vector.partial, "$home: 16px;");
    }

    #[test]
    fn builtin_template_negates_offsets() {
        let icons = vec![
            IconPlacement { name: "home".into(), width: 16, height: 16, x: 5, y: 5 },
            IconPlacement { name: "menu".into(), width: 24, height: 12, x: 31, y: 31 },
        ];

        let options = IconOptions::default();
        let partial = render_partial(DEFAULT_TEMPLATE, &options, &icons, 65, 53).unwrap();

        assert!(partial.contains(r#""home": (width: 16px, height: 16px, x: -5px, y: -5px),"#));
        assert!(partial.contains(r#""menu": (width: 24px, height: 12px, x: -31px, y: -31px),"#));
        assert!(partial.contains("$sprite-width: 65px;"));
        assert!(partial.contains(r#"$sprite-fallback-url: "../images/sprite.png";"#));
    }

    #[test]
    fn unsafe_icon_names_are_rejected() {
        let (_dir, _root, sources) = project(&[("a&b.svg", SQUARE)]);
        let env = Environment::new(Mode::Development);
        let err = SvgSpriteTask::new(sources, IconOptions::default())
            .execute(&TaskContext::detached("icons-svg", &env))
            .unwrap_err();

        match err {
            TaskError::Transform(e) => assert_eq!(e.file, "src/icons/svg/a&b.svg"),
            other => panic!("unexpected {other:?}"),
        }

        assert!(check_name("arrow-left_2.x").is_ok());
        assert!(check_name("say\"hi\"").is_err());
    }

    #[test]
    fn empty_icon_set_publishes_nothing() {
        let (_dir, root, sources) = project(&[]);
        let (vector, sheet, published) = run_chain(sources, &root.join("dist"));

        assert_eq!((vector.width, vector.height), (0, 0));
        assert!(sheet.png.is_none());
        assert!(published.files.is_empty());
        assert!(published.partial.contains("$icons: ("));
    }
}
