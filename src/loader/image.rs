//! Responsive image variants.

use std::io::Cursor;

use anyhow::Context;
use camino::Utf8Path;
use glob::Pattern;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat, ImageReader};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::core::Mode;
use crate::engine::TaskContext;
use crate::error::{ConfigError, EnlargementPolicyViolation, TransformError};
use crate::loader::SourceFile;
use crate::pipeline::{Dest, NotifyReload, Pipeline, Step};

/// Configuration for image compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Quality {
    /// Lossless compression.
    Lossless,
    /// Lossy compression with a quality factor (0-100).
    Lossy(u8),
}

impl Default for Quality {
    fn default() -> Self {
        Self::Lossy(80)
    }
}

/// One output size of a matched image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Variant {
    pub width: u32,
    /// Appended to the file stem: `logo.jpg` → `logo-small.jpg`.
    pub suffix: String,
    /// Skip this variant instead of upscaling a narrower source.
    pub without_enlargement: bool,
    /// Only used by lossy formats.
    pub quality: Quality,
}

impl Default for Variant {
    fn default() -> Self {
        Self {
            width: 0,
            suffix: String::new(),
            without_enlargement: false,
            quality: Quality::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsiveRule {
    /// Glob matched against the output-relative path.
    pub pattern: String,
    pub variants: Vec<Variant>,
}

/// What to do with an image no rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnusedImages {
    #[default]
    Error,
    PassThrough,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResponsiveOptions {
    pub rules: Vec<ResponsiveRule>,
    /// Report variants that would need upscaling instead of producing them.
    pub error_on_enlargement: bool,
    pub unused_images: UnusedImages,
}

impl Default for ResponsiveOptions {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            error_on_enlargement: true,
            unused_images: UnusedImages::default(),
        }
    }
}

/// The `images` pipeline for `mode`.
pub fn pipeline(mode: Mode, responsive: Responsive, dest: &Utf8Path) -> Pipeline {
    match mode {
        Mode::Development => Pipeline::development()
            .step(responsive)
            .step(Dest::new(dest))
            .step(NotifyReload::page()),
        Mode::Production => Pipeline::production()
            .step(responsive)
            .step(Dest::new(dest)),
    }
}

/// Replaces every matched image by its configured variants.
pub struct Responsive {
    rules: Vec<(Pattern, Vec<Variant>)>,
    error_on_enlargement: bool,
    unused_images: UnusedImages,
}

impl Responsive {
    pub fn new(options: &ResponsiveOptions) -> Result<Self, ConfigError> {
        Ok(Self {
            rules: options
                .rules
                .iter()
                .map(|rule| Ok((Pattern::new(&rule.pattern)?, rule.variants.clone())))
                .collect::<Result<_, ConfigError>>()?,
            error_on_enlargement: options.error_on_enlargement,
            unused_images: options.unused_images,
        })
    }

    fn variants(&self, path: &Utf8Path) -> Vec<&Variant> {
        self.rules
            .iter()
            .filter(|(pattern, _)| pattern.matches_path(path.as_std_path()))
            .flat_map(|(_, variants)| variants)
            .collect()
    }

    fn process(
        &self,
        ctx: &TaskContext<'_>,
        file: SourceFile,
    ) -> Result<Vec<SourceFile>, TransformError> {
        let variants = self.variants(&file.path);

        if variants.is_empty() {
            return match self.unused_images {
                UnusedImages::PassThrough => Ok(vec![file]),
                UnusedImages::Skip => {
                    tracing::debug!(
                        task = ctx.name,
                        file = %file.origin,
                        "no rule matches, skipped"
                    );
                    Ok(vec![])
                }
                UnusedImages::Error => {
                    ctx.defer(TransformError::new(
                        &file.origin,
                        self.name(),
                        anyhow::anyhow!("no responsive rule matches this image"),
                    ));
                    Ok(vec![])
                }
            };
        }

        let attribute = |e: anyhow::Error| TransformError::new(&file.origin, self.name(), e);

        let reader = ImageReader::new(Cursor::new(&file.contents))
            .with_guessed_format()
            .map_err(|e| attribute(e.into()))?;
        let format = reader
            .format()
            .context("unrecognised image format")
            .map_err(attribute)?;
        let image = reader.decode().map_err(|e| attribute(e.into()))?;

        let mut out = Vec::with_capacity(variants.len());

        for variant in variants {
            if image.width() < variant.width {
                if variant.without_enlargement {
                    tracing::debug!(
                        file = %file.origin,
                        suffix = variant.suffix,
                        "narrower than {}px, skipped",
                        variant.width
                    );
                    continue;
                }

                if self.error_on_enlargement {
                    let violation = EnlargementPolicyViolation {
                        file: file.origin.clone(),
                        suffix: variant.suffix.clone(),
                        width: variant.width,
                        source_width: image.width(),
                    };
                    ctx.defer(TransformError::new(&file.origin, self.name(), violation));
                    return Ok(vec![]);
                }
            }

            let resized = resize(&image, variant.width);
            let contents = encode(&resized, format, variant.quality).map_err(attribute)?;
            let path = variant_path(&file.path, &variant.suffix);
            out.push(SourceFile::new(path, &file.origin, contents));
        }

        Ok(out)
    }
}

impl Step for Responsive {
    fn name(&self) -> &'static str {
        "responsive"
    }

    fn apply(
        &self,
        ctx: &TaskContext<'_>,
        files: Vec<SourceFile>,
    ) -> Result<Vec<SourceFile>, TransformError> {
        let processed = files
            .into_par_iter()
            .map(|file| self.process(ctx, file))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(processed.into_iter().flatten().collect())
    }
}

/// Scale to `width`, keeping the aspect ratio.
fn resize(image: &DynamicImage, width: u32) -> DynamicImage {
    let (source_width, source_height) = (image.width() as u64, image.height() as u64);
    let height = (source_height * width as u64 + source_width / 2) / source_width.max(1);
    image.resize_exact(width, (height as u32).max(1), FilterType::Lanczos3)
}

fn encode(image: &DynamicImage, format: ImageFormat, quality: Quality) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();

    match format {
        ImageFormat::Jpeg => {
            let quality = match quality {
                Quality::Lossless => 100,
                Quality::Lossy(q) => q.clamp(1, 100),
            };
            let rgb = image.to_rgb8();
            JpegEncoder::new_with_quality(&mut out, quality).write_image(
                rgb.as_raw(),
                rgb.width(),
                rgb.height(),
                ExtendedColorType::Rgb8,
            )?;
        }
        _ => image.write_to(&mut Cursor::new(&mut out), format)?,
    }

    Ok(out)
}

/// `images/logo.jpg` + `-small` → `images/logo-small.jpg`.
fn variant_path(path: &Utf8Path, suffix: &str) -> camino::Utf8PathBuf {
    let stem = path.file_stem().unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}{suffix}.{ext}"),
        None => format!("{stem}{suffix}"),
    };
    path.with_file_name(name)
}
