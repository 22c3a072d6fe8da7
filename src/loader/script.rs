//! JavaScript: lint, compile down to the configured target, minify.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Mode;
use crate::engine::TaskContext;
use crate::error::{LintWarning, TransformError};
use crate::loader::SourceFile;
use crate::manifest::LintOptions;
use crate::pipeline::{
    Dest, NotifyReload, Pipeline, SourceMapInit, SourceMapWrite, Step, each, split_inline,
};

/// How scripts are compiled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ScriptCompiler {
    /// Pipe every file through the `esbuild` CLI.
    Esbuild {
        #[serde(default = "default_program")]
        program: String,
        #[serde(default = "default_target")]
        target: String,
    },
    /// Leave the source as is. Minification only drops blank lines and
    /// comment lines.
    Passthrough,
}

fn default_program() -> String {
    "esbuild".into()
}

fn default_target() -> String {
    "es2015".into()
}

impl Default for ScriptCompiler {
    fn default() -> Self {
        Self::Esbuild {
            program: default_program(),
            target: default_target(),
        }
    }
}

/// The `js` pipeline for `mode`, reading below `root` and writing to `dest`.
pub fn pipeline(
    mode: Mode,
    compiler: &ScriptCompiler,
    lint: LintOptions,
    root: &Utf8Path,
    dest: &Utf8Path,
) -> Pipeline {
    match mode {
        Mode::Development => Pipeline::development()
            .step_if(lint.enabled, Lint::new(lint.fatal))
            .step(SourceMapInit)
            .step(Compile(compiler.clone()))
            .step(SourceMapWrite::new(dest, root))
            .step(Dest::new(dest))
            .step(NotifyReload::page()),
        Mode::Production => Pipeline::production()
            .step_if(lint.enabled, Lint::new(lint.fatal))
            .step(Compile(compiler.clone()))
            .step(Minify(compiler.clone()))
            .step(Dest::new(dest).prune_source_maps()),
    }
}

/// Style checks. Findings are logged as warnings unless `fatal` is set, in
/// which case the first offending file fails the step.
pub struct Lint {
    fatal: bool,
}

impl Lint {
    pub fn new(fatal: bool) -> Self {
        Self { fatal }
    }
}

impl Step for Lint {
    fn name(&self) -> &'static str {
        "lint"
    }

    fn apply(
        &self,
        ctx: &TaskContext<'_>,
        files: Vec<SourceFile>,
    ) -> Result<Vec<SourceFile>, TransformError> {
        for file in &files {
            let text = file
                .text()
                .map_err(|e| TransformError::new(&file.origin, self.name(), e))?;

            let warnings = lint(&file.origin, text);
            for warning in &warnings {
                tracing::warn!(task = ctx.name, "{warning}");
            }

            if self.fatal && !warnings.is_empty() {
                return Err(TransformError::new(
                    &file.origin,
                    self.name(),
                    anyhow::anyhow!("{} lint finding(s)", warnings.len()),
                ));
            }
        }

        Ok(files)
    }
}

/// Run the built-in rules over `text`.
pub fn lint(file: &Utf8Path, text: &str) -> Vec<LintWarning> {
    let mut warnings = Vec::new();
    let mut warn = |line: usize, rule: &'static str, message: &str| {
        warnings.push(LintWarning {
            file: Utf8PathBuf::from(file),
            line,
            rule,
            message: message.into(),
        });
    };

    let mut count = 0;
    for (i, line) in text.lines().enumerate() {
        let number = i + 1;
        count = number;

        let indent: String = line.chars().take_while(|c| *c == ' ' || *c == '\t').collect();
        if indent.contains(' ') && indent.contains('\t') {
            warn(number, "no-mixed-spaces-and-tabs", "Mixed spaces and tabs");
        }

        if line.ends_with([' ', '\t']) {
            warn(number, "no-trailing-spaces", "Trailing spaces not allowed");
        }

        let code = line.trim_start();
        if !code.starts_with("//") && has_debugger(code) {
            warn(number, "no-debugger", "Unexpected 'debugger' statement");
        }
    }

    if !text.is_empty() && !text.ends_with('\n') {
        warn(count.max(1), "eol-last", "Newline required at end of file");
    }

    warnings
}

fn has_debugger(code: &str) -> bool {
    let is_ident = |c: char| c.is_alphanumeric() || c == '_' || c == '$';

    code.match_indices("debugger").any(|(at, word)| {
        let before = code[..at].chars().next_back();
        let after = code[at + word.len()..].chars().next();
        !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
    })
}

/// Compile each file with the configured compiler.
///
/// Files carrying a source map get esbuild's own mappings, so the written map
/// follows the compiled code token by token.
pub struct Compile(pub ScriptCompiler);

impl Step for Compile {
    fn name(&self) -> &'static str {
        "compile"
    }

    fn apply(
        &self,
        _: &TaskContext<'_>,
        files: Vec<SourceFile>,
    ) -> Result<Vec<SourceFile>, TransformError> {
        match &self.0 {
            ScriptCompiler::Passthrough => Ok(files),
            ScriptCompiler::Esbuild { program, target } => each(files, self.name(), |mut file| {
                let target = format!("--target={target}");
                let mut args = vec!["--loader=js", target.as_str()];
                if file.source_map.is_some() {
                    args.push("--sourcemap=inline");
                }

                let output = run_esbuild(program, &args, &file.contents)?;
                let output = String::from_utf8(output).context("esbuild output is not UTF-8")?;
                let (code, compiled) = split_inline(&output)?;

                if let (Some(map), Some(compiled)) = (file.source_map.as_mut(), compiled) {
                    map.adopt(compiled);
                }
                file.contents = code.into_bytes();
                Ok(file)
            }),
        }
    }
}

pub struct Minify(pub ScriptCompiler);

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
            file.contents = match &self.0 {
                ScriptCompiler::Esbuild { program, .. } => {
                    run_esbuild(program, &["--loader=js", "--minify"], &file.contents)?
                }
                ScriptCompiler::Passthrough => minify_lines(file.text()?).into_bytes(),
            };
            Ok(file)
        })
    }
}

/// Run `program` with `args`, feeding `input` on stdin and returning stdout.
fn run_esbuild(program: &str, args: &[&str], input: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("couldn't start `{program}`"))?;

    let mut stdin = child.stdin.take().context("stdin unavailable")?;

    // The child may start writing before it has read everything.
    let output = std::thread::scope(|s| {
        s.spawn(move || stdin.write_all(input));
        child.wait_with_output()
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("`{program}` failed:\n{}", stderr.trim());
    }

    Ok(output.stdout)
}

/// Trim every line and drop empty lines and whole-line `//` comments.
pub fn minify_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }

    out
}
