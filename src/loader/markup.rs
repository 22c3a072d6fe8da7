use camino::Utf8Path;

use crate::core::Mode;
use crate::engine::TaskContext;
use crate::error::TransformError;
use crate::loader::SourceFile;
use crate::pipeline::{Dest, NotifyReload, Pipeline, Step, each};

/// Content of these elements is never touched.
const VERBATIM: [&str; 4] = ["pre", "textarea", "script", "style"];

/// Whitespace next to these tags doesn't render, so it can go entirely.
const BLOCK: &[&str] = &[
    "address", "article", "aside", "base", "blockquote", "body", "br", "dd", "details", "dialog",
    "div", "dl", "dt", "fieldset", "figcaption", "figure", "footer", "form", "h1", "h2", "h3",
    "h4", "h5", "h6", "head", "header", "hgroup", "hr", "html", "li", "link", "main", "meta",
    "nav", "noscript", "ol", "option", "p", "section", "summary", "table", "tbody", "td",
    "tfoot", "th", "thead", "title", "tr", "ul", "!doctype",
];

/// The `html` pipeline for `mode`.
pub fn pipeline(mode: Mode, dest: &Utf8Path) -> Pipeline {
    match mode {
        Mode::Development => Pipeline::development()
            .step(Dest::new(dest))
            .step(NotifyReload::page()),
        Mode::Production => Pipeline::production()
            .step(CollapseWhitespace)
            .step(Dest::new(dest)),
    }
}

pub struct CollapseWhitespace;

impl Step for CollapseWhitespace {
    fn name(&self) -> &'static str {
        "minify"
    }

    fn apply(
        &self,
        _: &TaskContext<'_>,
        files: Vec<SourceFile>,
    ) -> Result<Vec<SourceFile>, TransformError> {
        each(files, self.name(), |mut file| {
            file.contents = collapse_whitespace(file.text()?).into_bytes();
            Ok(file)
        })
    }
}

enum Token<'a> {
    Text(&'a str),
    Tag(&'a str),
    /// Whole element whose content must be kept as is.
    Raw(&'a str),
}

/// Collapse runs of whitespace in text to a single space, and drop them
/// entirely when they touch a block-level tag or the document edges.
pub fn collapse_whitespace(html: &str) -> String {
    let tokens = tokenize(html);
    let mut out = String::with_capacity(html.len());

    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Tag(tag) | Token::Raw(tag) => out.push_str(tag),
            Token::Text(text) => {
                let collapsed = collapse(text);
                if collapsed.trim().is_empty() {
                    let before = i.checked_sub(1).and_then(|j| tokens.get(j));
                    let after = tokens.get(i + 1);
                    if before.is_some_and(|t| !is_block(t)) && after.is_some_and(|t| !is_block(t)) {
                        out.push(' ');
                    }
                    continue;
                }

                let mut text = collapsed.as_str();
                if i == 0 || tokens.get(i - 1).is_some_and(is_block) {
                    text = text.trim_start();
                }
                if i + 1 == tokens.len() || tokens.get(i + 1).is_some_and(is_block) {
                    text = text.trim_end();
                }
                out.push_str(text);
            }
        }
    }

    out
}

fn collapse(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut space = false;

    for c in text.chars() {
        if c.is_whitespace() {
            if !space {
                out.push(' ');
            }
            space = true;
        } else {
            out.push(c);
            space = false;
        }
    }

    out
}

fn tokenize(html: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut rest = html;

    while !rest.is_empty() {
        let Some(start) = rest.find('<') else {
            tokens.push(Token::Text(rest));
            break;
        };

        if start > 0 {
            tokens.push(Token::Text(&rest[..start]));
            rest = &rest[start..];
        }

        if rest.starts_with("<!--") {
            let end = rest.find("-->").map(|i| i + 3).unwrap_or(rest.len());
            tokens.push(Token::Raw(&rest[..end]));
            rest = &rest[end..];
            continue;
        }

        let Some(end) = rest.find('>').map(|i| i + 1) else {
            tokens.push(Token::Text(rest));
            break;
        };

        let tag = &rest[..end];
        let name = tag_name(tag);

        if let Some(raw) = VERBATIM.iter().find(|v| **v == name) {
            let close = format!("</{raw}");
            let until = rest[end..]
                .to_ascii_lowercase()
                .find(&close)
                .map(|i| end + i)
                .and_then(|i| rest[i..].find('>').map(|j| i + j + 1))
                .unwrap_or(rest.len());
            tokens.push(Token::Raw(&rest[..until]));
            rest = &rest[until..];
        } else {
            tokens.push(Token::Tag(tag));
            rest = &rest[end..];
        }
    }

    tokens
}

fn tag_name(tag: &str) -> String {
    tag.trim_start_matches('<')
        .trim_start_matches('/')
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '>' && *c != '/')
        .collect::<String>()
        .to_ascii_lowercase()
}

fn is_block(token: &Token<'_>) -> bool {
    match token {
        Token::Tag(tag) => BLOCK.contains(&tag_name(tag).as_str()),
        Token::Raw(raw) => raw.starts_with("<!--") || tag_name(raw) != "textarea",
        Token::Text(_) => false,
    }
}
