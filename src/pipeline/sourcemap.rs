use anyhow::Context;
use base64::Engine;
use serde::{Deserialize, Serialize};

const BASE64: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

const INLINE_PREFIX: &str = "//# sourceMappingURL=data:application/json;base64,";

/// Revision 3 source map.
///
/// A compiler that reports its own mappings hands them over through
/// [`SourceMap::adopt`] and they are written as they are. Otherwise the map
/// links each generated line to the original line with the same number,
/// clamped to the length of the original. That is only accurate for steps
/// which keep lines in place, such as copying a script unchanged. The
/// original text is embedded in `sourcesContent` so browsers can show it
/// without a second request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMap {
    pub version: u8,
    #[serde(default)]
    pub file: String,
    pub sources: Vec<String>,
    #[serde(default)]
    pub sources_content: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
    pub mappings: String,
    #[serde(skip)]
    exact: bool,
}

impl SourceMap {
    /// Start a map for `source`, before any transformation ran.
    pub fn new(
        file: impl Into<String>,
        source: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            version: 3,
            file: file.into(),
            sources: vec![source.into()],
            sources_content: vec![content.into()],
            names: Vec::new(),
            mappings: String::new(),
            exact: false,
        }
    }

    /// Take over the mappings a compiler produced for this single source.
    pub fn adopt(&mut self, compiled: SourceMap) {
        self.mappings = compiled.mappings;
        self.names = compiled.names;
        self.exact = true;
    }

    pub fn is_exact(&self) -> bool {
        self.exact
    }

    /// Point the map at its single source, as seen from the map file.
    pub fn relocate(&mut self, source: impl Into<String>) {
        self.sources = vec![source.into()];
    }

    /// Fill in the mappings for the final generated text.
    pub fn finish(&mut self, file: impl Into<String>, generated: &str) {
        self.file = file.into();
        if self.exact {
            return;
        }

        let original = self
            .sources_content
            .first()
            .map(|content| content.lines().count().max(1))
            .unwrap_or(1);

        let mut mappings = String::new();
        let mut previous = 0i64;

        for line in 0..generated.lines().count() {
            if line > 0 {
                mappings.push(';');
            }

            let target = line.min(original - 1) as i64;

            // generated column, source index, original line delta, original column
            encode_vlq(&mut mappings, 0);
            encode_vlq(&mut mappings, 0);
            encode_vlq(&mut mappings, target - previous);
            encode_vlq(&mut mappings, 0);

            previous = target;
        }

        self.mappings = mappings;
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Split a trailing inline `data:` map off compiler output.
///
/// Returns the code without the map comment, and the map when one was found.
pub fn split_inline(code: &str) -> anyhow::Result<(String, Option<SourceMap>)> {
    let Some(at) = code.rfind(INLINE_PREFIX) else {
        return Ok((code.to_string(), None));
    };

    let encoded = code[at + INLINE_PREFIX.len()..].trim();
    let json = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("inline source map is not valid base64")?;
    let map: SourceMap =
        serde_json::from_slice(&json).context("inline source map is not valid JSON")?;

    let mut rest = code[..at].trim_end().to_string();
    rest.push('\n');
    Ok((rest, Some(map)))
}

fn encode_vlq(out: &mut String, value: i64) {
    let mut vlq = if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    } as u64;

    loop {
        let mut digit = (vlq & 0b11111) as usize;
        vlq >>= 5;
        if vlq > 0 {
            digit |= 0b100000;
        }
        out.push(BASE64[digit] as char);
        if vlq == 0 {
            break;
        }
    }
}
