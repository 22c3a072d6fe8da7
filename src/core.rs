use std::any::Any;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use camino::{Utf8Path, Utf8PathBuf};

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// A 32-byte BLAKE3 hash used for change detection.
///
/// Outputs are only rewritten when the hash of the new content differs from
/// the file already on disk, which keeps modification times stable across
/// repeated runs with unchanged input.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_reader(std::fs::File::open(path)?)?.finalize().into())
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// The mode selected for the whole run.
///
/// Resolved once at startup from the `--production` switch and passed by value
/// into every task constructor. Anything that is not explicitly production is
/// treated as development.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Unminified output with source maps and reload signals.
    #[default]
    Development,
    /// Minified output, no source maps, no reload signals.
    Production,
}

impl Mode {
    pub fn from_flag(production: bool) -> Self {
        if production {
            Mode::Production
        } else {
            Mode::Development
        }
    }

    pub fn is_production(self) -> bool {
        self == Mode::Production
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Development => f.write_str("development"),
            Mode::Production => f.write_str("production"),
        }
    }
}

/// A notification for connected browser clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Reload the whole page, the written file is not a stylesheet.
    Reload(Utf8PathBuf),
    /// Swap stylesheets in place without reloading the page.
    Inject(Utf8PathBuf),
}

impl Signal {
    pub fn path(&self) -> &Utf8Path {
        match self {
            Signal::Reload(path) | Signal::Inject(path) => path,
        }
    }
}

/// Run-wide state shared by every task.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    /// Mode the graph was constructed for.
    pub mode: Mode,
    /// Where reload signals go. `None` when no dev server is listening, in
    /// which case emitted signals are only logged.
    pub signals: Option<Sender<Signal>>,
}

impl Environment {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            signals: None,
        }
    }

    pub fn with_signals(mut self, signals: Sender<Signal>) -> Self {
        self.signals = Some(signals);
        self
    }

    pub(crate) fn emit(&self, signal: Signal) {
        match &self.signals {
            Some(tx) => {
                if tx.send(signal).is_err() {
                    tracing::debug!("reload channel closed, dropping signal");
                }
            }
            None => tracing::debug!(path = %signal.path(), "no reload listener"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_defaults_to_development() {
        assert_eq!(Mode::default(), Mode::Development);
        assert_eq!(Mode::from_flag(false), Mode::Development);
        assert_eq!(Mode::from_flag(true), Mode::Production);
    }

    #[test]
    fn hash_hex_is_stable() {
        let a = Hash32::hash(b"sprite");
        let b = Hash32::hash(b"sprite");
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 64);
        assert_ne!(a, Hash32::hash(b"sprites"));
    }

    #[test]
    fn emit_forwards_to_listener() {
        let (tx, rx) = std::sync::mpsc::channel();
        let env = Environment::new(Mode::Development).with_signals(tx);
        env.emit(Signal::Inject("styles/main.css".into()));
        assert_eq!(rx.recv().unwrap(), Signal::Inject("styles/main.css".into()));
    }
}
