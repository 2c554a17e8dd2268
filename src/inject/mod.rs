//! Secret injection into the downstream host's configuration.
//!
//! Two target kinds:
//! - **Env**: a `KEY=value` line in the host's environment file. The whole
//!   file is rewritten atomically with owner-only permissions; batch changes
//!   collapse into a single rewrite.
//! - **Config**: a dotted-path leaf in the host's structured config. This
//!   module only builds the nested patch document; delivery goes through the
//!   gateway client's `config.patch`.

use std::path::{Path, PathBuf};

const ENV_HEADER: &str = "# Managed by keywarden. Managed keys are rewritten on every change.";

/// Error from env-file operations.
#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single env-file change: `Some(value)` sets the key, `None` removes it.
pub type EnvChange = (String, Option<String>);

/// Rewrites one environment file.
#[derive(Debug, Clone)]
pub struct EnvFileWriter {
    path: PathBuf,
}

impl EnvFileWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Set one key. Prefer [`apply`](Self::apply) for several changes.
    pub fn set(&self, key: &str, value: &str) -> Result<(), InjectError> {
        self.apply(&[(key.to_string(), Some(value.to_string()))])
    }

    /// Remove one key. Missing keys are fine.
    pub fn remove(&self, key: &str) -> Result<(), InjectError> {
        self.apply(&[(key.to_string(), None)])
    }

    /// Apply a batch of changes with a single file rewrite.
    pub fn apply(&self, changes: &[EnvChange]) -> Result<(), InjectError> {
        let mut entries = self.load()?;
        for (key, value) in changes {
            match value {
                Some(value) => match entries.iter_mut().find(|(k, _)| k == key) {
                    Some((_, slot)) => *slot = value.clone(),
                    None => entries.push((key.clone(), value.clone())),
                },
                None => entries.retain(|(k, _)| k != key),
            }
        }
        self.rewrite(&entries)
    }

    /// Read one key's current value, if present.
    pub fn get(&self, key: &str) -> Result<Option<String>, InjectError> {
        Ok(self
            .load()?
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v))
    }

    /// Parse the file into ordered entries. Blank lines and `#` comments are
    /// ignored; surrounding quotes are stripped.
    fn load(&self) -> Result<Vec<(String, String)>, InjectError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(InjectError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            entries.push((key.trim().to_string(), unquote(value.trim())));
        }
        Ok(entries)
    }

    /// Rewrite the whole file atomically: header comment, one line per key,
    /// owner read/write only.
    fn rewrite(&self, entries: &[(String, String)]) -> Result<(), InjectError> {
        use std::io::Write;

        let io_err = |source| InjectError::Io {
            path: self.path.clone(),
            source,
        };

        let mut content = String::from(ENV_HEADER);
        content.push('\n');
        for (key, value) in entries {
            content.push_str(key);
            content.push('=');
            content.push_str(&quote(value));
            content.push('\n');
        }

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(io_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(content.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))
                .map_err(io_err)?;
        }

        tmp.persist(&self.path).map_err(|e| InjectError::Io {
            path: self.path.clone(),
            source: e.error,
        })?;
        Ok(())
    }
}

/// Quote a value when it contains whitespace or quote characters. Internal
/// quotes and backslashes are backslash-escaped.
fn quote(value: &str) -> String {
    let needs_quoting = value
        .chars()
        .any(|c| c.is_whitespace() || c == '"' || c == '\'');
    if !needs_quoting {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Strip surrounding quotes and unescape the interior.
fn unquote(value: &str) -> String {
    let stripped = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| {
            value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
        });
    let Some(inner) = stripped else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Build the nested patch document whose leaf at `json_path` is `value`
/// (`None` patches the leaf to null, which deletes it downstream).
pub fn config_patch_document(json_path: &str, value: Option<&str>) -> serde_json::Value {
    let leaf = match value {
        Some(v) => serde_json::Value::String(v.to_string()),
        None => serde_json::Value::Null,
    };
    let mut doc = leaf;
    for segment in json_path.split('.').rev() {
        doc = serde_json::json!({ segment: doc });
    }
    doc
}

/// Merge several path patches into one document so a batch becomes a single
/// `config.patch` call.
pub fn merge_patch_documents(patches: &[(String, Option<String>)]) -> serde_json::Value {
    let mut merged = serde_json::Value::Object(serde_json::Map::new());
    for (path, value) in patches {
        merge_into(&mut merged, &config_patch_document(path, value.as_deref()));
    }
    merged
}

fn merge_into(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_into(base.entry(key.clone()).or_insert(serde_json::Value::Null), value);
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
