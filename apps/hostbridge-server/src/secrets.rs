//! Secret store: a `KEY=value` env-format file loaded at startup and on
//! explicit reload. Values never leave this module except through template
//! resolution inside the dispatch pipeline; every public read surface gets
//! key names only.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{info, warn};

pub struct SecretStore {
    file: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl SecretStore {
    pub fn load(file: PathBuf) -> Self {
        let store = Self {
            file,
            values: RwLock::new(BTreeMap::new()),
        };
        store.reload();
        store
    }

    /// Re-read the secrets file. Missing file leaves the store empty; a
    /// malformed line is skipped with a warning. Returns the number of keys.
    pub fn reload(&self) -> usize {
        let mut parsed: BTreeMap<String, String> = BTreeMap::new();
        match std::fs::read_to_string(&self.file) {
            Ok(raw) => {
                for (lineno, raw_line) in raw.lines().enumerate() {
                    let line = raw_line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let Some((key, value)) = line.split_once('=') else {
                        warn!(path = %self.file.display(), line = lineno + 1, "skipping malformed secrets line");
                        continue;
                    };
                    let key = key.trim();
                    let mut value = value.trim();
                    // Strip one layer of matching surrounding quotes.
                    if value.len() >= 2 {
                        let bytes = value.as_bytes();
                        if (bytes[0] == b'"' || bytes[0] == b'\'')
                            && bytes[bytes.len() - 1] == bytes[0]
                        {
                            value = &value[1..value.len() - 1];
                        }
                    }
                    if !key.is_empty()
                        && key
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_')
                    {
                        parsed.insert(key.to_string(), value.to_string());
                    } else {
                        warn!(path = %self.file.display(), line = lineno + 1, "skipping non-identifier secret key");
                    }
                }
                info!(count = parsed.len(), path = %self.file.display(), "secrets loaded");
            }
            Err(_) => {
                warn!(path = %self.file.display(), "secrets file not found");
            }
        }
        let count = parsed.len();
        *self.values.write().expect("secrets lock poisoned") = parsed;
        count
    }

    /// Sorted key names; values are never exposed.
    pub fn list_keys(&self) -> Vec<String> {
        self.values
            .read()
            .expect("secrets lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.values.read().expect("secrets lock poisoned").len()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .expect("secrets lock poisoned")
            .get(key)
            .cloned()
    }

    /// Replace any literal secret value appearing in `text` with `[REDACTED]`.
    /// Used on error messages before they reach the audit row.
    pub fn mask(&self, text: &str) -> String {
        let values = self.values.read().expect("secrets lock poisoned");
        let mut result = text.to_string();
        for value in values.values() {
            if !value.is_empty() && result.contains(value.as_str()) {
                result = result.replace(value.as_str(), "[REDACTED]");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn store_with(contents: &str) -> (SecretStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.env");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        (SecretStore::load(path), dir)
    }

    #[test]
    fn parses_env_format() {
        let (store, _dir) = store_with(
            "# comment\nAPI_KEY=abc123\nQUOTED=\"hello world\"\nEMPTY=\n\nnot a line\n",
        );
        assert_eq!(store.list_keys(), vec!["API_KEY", "EMPTY", "QUOTED"]);
        assert_eq!(store.get("API_KEY").as_deref(), Some("abc123"));
        assert_eq!(store.get("QUOTED").as_deref(), Some("hello world"));
        assert_eq!(store.get("EMPTY").as_deref(), Some(""));
    }

    #[test]
    fn rejects_non_identifier_keys() {
        let (store, _dir) = store_with("GOOD=1\nbad key=2\n");
        assert_eq!(store.list_keys(), vec!["GOOD"]);
    }

    #[test]
    fn reload_picks_up_changes() {
        let (store, dir) = store_with("A=1\n");
        assert_eq!(store.count(), 1);
        std::fs::write(dir.path().join("secrets.env"), "A=1\nB=2\n").unwrap();
        assert_eq!(store.reload(), 2);
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn mask_redacts_values() {
        let (store, _dir) = store_with("TOKEN=supersecret\n");
        let masked = store.mask("request failed: bearer supersecret rejected");
        assert_eq!(masked, "request failed: bearer [REDACTED] rejected");
        assert_eq!(store.mask("no secrets here"), "no secrets here");
    }
}
