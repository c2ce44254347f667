//! Configuration loading from disk.
//!
//! A configuration may be split across several files and directories. Every
//! file is decoded into a JSON document, the documents are merged in order
//! and the result is deserialized into [`Options`].

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use crate::config::schema::Options;

/// Path used when no configuration file or directory is given.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Path that reads the configuration from standard input.
pub const STDIN_PATH: &str = "stdin";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read config directory at {path}: {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("decode config at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("decode config at {path}: {source}")]
    DecodeToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("decode config at {path}: top-level value is not an object")]
    NotAnObject { path: PathBuf },

    #[error("decode config: {0}")]
    Schema(#[source] serde_json::Error),
}

/// Something that can produce [`Options`].
///
/// `raw` overrides the configured source with an in-memory JSON document.
pub trait ConfigParser: Send + Sync {
    fn parse(&self, raw: Option<&[u8]>) -> Result<Options, ConfigError>;
}

/// The set of files and directories a configuration is read from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSource {
    pub paths: Vec<PathBuf>,
    pub directories: Vec<PathBuf>,
}

impl ConfigSource {
    pub fn new(paths: Vec<PathBuf>, directories: Vec<PathBuf>) -> Self {
        Self { paths, directories }
    }

    /// A source reading a single file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            paths: vec![path.into()],
            directories: Vec::new(),
        }
    }

    /// Resolve the concrete list of files to read, in merge order.
    ///
    /// The default path is used only when neither paths nor directories are
    /// given; a directory without configuration files contributes nothing.
    pub fn files(&self) -> Result<Vec<PathBuf>, ConfigError> {
        let mut files = self.paths.clone();
        for dir in &self.directories {
            let entries = fs::read_dir(dir).map_err(|source| ConfigError::ReadDirectory {
                path: dir.clone(),
                source,
            })?;
            let mut found = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|source| ConfigError::ReadDirectory {
                    path: dir.clone(),
                    source,
                })?;
                let path = entry.path();
                if path.is_file() && is_config_file(&path) {
                    found.push(path);
                }
            }
            found.sort();
            files.extend(found);
        }
        if self.paths.is_empty() && self.directories.is_empty() {
            files.push(PathBuf::from(DEFAULT_CONFIG_PATH));
        }
        Ok(files)
    }

    /// Paths worth watching for changes.
    ///
    /// `stdin` is excluded.
    pub fn watch_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .paths
            .iter()
            .filter(|p| p.as_os_str() != STDIN_PATH)
            .cloned()
            .collect();
        paths.extend(self.directories.iter().cloned());
        if self.paths.is_empty() && self.directories.is_empty() {
            paths.push(PathBuf::from(DEFAULT_CONFIG_PATH));
        }
        paths
    }

    fn load(&self) -> Result<Options, ConfigError> {
        let mut merged: Option<Value> = None;
        for path in self.files()? {
            let document = read_document(&path)?;
            merged = Some(match merged {
                None => document,
                Some(mut acc) => {
                    merge_values(&mut acc, document);
                    acc
                }
            });
        }
        let merged = merged.unwrap_or_else(|| Value::Object(Default::default()));
        let options = serde_json::from_value(merged).map_err(ConfigError::Schema)?;
        tracing::debug!(source = ?self, "Configuration parsed");
        Ok(options)
    }
}

impl ConfigParser for ConfigSource {
    fn parse(&self, raw: Option<&[u8]>) -> Result<Options, ConfigError> {
        match raw {
            Some(bytes) => parse_json(bytes, Path::new(STDIN_PATH)),
            None => self.load(),
        }
    }
}

/// Decode a JSON document straight into [`Options`].
pub fn parse_json(bytes: &[u8], origin: &Path) -> Result<Options, ConfigError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|source| ConfigError::Decode {
        path: origin.to_path_buf(),
        source,
    })?;
    if !value.is_object() {
        return Err(ConfigError::NotAnObject {
            path: origin.to_path_buf(),
        });
    }
    serde_json::from_value(value).map_err(ConfigError::Schema)
}

fn is_config_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json") | Some("toml")
    )
}

fn read_document(path: &Path) -> Result<Value, ConfigError> {
    let content = if path.as_os_str() == STDIN_PATH {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        buf
    } else {
        fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?
    };

    let value = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        let table: toml::Value = toml::from_str(&content).map_err(|source| ConfigError::DecodeToml {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::to_value(table).map_err(|source| ConfigError::Decode {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        serde_json::from_str(&content).map_err(|source| ConfigError::Decode {
            path: path.to_path_buf(),
            source,
        })?
    };

    if !value.is_object() {
        return Err(ConfigError::NotAnObject {
            path: path.to_path_buf(),
        });
    }
    Ok(value)
}

/// Merge `other` into `base`.
///
/// Objects merge key by key, arrays are concatenated and any other value in
/// `other` replaces the one in `base`.
pub fn merge_values(base: &mut Value, other: Value) {
    match (base, other) {
        (Value::Object(base), Value::Object(other)) => {
            for (key, value) in other {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(base), Value::Array(other)) => base.extend(other),
        (base, other) => *base = other,
    }
}

/// Load a configuration from a single file.
pub fn load_config(path: &Path) -> Result<Options, ConfigError> {
    ConfigSource::file(path).parse(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn merge_concatenates_arrays_and_merges_objects() {
        let mut base = json!({
            "log": { "level": "info" },
            "outbounds": [ { "type": "direct" } ]
        });
        merge_values(
            &mut base,
            json!({
                "log": { "timestamp": true },
                "outbounds": [ { "type": "block" } ]
            }),
        );
        assert_eq!(base["log"]["level"], "info");
        assert_eq!(base["log"]["timestamp"], true);
        assert_eq!(base["outbounds"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn merge_replaces_scalars() {
        let mut base = json!({ "route": { "final": "direct" } });
        merge_values(&mut base, json!({ "route": { "final": "proxy" } }));
        assert_eq!(base["route"]["final"], "proxy");
    }

    #[test]
    fn override_bytes_skip_files() {
        let source = ConfigSource::file("/nonexistent/config.json");
        let options = source
            .parse(Some(br#"{ "log": { "level": "debug" } }"#))
            .unwrap();
        assert_eq!(options.log.level, "debug");
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = load_config(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_json_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "config.json", "{ \"inbounds\": [ ");
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Decode { .. }));
    }

    #[test]
    fn non_object_document_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "config.json", "[1, 2, 3]");
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::NotAnObject { .. }));
    }

    #[test]
    fn wrong_field_type_is_schema_error() {
        let err = ConfigSource::default()
            .parse(Some(br#"{ "inbounds": [ { "listen_port": "eighty" } ] }"#))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Schema(_)));
    }

    #[test]
    fn reads_toml_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "config.toml",
            r#"
[log]
level = "warn"

[[outbounds]]
type = "direct"
tag = "direct"
"#,
        );
        let options = load_config(&path).unwrap();
        assert_eq!(options.log.level, "warn");
        assert_eq!(options.outbounds[0].tag, "direct");
    }

    #[test]
    fn directory_files_merge_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "10-outbounds.json", r#"{ "outbounds": [ { "type": "direct", "tag": "a" } ] }"#);
        write(dir.path(), "20-outbounds.json", r#"{ "outbounds": [ { "type": "block", "tag": "b" } ] }"#);
        write(dir.path(), "notes.txt", "not a config");

        let source = ConfigSource::new(Vec::new(), vec![dir.path().to_path_buf()]);
        let options = source.parse(None).unwrap();
        let tags: Vec<_> = options.outbounds.iter().map(|o| o.tag.as_str()).collect();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[test]
    fn default_source_reads_config_json() {
        let files = ConfigSource::default().files().unwrap();
        assert_eq!(files, vec![PathBuf::from(DEFAULT_CONFIG_PATH)]);
    }

    #[test]
    fn empty_directory_contributes_no_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "README.md", "not a config");

        let source = ConfigSource::new(Vec::new(), vec![dir.path().to_path_buf()]);
        assert!(source.files().unwrap().is_empty());
        assert_eq!(source.parse(None).unwrap(), Options::default());
    }
}
