//! Save files: cells and outputs of one buffer, restorable onto the same
//! buffer contents.
//!
//! ```json
//! {"version": 1, "kernel": "python3", "content_checksum": "…",
//!  "cells": [{"span": {"begin": {"lineno": 0, "colno": 0},
//!                      "end": {"lineno": 0, "colno": 5}},
//!             "execution_count": 1, "status": 2, "success": true,
//!             "chunks": [{"data": {…}, "metadata": {…}}]}]}
//! ```

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::config::Options;
use crate::error::{SaveFileError, SessionError};
use crate::output::{Output, OutputStatus};

pub const SAVE_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SavedPosition {
    pub lineno: usize,
    pub colno: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SavedSpan {
    pub begin: SavedPosition,
    pub end: SavedPosition,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedChunk {
    pub data: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedCell {
    pub span: SavedSpan,
    pub execution_count: Option<u32>,
    pub status: i64,
    pub success: bool,
    pub chunks: Vec<SavedChunk>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveFile {
    pub version: i64,
    pub kernel: String,
    pub content_checksum: String,
    pub cells: Vec<SavedCell>,
}

/// SHA-256 of the buffer's lines joined with `\n`, hex encoded.
pub fn content_checksum(lines: &[String]) -> String {
    hex::encode(Sha256::digest(lines.join("\n").as_bytes()))
}

/// `<save_path>/<buffer name with % doubled and / turned into %>.json`.
pub fn default_save_file(options: &Options, buffer_name: Option<&str>) -> Result<PathBuf, SessionError> {
    let name = buffer_name.filter(|n| !n.is_empty()).ok_or(SessionError::NoFile)?;
    let mangled = name.replace('%', "%%").replace('/', "%");
    Ok(options.save_path.join(format!("{mangled}.json")))
}

impl SavedCell {
    pub fn from_output(span: SavedSpan, output: &Output) -> Self {
        let chunks = output
            .chunks
            .iter()
            .filter_map(|chunk| match (&chunk.data, &chunk.metadata) {
                (Some(data), Some(metadata)) => Some(SavedChunk {
                    data: data.clone(),
                    metadata: metadata.clone(),
                }),
                _ => None,
            })
            .collect();
        Self {
            span,
            execution_count: output.execution_count,
            status: output.status.ordinal(),
            success: output.success,
            chunks,
        }
    }
}

impl SaveFile {
    pub fn new(kernel: &str, content_checksum: String, cells: Vec<SavedCell>) -> Self {
        Self {
            version: SAVE_VERSION,
            kernel: kernel.to_string(),
            content_checksum,
            cells,
        }
    }

    pub fn verify_checksum(&self, lines: &[String]) -> Result<(), SaveFileError> {
        if content_checksum(lines) == self.content_checksum {
            Ok(())
        } else {
            Err(SaveFileError::ChecksumMismatch)
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), SaveFileError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, SaveFileError> {
        let contents = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&contents)?;
        Self::from_value(&value)
    }

    /// Validate a parsed save file, naming the first missing or ill-typed key.
    pub fn from_value(value: &Value) -> Result<Self, SaveFileError> {
        let root = as_object(value, "<root>")?;

        let version = int(root, "version")?;
        if version != SAVE_VERSION {
            return Err(SaveFileError::BadVersion(version));
        }
        let kernel = string(root, "kernel")?.to_string();
        let content_checksum = string(root, "content_checksum")?.to_string();

        let mut cells = Vec::new();
        for cell in array(root, "cells")? {
            let cell = as_object(cell, "cells")?;
            let span = object(cell, "span")?;
            let begin = object(span, "begin")?;
            let end = object(span, "end")?;
            let span = SavedSpan {
                begin: SavedPosition {
                    lineno: index(begin, "lineno")?,
                    colno: index(begin, "colno")?,
                },
                end: SavedPosition {
                    lineno: index(end, "lineno")?,
                    colno: index(end, "colno")?,
                },
            };

            let execution_count = match get(cell, "execution_count")? {
                Value::Null => None,
                _ => Some(count(cell, "execution_count")?),
            };
            let status = int(cell, "status")?;
            if OutputStatus::from_ordinal(status).is_none() {
                return Err(SaveFileError::BadStatus(status));
            }
            let success = boolean(cell, "success")?;

            let mut chunks = Vec::new();
            for chunk in array(cell, "chunks")? {
                let chunk = as_object(chunk, "chunks")?;
                chunks.push(SavedChunk {
                    data: object(chunk, "data")?.clone(),
                    metadata: object(chunk, "metadata")?.clone(),
                });
            }

            cells.push(SavedCell {
                span,
                execution_count,
                status,
                success,
                chunks,
            });
        }

        Ok(Self {
            version,
            kernel,
            content_checksum,
            cells,
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

fn incorrect(key: &str, expected: &'static str, found: &Value) -> SaveFileError {
    SaveFileError::IncorrectType {
        key: key.to_string(),
        expected,
        found: type_name(found),
    }
}

fn get<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a Value, SaveFileError> {
    map.get(key)
        .ok_or_else(|| SaveFileError::MissingKey(key.to_string()))
}

fn as_object<'a>(value: &'a Value, key: &str) -> Result<&'a Map<String, Value>, SaveFileError> {
    value.as_object().ok_or_else(|| incorrect(key, "dict", value))
}

fn object<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a Map<String, Value>, SaveFileError> {
    as_object(get(map, key)?, key)
}

fn array<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a Vec<Value>, SaveFileError> {
    let value = get(map, key)?;
    value.as_array().ok_or_else(|| incorrect(key, "list", value))
}

fn string<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a str, SaveFileError> {
    let value = get(map, key)?;
    value.as_str().ok_or_else(|| incorrect(key, "str", value))
}

fn int(map: &Map<String, Value>, key: &str) -> Result<i64, SaveFileError> {
    let value = get(map, key)?;
    value.as_i64().ok_or_else(|| incorrect(key, "int", value))
}

fn index(map: &Map<String, Value>, key: &str) -> Result<usize, SaveFileError> {
    let value = get(map, key)?;
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| incorrect(key, "int", value))
}

fn count(map: &Map<String, Value>, key: &str) -> Result<u32, SaveFileError> {
    let value = get(map, key)?;
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| incorrect(key, "non-negative int", value))
}

fn boolean(map: &Map<String, Value>, key: &str) -> Result<bool, SaveFileError> {
    let value = get(map, key)?;
    value.as_bool().ok_or_else(|| incorrect(key, "bool", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{OutputChunk, OutputType};
    use serde_json::json;

    fn lines(text: &[&str]) -> Vec<String> {
        text.iter().map(|s| s.to_string()).collect()
    }

    fn sample() -> Value {
        json!({
            "version": 1,
            "kernel": "python3",
            "content_checksum": content_checksum(&lines(&["x = 1"])),
            "cells": [{
                "span": {"begin": {"lineno": 0, "colno": 0}, "end": {"lineno": 0, "colno": 5}},
                "execution_count": 1,
                "status": 2,
                "success": true,
                "chunks": [{"data": {"text/plain": "1"}, "metadata": {}}]
            }]
        })
    }

    #[test]
    fn test_checksum_is_sha256_of_joined_lines() {
        assert_eq!(
            content_checksum(&lines(&["a", "b"])),
            hex::encode(Sha256::digest(b"a\nb"))
        );
    }

    #[test]
    fn test_default_save_file_mangles_name() {
        let mut options = Options::default();
        options.save_path = PathBuf::from("/data/kcell");
        let path = default_save_file(&options, Some("/home/me/100%/nb.py")).unwrap();
        assert_eq!(path, PathBuf::from("/data/kcell/%home%me%100%%%nb.py.json"));
        assert!(matches!(
            default_save_file(&options, None),
            Err(SessionError::NoFile)
        ));
    }

    #[test]
    fn test_parse_valid_file() {
        let file = SaveFile::from_value(&sample()).unwrap();
        assert_eq!(file.kernel, "python3");
        assert_eq!(file.cells.len(), 1);
        assert_eq!(file.cells[0].span.end.colno, 5);
        assert_eq!(file.cells[0].chunks[0].data["text/plain"], json!("1"));
        file.verify_checksum(&lines(&["x = 1"])).unwrap();
        assert!(matches!(
            file.verify_checksum(&lines(&["x = 2"])),
            Err(SaveFileError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_parse_errors_name_the_key() {
        let mut value = sample();
        value["version"] = json!(2);
        assert_eq!(SaveFile::from_value(&value).unwrap_err().to_string(), "Bad version: 2");

        let mut value = sample();
        value.as_object_mut().unwrap().remove("kernel");
        assert_eq!(SaveFile::from_value(&value).unwrap_err().to_string(), "Missing key: kernel");

        let mut value = sample();
        value["cells"][0]["success"] = json!("yes");
        assert_eq!(
            SaveFile::from_value(&value).unwrap_err().to_string(),
            "Incorrect type for key 'success': expected bool, got str"
        );

        let mut value = sample();
        value["cells"][0]["status"] = json!(9);
        assert!(matches!(
            SaveFile::from_value(&value),
            Err(SaveFileError::BadStatus(9))
        ));
    }

    #[test]
    fn test_null_execution_count_is_accepted() {
        let mut value = sample();
        value["cells"][0]["execution_count"] = Value::Null;
        let file = SaveFile::from_value(&value).unwrap();
        assert_eq!(file.cells[0].execution_count, None);
    }

    #[test]
    fn test_out_of_range_execution_count_is_rejected() {
        for bad in [json!(-1), json!(u64::from(u32::MAX) + 1)] {
            let mut value = sample();
            value["cells"][0]["execution_count"] = bad;
            assert_eq!(
                SaveFile::from_value(&value).unwrap_err().to_string(),
                "Incorrect type for key 'execution_count': expected non-negative int, got int"
            );
        }

        let mut value = sample();
        value["cells"][0]["execution_count"] = json!(1.5);
        assert_eq!(
            SaveFile::from_value(&value).unwrap_err().to_string(),
            "Incorrect type for key 'execution_count': expected non-negative int, got float"
        );
    }

    #[test]
    fn test_saved_cell_drops_chunks_without_payload() {
        let mut output = Output::new(Some(3));
        output.status = OutputStatus::Done;
        let mut data = Map::new();
        data.insert("text/plain".into(), json!("ok"));
        output.chunks.push(
            OutputChunk::text_line("ok", OutputType::DisplayData).with_payload(data, Map::new()),
        );
        output.chunks.push(OutputChunk::debug(vec!["text/plain".into()]));
        output.chunks.push(OutputChunk::error("E", "bad", vec![]));

        let span = SavedSpan {
            begin: SavedPosition { lineno: 0, colno: 0 },
            end: SavedPosition { lineno: 1, colno: 0 },
        };
        let cell = SavedCell::from_output(span, &output);
        assert_eq!(cell.chunks.len(), 1);
        assert_eq!(cell.status, 2);
        assert_eq!(cell.execution_count, Some(3));
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("save.json");
        let file = SaveFile::from_value(&sample()).unwrap();
        file.write(&path).unwrap();
        assert_eq!(SaveFile::read(&path).unwrap(), file);
    }
}
