//! Notebook interchange: copy cell outputs into an existing `.ipynb` and read
//! them back onto a buffer.
//!
//! Buffer cells and notebook code cells are matched by their source text
//! with blank lines and whole-line comments removed.

use std::path::{Path, PathBuf};

use log::debug;
use nbformat::v4::{Cell, Notebook};
use serde_json::{json, Map, Value};

use crate::error::SessionError;
use crate::output::{ChunkKind, Output, OutputChunk, OutputStatus, OutputType, StreamName};

/// Line-comment token of a kernel language.
pub fn comment_token(language: &str) -> &'static str {
    match language.to_ascii_lowercase().as_str() {
        "c" | "c++" | "cpp" | "rust" | "javascript" | "typescript" | "java" | "go" | "scala"
        | "kotlin" | "swift" | "csharp" | "c#" | "dart" => "//",
        "lua" | "haskell" | "sql" => "--",
        _ => "#",
    }
}

/// Source lines that carry code: trailing whitespace trimmed, blank and
/// comment lines dropped.
pub fn code_lines(source: &str, language: &str) -> Vec<String> {
    let token = comment_token(language);
    source
        .lines()
        .map(str::trim_end)
        .filter(|line| {
            let trimmed = line.trim_start();
            !trimmed.is_empty() && !trimmed.starts_with(token)
        })
        .map(str::to_string)
        .collect()
}

pub fn same_code(a: &str, b: &str, language: &str) -> bool {
    code_lines(a, language) == code_lines(b, language)
}

/// `<buffer file without extension>.ipynb`.
pub fn default_notebook_path(buffer_name: Option<&str>) -> Result<PathBuf, SessionError> {
    let name = buffer_name.filter(|n| !n.is_empty()).ok_or(SessionError::NoFile)?;
    Ok(Path::new(name).with_extension("ipynb"))
}

/// Where an export of `path` is written.
pub fn export_target(path: &Path, overwrite: bool) -> PathBuf {
    if overwrite {
        return path.to_path_buf();
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("copy-of-{name}"))
}

pub fn read_notebook(path: &Path) -> Result<Notebook, SessionError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| SessionError::Notebook(format!("Could not read {}: {e}", path.display())))?;
    let notebook = nbformat::parse_notebook(&content)
        .map_err(|e| SessionError::Notebook(format!("Invalid notebook {}: {e}", path.display())))?;
    match notebook {
        nbformat::Notebook::V4(nb) => Ok(nb),
        nbformat::Notebook::Legacy(legacy) => nbformat::upgrade_legacy_notebook(legacy)
            .map_err(|e| SessionError::Notebook(format!("Could not upgrade {}: {e}", path.display()))),
    }
}

pub fn write_notebook(notebook: Notebook, path: &Path) -> Result<(), SessionError> {
    let content = nbformat::serialize_notebook(&nbformat::Notebook::V4(notebook))
        .map_err(|e| SessionError::Notebook(e.to_string()))?;
    std::fs::write(path, content)
        .map_err(|e| SessionError::Notebook(format!("Could not write {}: {e}", path.display())))
}

/// A buffer cell to export.
pub struct ExportCell<'a> {
    /// Zero-based line the cell begins on.
    pub line: usize,
    pub code: String,
    pub output: &'a Output,
}

/// Notebook JSON for one chunk. Synthetic chunks and chunks without a
/// protocol payload have no notebook form.
pub fn chunk_to_json(chunk: &OutputChunk, execution_count: Option<u32>) -> Option<Value> {
    if let ChunkKind::Error {
        name,
        message,
        traceback,
    } = &chunk.kind
    {
        return Some(json!({
            "output_type": "error",
            "ename": name,
            "evalue": message,
            "traceback": traceback,
        }));
    }

    let data = chunk.data.as_ref()?;
    let metadata = chunk.metadata.clone().unwrap_or_default();
    match &chunk.output_type {
        OutputType::Stream(name) => {
            let text = data
                .get("text/plain")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| chunk.raw_text());
            Some(json!({"output_type": "stream", "name": name.as_str(), "text": text}))
        }
        OutputType::DisplayData => Some(json!({
            "output_type": "display_data",
            "data": data,
            "metadata": metadata,
        })),
        OutputType::ExecuteResult {
            execution_count: count,
        } => Some(json!({
            "output_type": "execute_result",
            "execution_count": count.or(execution_count),
            "data": data,
            "metadata": metadata,
        })),
        OutputType::Error | OutputType::Synthetic => None,
    }
}

/// Write the outputs of `cells` (in document order) into the matching code
/// cells of `notebook`. Each buffer cell is matched against the notebook
/// cells after the previous match.
pub fn export_outputs(
    notebook: &mut Notebook,
    cells: &[ExportCell<'_>],
    language: &str,
    path: &Path,
) -> Result<(), SessionError> {
    let mut code_cells = notebook.cells.iter_mut().filter_map(|cell| match cell {
        Cell::Code {
            source,
            outputs,
            execution_count,
            ..
        } => Some((source, outputs, execution_count)),
        _ => None,
    });

    for cell in cells {
        let matched = code_cells
            .by_ref()
            .find(|(source, _, _)| same_code(&source.join(""), &cell.code, language));
        let Some((_, outputs, execution_count)) = matched else {
            return Err(SessionError::Notebook(format!(
                "No cell matching cell at line: {} in notebook: {}. Bailing.",
                cell.line + 1,
                path.display()
            )));
        };

        let count = cell.output.execution_count;
        *outputs = cell
            .output
            .chunks
            .iter()
            .filter_map(|chunk| chunk_to_json(chunk, count))
            .filter_map(|value| match serde_json::from_value(value) {
                Ok(output) => Some(output),
                Err(e) => {
                    debug!("[ipynb] Skipping output without a notebook form: {e}");
                    None
                }
            })
            .collect();
        *execution_count = count.and_then(|c| c.try_into().ok());
    }
    Ok(())
}

/// A notebook code cell that has outputs.
#[derive(Debug, Clone)]
pub struct NotebookCell {
    pub source: String,
    pub execution_count: Option<u32>,
    pub outputs: Vec<Value>,
}

pub fn cells_with_outputs(notebook: &Notebook) -> Vec<NotebookCell> {
    notebook
        .cells
        .iter()
        .filter_map(|cell| match cell {
            Cell::Code {
                source,
                outputs,
                execution_count,
                ..
            } if !outputs.is_empty() => Some(NotebookCell {
                source: source.join(""),
                execution_count: execution_count.and_then(|c| u32::try_from(c).ok()),
                outputs: outputs
                    .iter()
                    .filter_map(|o| serde_json::to_value(o).ok())
                    .collect(),
            }),
            _ => None,
        })
        .collect()
}

/// Find `source` in `lines` at or after `from`. Returns the first and last
/// line of the match.
pub fn find_source(lines: &[String], from: usize, source: &str, language: &str) -> Option<(usize, usize)> {
    let target = code_lines(source, language);
    let first = target.first()?;
    let token = comment_token(language);
    let is_code = |line: &str| {
        let trimmed = line.trim_start();
        !trimmed.is_empty() && !trimmed.starts_with(token)
    };

    for start in from..lines.len() {
        if lines[start].trim_end() != first {
            continue;
        }
        let mut matched = 0;
        for (idx, line) in lines.iter().enumerate().skip(start) {
            if !is_code(line) {
                continue;
            }
            if line.trim_end() != target[matched] {
                break;
            }
            matched += 1;
            if matched == target.len() {
                return Some((start, idx));
            }
        }
    }
    None
}

fn multiline(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts.iter().filter_map(Value::as_str).collect(),
        _ => String::new(),
    }
}

fn object(value: Option<&Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

/// Rebuild an output from notebook outputs. `restore` turns a mimetype
/// bundle into a chunk.
pub fn output_from_notebook(
    cell: &NotebookCell,
    mut restore: impl FnMut(Map<String, Value>, Map<String, Value>, OutputType) -> OutputChunk,
) -> Output {
    let mut output = Output::new(cell.execution_count);
    for value in &cell.outputs {
        match value.get("output_type").and_then(Value::as_str) {
            Some("stream") => {
                let name = match value.get("name").and_then(Value::as_str) {
                    Some("stderr") => StreamName::Stderr,
                    _ => StreamName::Stdout,
                };
                let text = multiline(value.get("text"));
                let mut data = Map::new();
                data.insert("text/plain".to_string(), Value::String(text.clone()));
                output.chunks.push(
                    OutputChunk::new(ChunkKind::Text(text), OutputType::Stream(name))
                        .with_payload(data, Map::new()),
                );
            }
            Some("display_data") => {
                let chunk = restore(
                    object(value.get("data")),
                    object(value.get("metadata")),
                    OutputType::DisplayData,
                );
                output.chunks.push(chunk);
            }
            Some("execute_result") => {
                let execution_count = value
                    .get("execution_count")
                    .and_then(Value::as_u64)
                    .and_then(|c| u32::try_from(c).ok());
                let chunk = restore(
                    object(value.get("data")),
                    object(value.get("metadata")),
                    OutputType::ExecuteResult { execution_count },
                );
                output.chunks.push(chunk);
            }
            Some("error") => {
                output.success = false;
                let field = |key: &str| {
                    value
                        .get(key)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                let traceback = value
                    .get("traceback")
                    .and_then(Value::as_array)
                    .map(|lines| {
                        lines
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                output
                    .chunks
                    .push(OutputChunk::error(&field("ename"), &field("evalue"), traceback));
            }
            other => debug!("[ipynb] Ignoring output type {other:?}"),
        }
    }
    output.status = OutputStatus::Done;
    output.old = true;
    output
}
