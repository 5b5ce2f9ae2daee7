//! Mimetype bundle to output chunk resolution.
//!
//! Candidates are tried in a fixed order and the first one that produces a
//! chunk wins: SVG, plotly JSON, LaTeX, raw `image/*` payloads, `text/plain`,
//! and finally an unrenderable placeholder. Renderers are optional external
//! commands; when one is missing or fails the next candidate is tried.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use base64::prelude::*;
use serde_json::{Map, Value};

use crate::config::{ImageProvider, Options, RendererCommand};
use crate::output::{ChunkKind, OutputChunk, OutputType};

const SVG: &str = "image/svg+xml";
const PLOTLY: &str = "application/vnd.plotly.v1+json";
const LATEX: &str = "text/latex";
const PNG: &str = "image/png";
const PLAIN: &str = "text/plain";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("renderer not available: {0}")]
    Unavailable(String),

    #[error("renderer failed: {0}")]
    Failed(String),
}

/// Temporary files holding materialised outputs, deleted by [`FileAllocator::cleanup`].
#[derive(Debug, Default)]
pub struct FileAllocator {
    files: Vec<PathBuf>,
}

impl FileAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty file with the given extension and track it.
    pub fn alloc(&mut self, extension: &str) -> std::io::Result<(PathBuf, File)> {
        let (file, path) = tempfile::Builder::new()
            .prefix("kcell-")
            .suffix(&format!(".{extension}"))
            .tempfile()?
            .keep()
            .map_err(|e| e.error)?;
        self.files.push(path.clone());
        Ok((path, file))
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn cleanup(&mut self) {
        for path in self.files.drain(..) {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    log::warn!("[mimetype] Failed to remove {}: {e}", path.display());
                }
            }
        }
    }
}

impl RendererCommand {
    /// Run the command with `{input}` and `{output}` substituted.
    pub fn render(&self, input: &Path, output: &Path) -> Result<(), RenderError> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(RenderError::Unavailable("empty command".to_string()));
        };
        let substitute = |arg: &String| {
            arg.replace("{input}", &input.to_string_lossy())
                .replace("{output}", &output.to_string_lossy())
        };
        let result = Command::new(substitute(program))
            .args(args.iter().map(substitute))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();
        match result {
            Ok(out) if out.status.success() => Ok(()),
            Ok(out) => Err(RenderError::Failed(format!(
                "{program} exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RenderError::Unavailable(program.clone()))
            }
            Err(e) => Err(RenderError::Failed(e.to_string())),
        }
    }
}

/// Text payloads may be a string or a list of lines.
fn payload_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .concat(),
        ),
        _ => None,
    }
}

fn render_with(
    renderer: Option<&RendererCommand>,
    files: &mut FileAllocator,
    input_extension: &str,
    input: &[u8],
) -> Result<PathBuf, RenderError> {
    let renderer = renderer.ok_or_else(|| RenderError::Unavailable("not configured".into()))?;
    let (input_path, mut input_file) = files
        .alloc(input_extension)
        .map_err(|e| RenderError::Failed(e.to_string()))?;
    input_file
        .write_all(input)
        .map_err(|e| RenderError::Failed(e.to_string()))?;
    drop(input_file);
    let (output_path, _) = files
        .alloc("png")
        .map_err(|e| RenderError::Failed(e.to_string()))?;
    renderer.render(&input_path, &output_path)?;
    Ok(output_path)
}

fn from_svg(svg: &str, options: &Options, files: &mut FileAllocator) -> ChunkKind {
    match render_with(options.svg_renderer.as_ref(), files, "svg", svg.as_bytes()) {
        Ok(path) => ChunkKind::Image(path),
        Err(e) => {
            log::debug!("[mimetype] SVG shown as text: {e}");
            ChunkKind::Text(format!("{svg}\n"))
        }
    }
}

fn from_base64_image(
    encoded: &str,
    extension: &str,
    files: &mut FileAllocator,
) -> anyhow::Result<ChunkKind> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64_STANDARD.decode(compact)?;
    let (path, mut file) = files.alloc(extension)?;
    file.write_all(&bytes)?;
    Ok(ChunkKind::Image(path))
}

fn image_chunk(
    data: &Map<String, Value>,
    options: &Options,
    files: &mut FileAllocator,
) -> Option<ChunkKind> {
    if let Some(svg) = data.get(SVG).and_then(payload_text) {
        return Some(from_svg(&svg, options, files));
    }

    if let Some(figure) = data.get(PLOTLY) {
        let json = figure.to_string();
        match render_with(options.plotly_renderer.as_ref(), files, "json", json.as_bytes()) {
            Ok(path) => return Some(ChunkKind::Image(path)),
            Err(e) => log::debug!("[mimetype] Skipping plotly figure: {e}"),
        }
    }

    if let Some(tex) = data.get(LATEX).and_then(payload_text) {
        match render_with(options.latex_renderer.as_ref(), files, "tex", tex.as_bytes()) {
            Ok(path) => return Some(ChunkKind::Image(path)),
            Err(e) => log::debug!("[mimetype] Skipping LaTeX: {e}"),
        }
    }

    let raw_images = data
        .iter()
        .filter(|(mime, _)| mime.as_str() == PNG)
        .chain(
            data.iter()
                .filter(|(mime, _)| mime.starts_with("image/") && *mime != PNG && *mime != SVG),
        );
    for (mime, value) in raw_images {
        let Some(encoded) = payload_text(value) else {
            continue;
        };
        let extension = mime.trim_start_matches("image/");
        match from_base64_image(&encoded, extension, files) {
            Ok(kind) => return Some(kind),
            Err(e) => log::debug!("[mimetype] Skipping {mime}: {e}"),
        }
    }
    None
}

/// Build the chunk for a mimetype bundle. Never fails: the last resort is an
/// [`ChunkKind::Unrenderable`] chunk listing the received mimetypes.
pub fn to_output_chunk(
    data: Map<String, Value>,
    metadata: Map<String, Value>,
    output_type: OutputType,
    options: &Options,
    files: &mut FileAllocator,
) -> OutputChunk {
    let mut kind = None;
    if options.image_provider() != ImageProvider::None {
        kind = image_chunk(&data, options, files);
    }
    let kind = kind.unwrap_or_else(|| match data.get(PLAIN).and_then(payload_text) {
        Some(text) => ChunkKind::Text(format!("{text}\n")),
        None => ChunkKind::Unrenderable(data.keys().cloned().collect()),
    });
    OutputChunk::new(kind, output_type).with_payload(data, metadata)
}
