//! User options.
//!
//! Options are stored as JSON in the user's config directory:
//! - Linux: ~/.config/kcell/options.json
//! - macOS: ~/Library/Application Support/kcell/options.json
//!
//! Every field has a default, so a partial file (or none at all) is valid.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SessionError;

/// What `enter_output` does when the output panel is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnterOutputBehavior {
    /// First call opens the panel, the second one enters it.
    #[default]
    OpenThenEnter,
    /// Open and enter in one call.
    OpenAndEnter,
    /// Only enter a panel that is already open.
    NoOpen,
}

/// Image backend selected by `image_provider`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageProvider {
    None,
    Host,
}

/// An external renderer invocation. `{input}` and `{output}` in `argv` are
/// replaced by file paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendererCommand {
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub auto_open_output: bool,
    pub wrap_output: bool,
    pub output_window_borders: bool,
    pub show_mimetype_debug: bool,
    pub cell_highlight_group: String,
    pub save_path: PathBuf,
    /// `"none"` or `"host"`.
    pub image_provider: String,
    pub copy_output: bool,
    pub enter_output_behavior: EnterOutputBehavior,
    pub virt_text_output: bool,
    pub virt_text_max_lines: usize,
    /// Place the output panel over empty lines following the cell.
    pub cover_empty_lines: bool,
    /// Lines starting with one of these prefixes count as empty.
    pub cover_lines_starting_with: Vec<String>,
    pub virt_lines_off_by_1: bool,
    pub limit_output_chars: usize,
    pub output_show_exec_time: bool,
    pub output_win_max_height: usize,
    pub output_win_max_width: usize,
    pub output_win_hide_on_leave: bool,
    pub tick_rate_ms: u64,
    pub input_tick_rate_ms: u64,
    pub svg_renderer: Option<RendererCommand>,
    pub plotly_renderer: Option<RendererCommand>,
    pub latex_renderer: Option<RendererCommand>,
}

fn default_save_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kcell")
}

impl Default for Options {
    fn default() -> Self {
        Self {
            auto_open_output: true,
            wrap_output: false,
            output_window_borders: true,
            show_mimetype_debug: false,
            cell_highlight_group: "CursorLine".to_string(),
            save_path: default_save_path(),
            image_provider: "none".to_string(),
            copy_output: false,
            enter_output_behavior: EnterOutputBehavior::OpenThenEnter,
            virt_text_output: false,
            virt_text_max_lines: 12,
            cover_empty_lines: false,
            cover_lines_starting_with: Vec::new(),
            virt_lines_off_by_1: false,
            limit_output_chars: 1_000_000,
            output_show_exec_time: true,
            output_win_max_height: 999_999,
            output_win_max_width: 999_999,
            output_win_hide_on_leave: true,
            tick_rate_ms: 500,
            input_tick_rate_ms: 500,
            svg_renderer: None,
            plotly_renderer: None,
            latex_renderer: None,
        }
    }
}

impl Options {
    /// The configured image provider. Unknown names fall back to `None`.
    pub fn image_provider(&self) -> ImageProvider {
        match self.image_provider.as_str() {
            "host" => ImageProvider::Host,
            "none" => ImageProvider::None,
            other => {
                log::warn!("[config] Unknown image provider '{other}', images are disabled");
                ImageProvider::None
            }
        }
    }

    /// Update a single option by name.
    pub fn update(&mut self, name: &str, value: Value) -> Result<(), SessionError> {
        let mut fields = match serde_json::to_value(&*self) {
            Ok(Value::Object(fields)) => fields,
            _ => {
                return Err(SessionError::InvalidOption {
                    name: name.to_string(),
                    reason: "options are not serializable".to_string(),
                })
            }
        };
        if !fields.contains_key(name) {
            return Err(SessionError::UnknownOption(name.to_string()));
        }
        fields.insert(name.to_string(), value);
        let updated: Options =
            serde_json::from_value(Value::Object(fields)).map_err(|e| SessionError::InvalidOption {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        *self = updated;
        Ok(())
    }
}

fn options_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kcell")
        .join("options.json")
}

/// Load options from disk, returning defaults if the file is missing or invalid.
pub fn load_options() -> Options {
    let path = options_path();
    if !path.exists() {
        return Options::default();
    }
    match std::fs::read_to_string(&path)
        .map_err(anyhow::Error::from)
        .and_then(|s| serde_json::from_str(&s).map_err(anyhow::Error::from))
    {
        Ok(options) => options,
        Err(e) => {
            log::warn!("[config] Ignoring invalid options file {}: {e}", path.display());
            Options::default()
        }
    }
}

pub fn save_options(options: &Options) -> Result<()> {
    let path = options_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(options)?)?;
    Ok(())
}
