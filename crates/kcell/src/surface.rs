//! Presentation surface: what the core needs from the host UI.
//!
//! The host implements [`Surface`] (floating panels, virtual lines, highlights,
//! notifications, stdin prompts, clipboard) and optionally an [`ImagePlacer`]
//! for terminal images. Image placement goes through a [`Canvas`], which queues
//! additions and removals and applies them in one `present()` per redraw.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::config::Options;
use crate::position::{BufferId, TextHost};

pub const NOTIFY_PREFIX: &str = "[kcell]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Info => write!(f, "info"),
            Level::Warn => write!(f, "warn"),
            Level::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PanelId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualLinesId(pub u64);

/// Geometry of the window showing the current buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGeometry {
    pub width: usize,
    pub height: usize,
    /// Columns taken by the gutter (sign column, line numbers).
    pub text_offset: usize,
    /// First buffer line visible in the window.
    pub top_line: usize,
}

impl WindowGeometry {
    /// Window row of a buffer line, `None` when scrolled out above.
    pub fn row_of(&self, line: usize) -> Option<usize> {
        line.checked_sub(self.top_line)
    }
}

/// Placement of a floating output panel, relative to the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelSpec {
    pub buffer: BufferId,
    pub row: usize,
    pub col: usize,
    pub width: usize,
    pub height: usize,
    pub border: bool,
    pub wrap: bool,
}

/// A highlighted column range on one line; `end_col: None` runs to end of line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighlightRange {
    pub line: usize,
    pub start_col: usize,
    pub end_col: Option<usize>,
}

pub trait Surface {
    fn window(&self) -> WindowGeometry;

    fn open_panel(&mut self, spec: &PanelSpec, lines: &[String]) -> PanelId;

    /// Returns false when the panel no longer exists.
    fn update_panel(&mut self, panel: PanelId, spec: &PanelSpec, lines: &[String]) -> bool;

    fn close_panel(&mut self, panel: PanelId);

    fn focus_panel(&mut self, panel: PanelId);

    /// Show `lines` as virtual lines below `line`.
    fn set_virtual_lines(&mut self, buffer: BufferId, line: usize, lines: &[String])
        -> VirtualLinesId;

    fn clear_virtual_lines(&mut self, buffer: BufferId, id: VirtualLinesId);

    /// Highlights are grouped by `owner` so each kernel clears only its own.
    fn add_highlight(&mut self, buffer: BufferId, owner: &str, range: HighlightRange, group: &str);

    fn clear_highlights(&mut self, buffer: BufferId, owner: &str);

    fn notify(&mut self, level: Level, message: &str);

    /// Ask the user for kernel stdin; the answer comes back through
    /// `Session::send_input`.
    fn prompt_input(&mut self, kernel_id: &str, prompt: &str, password: bool);

    fn copy_to_clipboard(&mut self, text: &str);
}

/// Everything the core needs from the editor.
pub trait Host: TextHost + Surface {}

impl<T: TextHost + Surface> Host for T {}

/// Borrowed context threaded through coordinator and runtime operations.
pub struct Ui<'a> {
    pub host: &'a mut dyn Host,
    pub canvas: &'a mut dyn Canvas,
    pub options: &'a Options,
}

impl Ui<'_> {
    pub fn notify_info(&mut self, message: &str) {
        self.host
            .notify(Level::Info, &format!("{NOTIFY_PREFIX} {message}"));
    }

    pub fn notify_warn(&mut self, message: &str) {
        self.host
            .notify(Level::Warn, &format!("{NOTIFY_PREFIX} {message}"));
    }

    pub fn notify_error(&mut self, message: &str) {
        self.host
            .notify(Level::Error, &format!("{NOTIFY_PREFIX} {message}"));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageId(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImagePlacement {
    pub buffer: BufferId,
    pub x: usize,
    pub y: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageSize {
    pub width: usize,
    pub height: usize,
}

/// Image operations shared by every kernel attached to a buffer.
pub trait Canvas {
    /// Apply queued additions and removals.
    fn present(&mut self);

    /// Hide every visible image immediately.
    fn clear(&mut self);

    /// Queue an image for display; takes effect on `present`.
    fn add_image(&mut self, path: &Path, placement: ImagePlacement) -> ImageId;

    /// Queue an image for removal; takes effect on `present`.
    fn remove_image(&mut self, id: &ImageId);

    /// Size in terminal cells.
    fn image_size(&self, id: &ImageId) -> ImageSize;

    fn deinit(&mut self);
}

/// Canvas used when no image provider is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCanvas;

impl Canvas for NoCanvas {
    fn present(&mut self) {}

    fn clear(&mut self) {}

    fn add_image(&mut self, path: &Path, _placement: ImagePlacement) -> ImageId {
        ImageId(path.display().to_string())
    }

    fn remove_image(&mut self, _id: &ImageId) {}

    fn image_size(&self, _id: &ImageId) -> ImageSize {
        ImageSize::default()
    }

    fn deinit(&mut self) {}
}

/// Host primitive that actually draws images.
pub trait ImagePlacer {
    /// Register an image and return its identifier. Must not draw yet.
    fn load(&mut self, path: &Path, placement: ImagePlacement) -> ImageId;

    fn render(&mut self, id: &ImageId, size: ImageSize);

    fn hide(&mut self, id: &ImageId);

    fn size(&self, id: &ImageId) -> ImageSize;

    fn clear_all(&mut self);
}

/// Canvas that batches image changes until `present`.
///
/// An image both added and removed since the last `present` is left alone.
pub struct BatchedCanvas<P: ImagePlacer> {
    placer: P,
    visible: HashSet<ImageId>,
    to_show: HashSet<ImageId>,
    to_hide: HashSet<ImageId>,
}

impl<P: ImagePlacer> BatchedCanvas<P> {
    pub fn new(placer: P) -> Self {
        Self {
            placer,
            visible: HashSet::new(),
            to_show: HashSet::new(),
            to_hide: HashSet::new(),
        }
    }

    pub fn placer(&self) -> &P {
        &self.placer
    }

    pub fn visible(&self) -> &HashSet<ImageId> {
        &self.visible
    }
}

impl<P: ImagePlacer> Canvas for BatchedCanvas<P> {
    fn present(&mut self) {
        let show: Vec<ImageId> = self.to_show.difference(&self.to_hide).cloned().collect();
        let hide: Vec<ImageId> = self.to_hide.difference(&self.to_show).cloned().collect();

        for id in &hide {
            self.placer.hide(id);
            self.visible.remove(id);
        }
        for id in show {
            let size = self.placer.size(&id);
            self.placer.render(&id, size);
            self.visible.insert(id);
        }
        self.to_show.clear();
        self.to_hide.clear();
    }

    fn clear(&mut self) {
        for id in &self.visible {
            self.placer.hide(id);
        }
        self.visible.clear();
    }

    fn add_image(&mut self, path: &Path, placement: ImagePlacement) -> ImageId {
        let id = self.placer.load(path, placement);
        self.to_show.insert(id.clone());
        id
    }

    fn remove_image(&mut self, id: &ImageId) {
        self.to_hide.insert(id.clone());
    }

    fn image_size(&self, id: &ImageId) -> ImageSize {
        self.placer.size(id)
    }

    fn deinit(&mut self) {
        self.placer.clear_all();
        self.visible.clear();
        self.to_show.clear();
        self.to_hide.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingPlacer {
        rendered: Vec<String>,
        hidden: Vec<String>,
        sizes: HashMap<String, ImageSize>,
    }

    impl ImagePlacer for RecordingPlacer {
        fn load(&mut self, path: &Path, _placement: ImagePlacement) -> ImageId {
            let id = path.display().to_string();
            self.sizes.insert(
                id.clone(),
                ImageSize {
                    width: 10,
                    height: 4,
                },
            );
            ImageId(id)
        }

        fn render(&mut self, id: &ImageId, _size: ImageSize) {
            self.rendered.push(id.0.clone());
        }

        fn hide(&mut self, id: &ImageId) {
            self.hidden.push(id.0.clone());
        }

        fn size(&self, id: &ImageId) -> ImageSize {
            self.sizes.get(&id.0).copied().unwrap_or_default()
        }

        fn clear_all(&mut self) {
            self.sizes.clear();
        }
    }

    fn placement() -> ImagePlacement {
        ImagePlacement {
            buffer: BufferId(1),
            x: 0,
            y: 3,
        }
    }

    #[test]
    fn test_add_takes_effect_on_present() {
        let mut canvas = BatchedCanvas::new(RecordingPlacer::default());
        let id = canvas.add_image(Path::new("/tmp/a.png"), placement());
        assert!(canvas.placer().rendered.is_empty());

        canvas.present();
        assert_eq!(canvas.placer().rendered, vec!["/tmp/a.png".to_string()]);
        assert!(canvas.visible().contains(&id));
        assert_eq!(canvas.image_size(&id).height, 4);
    }

    #[test]
    fn test_add_then_remove_in_same_batch_is_noop() {
        let mut canvas = BatchedCanvas::new(RecordingPlacer::default());
        let id = canvas.add_image(Path::new("/tmp/a.png"), placement());
        canvas.remove_image(&id);
        canvas.present();

        assert!(canvas.placer().rendered.is_empty());
        assert!(canvas.placer().hidden.is_empty());
        assert!(canvas.visible().is_empty());
    }

    #[test]
    fn test_remove_visible_image() {
        let mut canvas = BatchedCanvas::new(RecordingPlacer::default());
        let id = canvas.add_image(Path::new("/tmp/a.png"), placement());
        canvas.present();
        canvas.remove_image(&id);
        canvas.present();

        assert_eq!(canvas.placer().hidden, vec!["/tmp/a.png".to_string()]);
        assert!(canvas.visible().is_empty());
    }

    #[test]
    fn test_no_canvas_reports_zero_height() {
        let mut canvas = NoCanvas;
        let id = canvas.add_image(Path::new("/tmp/a.png"), placement());
        assert_eq!(canvas.image_size(&id), ImageSize::default());
    }

    #[test]
    fn test_window_row_of() {
        let window = WindowGeometry {
            width: 80,
            height: 20,
            text_offset: 4,
            top_line: 10,
        };
        assert_eq!(window.row_of(12), Some(2));
        assert_eq!(window.row_of(3), None);
    }
}
