//! Per-cell render state: the floating output panel, virtual-text output and
//! the blank lines reserved under a panel.

use chrono::Local;

use crate::config::EnterOutputBehavior;
use crate::output::{Output, OutputStatus, RenderTarget};
use crate::position::{BufferId, Position};
use crate::surface::{PanelId, PanelSpec, Ui, VirtualLinesId};

const BORDER_SIZE: usize = 2;

/// An [`Output`] together with whatever is currently drawn for it.
#[derive(Debug, Default)]
pub struct OutputView {
    pub output: Output,
    panel: Option<PanelId>,
    virtual_text: Option<(BufferId, VirtualLinesId)>,
    padding: Option<(BufferId, VirtualLinesId)>,
    displayed_status: Option<OutputStatus>,
}

impl OutputView {
    pub fn new(output: Output) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }

    pub fn has_panel(&self) -> bool {
        self.panel.is_some()
    }

    /// Lines of the rendered output, header first, and the number of screen
    /// lines they take beyond the header.
    pub fn build_output_text(
        &mut self,
        ui: &mut Ui<'_>,
        buffer: BufferId,
        origin: (usize, usize),
        width: usize,
        virtual_text: bool,
    ) -> (Vec<String>, usize) {
        let mut text = String::new();
        let mut extra_lines = 0;
        let mut lineno = 1;
        let mut x = origin.0;

        for chunk in &mut self.output.chunks {
            let y = if virtual_text { origin.1 } else { lineno };
            let mut target = RenderTarget {
                buffer,
                x,
                y,
                width,
                wrap: ui.options.wrap_output,
                canvas: &mut *ui.canvas,
            };
            let (chunk_text, chunk_extra) = chunk.render(&mut target);
            text.push_str(&chunk_text);
            lineno += chunk_text.matches('\n').count();
            extra_lines += chunk_extra;
            x = match text.rfind('\n') {
                Some(idx) => text[idx + 1..].chars().count(),
                None => text.chars().count(),
            };
        }

        let limit = ui.options.limit_output_chars;
        if limit > 0 && text.chars().count() > limit {
            let cut = text.char_indices().nth(limit).map_or(text.len(), |(i, _)| i);
            text.truncate(cut);
            text.push_str(&format!("\n...truncated to {limit} chars\n"));
        }

        let mut lines: Vec<String> = if text.is_empty() {
            Vec::new()
        } else {
            text.split('\n').map(str::to_string).collect()
        };
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        lines.insert(
            0,
            self.output
                .header_text(ui.options.output_show_exec_time, Local::now()),
        );
        let height = lines.len() - 1 + extra_lines;
        (lines, height)
    }

    /// How many lines above `line` the output should start so that it covers
    /// trailing blank or ignored lines. Zero or negative.
    pub fn calculate_offset(lines: &[String], line: usize, cover_prefixes: &[String]) -> isize {
        let mut offset = 0;
        let mut lineno = line;
        while lineno > 0 {
            let current = lines.get(lineno).map(String::as_str).unwrap_or("");
            let ignored = cover_prefixes.iter().any(|p| current.starts_with(p.as_str()));
            if !current.is_empty() && !ignored {
                return offset;
            }
            lineno -= 1;
            offset -= 1;
        }
        0
    }

    fn offset_for(&self, ui: &Ui<'_>, end: &Position) -> isize {
        if !ui.options.cover_empty_lines {
            return 0;
        }
        let lines = ui.host.buffer_lines(end.buffer);
        Self::calculate_offset(&lines, end.line, &ui.options.cover_lines_starting_with)
    }

    /// Open or move the floating panel below `end`.
    pub fn show_floating(&mut self, ui: &mut Ui<'_>, end: Position) {
        let window = ui.host.window();
        let offset = self.offset_for(ui, &end);
        let anchor_line = end.line.saturating_add_signed(offset);

        let row = if ui.options.cover_empty_lines {
            window.row_of(anchor_line).map(|row| row + 1)
        } else {
            window.row_of(end.line + 1)
        };
        let Some(row) = row.filter(|row| *row > 0) else {
            return;
        };

        let border = if ui.options.output_window_borders {
            BORDER_SIZE
        } else {
            0
        };
        let win_height = window.height.saturating_sub(border);
        let win_width = window.width.saturating_sub(border);
        let col = window.text_offset;
        let width = win_width.saturating_sub(col);

        let (lines, real_height) =
            self.build_output_text(ui, end.buffer, (col, row), width, false);

        if row >= win_height {
            return;
        }
        let max_height = (real_height + 1).min(ui.options.output_win_max_height);
        let spec = PanelSpec {
            buffer: end.buffer,
            row,
            col,
            width: width.min(ui.options.output_win_max_width),
            height: (win_height - row).min(max_height),
            border: ui.options.output_window_borders,
            wrap: ui.options.wrap_output,
        };

        let updated = match self.panel {
            Some(panel) => ui.host.update_panel(panel, &spec, &lines),
            None => false,
        };
        if !updated {
            self.panel = Some(ui.host.open_panel(&spec, &lines));
            ui.canvas.present();
        }

        if let Some((buffer, id)) = self.padding.take() {
            ui.host.clear_virtual_lines(buffer, id);
        }
        if ui.options.cover_empty_lines {
            let mut padding_line = anchor_line;
            let mut padding_height = max_height + border;
            if ui.options.virt_lines_off_by_1 {
                padding_line += 1;
                padding_height = padding_height.saturating_sub(1);
            }
            let blank = vec![String::new(); padding_height];
            let id = ui.host.set_virtual_lines(end.buffer, padding_line, &blank);
            self.padding = Some((end.buffer, id));
        }
    }

    fn remove_images(&self, ui: &mut Ui<'_>) {
        let mut removed = false;
        for id in self.output.chunks.iter().filter_map(|c| c.image_id()) {
            ui.canvas.remove_image(id);
            removed = true;
        }
        if removed {
            ui.canvas.present();
        }
    }

    /// Close the floating panel and release its images.
    pub fn clear_float(&mut self, ui: &mut Ui<'_>) {
        if let Some(panel) = self.panel.take() {
            ui.host.close_panel(panel);
            self.remove_images(ui);
        }
        if let Some((buffer, id)) = self.padding.take() {
            ui.host.clear_virtual_lines(buffer, id);
        }
    }

    /// Draw the output as virtual lines below `end`. A finished output that
    /// is already on screen is left alone.
    pub fn show_virtual(&mut self, ui: &mut Ui<'_>, end: Position) {
        if self.displayed_status == Some(OutputStatus::Done) && self.virtual_text.is_some() {
            return;
        }
        let offset = self.offset_for(ui, &end);
        self.displayed_status = Some(self.output.status);

        if let Some((buffer, id)) = self.virtual_text.take() {
            ui.host.clear_virtual_lines(buffer, id);
        }

        let window = ui.host.window();
        let line_count = ui.host.buffer_lines(end.buffer).len();
        let mut row = end.line.saturating_add_signed(offset);
        if ui.options.virt_lines_off_by_1 && row + 1 < line_count.saturating_sub(1) {
            row += 1;
        }
        row = row.min(line_count.saturating_sub(1));

        let width = window.width.saturating_sub(window.text_offset);
        let (mut lines, _) = self.build_output_text(ui, end.buffer, (0, row), width, true);
        let max = ui.options.virt_text_max_lines.max(1);
        if lines.len() > max {
            let hidden = lines.len() - max + 1;
            lines.truncate(max - 1);
            lines.push(format!("+{hidden} more lines"));
        }

        let id = ui.host.set_virtual_lines(end.buffer, row, &lines);
        self.virtual_text = Some((end.buffer, id));
        ui.canvas.present();
    }

    pub fn clear_virtual(&mut self, ui: &mut Ui<'_>) {
        if let Some((buffer, id)) = self.virtual_text.take() {
            ui.host.clear_virtual_lines(buffer, id);
        }
        self.displayed_status = None;
        self.remove_images(ui);
    }

    /// Move focus into the output. Returns whether the panel should stay
    /// shown afterwards.
    pub fn enter(&mut self, ui: &mut Ui<'_>, end: Position) -> bool {
        let behavior = ui.options.enter_output_behavior;
        let mut entered = false;
        match self.panel {
            None => match behavior {
                EnterOutputBehavior::OpenThenEnter => self.show_floating(ui, end),
                EnterOutputBehavior::OpenAndEnter => {
                    self.show_floating(ui, end);
                    entered = self.focus(ui);
                }
                EnterOutputBehavior::NoOpen => return false,
            },
            Some(_) => {
                if behavior != EnterOutputBehavior::NoOpen {
                    entered = self.focus(ui);
                }
            }
        }
        !(entered && ui.options.output_win_hide_on_leave)
    }

    fn focus(&self, ui: &mut Ui<'_>) -> bool {
        match self.panel {
            Some(panel) => {
                ui.host.focus_panel(panel);
                true
            }
            None => false,
        }
    }

    /// Release everything drawn for this output.
    pub fn dispose(&mut self, ui: &mut Ui<'_>) {
        self.clear_float(ui);
        self.clear_virtual(ui);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::headless::HeadlessHost;
    use crate::output::{OutputChunk, OutputType};
    use crate::surface::{NoCanvas, WindowGeometry};

    fn lines(text: &[&str]) -> Vec<String> {
        text.iter().map(|s| s.to_string()).collect()
    }

    fn done_output(text: &str) -> Output {
        let mut output = Output::new(Some(1));
        output.status = OutputStatus::Done;
        output
            .chunks
            .push(OutputChunk::text_line(text, OutputType::DisplayData));
        output
    }

    #[test]
    fn test_calculate_offset_skips_blank_and_prefixed_lines() {
        let buf = lines(&["x = 1", "y = 2", "", "# %%", ""]);
        let prefixes = vec!["# %%".to_string()];
        assert_eq!(OutputView::calculate_offset(&buf, 4, &prefixes), -3);
        assert_eq!(OutputView::calculate_offset(&buf, 1, &prefixes), 0);
        assert_eq!(OutputView::calculate_offset(&lines(&["", ""]), 1, &[]), 0);
    }

    #[test]
    fn test_build_output_text_truncates_and_trims() {
        let mut host = HeadlessHost::new();
        let buf = host.open_buffer(None, "x");
        let mut canvas = NoCanvas;
        let mut options = Options::default();
        options.limit_output_chars = 5;
        options.output_show_exec_time = false;
        let mut ui = Ui {
            host: &mut host,
            canvas: &mut canvas,
            options: &options,
        };

        let mut view = OutputView::new(done_output("abcdefgh"));
        let (text, height) = view.build_output_text(&mut ui, buf, (0, 0), 80, false);
        assert_eq!(
            text,
            lines(&["Out[1]: ✓ Done", "abcde", "...truncated to 5 chars"])
        );
        assert_eq!(height, 2);
    }

    #[test]
    fn test_floating_panel_placement() {
        let mut host = HeadlessHost::new();
        let buf = host.open_buffer(None, "x = 1\nprint(x)\n\nz");
        host.set_window(WindowGeometry {
            width: 40,
            height: 20,
            text_offset: 3,
            top_line: 0,
        });
        let mut canvas = NoCanvas;
        let options = Options::default();
        let mut ui = Ui {
            host: &mut host,
            canvas: &mut canvas,
            options: &options,
        };

        let mut view = OutputView::new(done_output("1"));
        view.show_floating(&mut ui, Position::new(buf, 1, 8));
        view.show_floating(&mut ui, Position::new(buf, 1, 8));
        assert!(view.has_panel());

        let panels: Vec<_> = host.panels().collect();
        assert_eq!(panels.len(), 1);
        let spec = &panels[0].spec;
        assert_eq!(spec.row, 2);
        assert_eq!(spec.col, 3);
        assert_eq!(spec.width, 35);
        assert_eq!(spec.height, 2);
        assert_eq!(panels[0].lines, lines(&["Out[1]: ✓ Done", "1"]));
    }

    #[test]
    fn test_cover_empty_lines_reserves_padding() {
        let mut host = HeadlessHost::new();
        let buf = host.open_buffer(None, "a\nx = 1\n\n\ny");
        let mut canvas = NoCanvas;
        let mut options = Options::default();
        options.cover_empty_lines = true;
        let mut ui = Ui {
            host: &mut host,
            canvas: &mut canvas,
            options: &options,
        };

        let mut view = OutputView::new(done_output("1"));
        view.show_floating(&mut ui, Position::new(buf, 3, 0));

        let spec = host.panels().next().unwrap().spec.clone();
        assert_eq!(spec.row, 2);
        let padding = host.virtual_lines(buf);
        assert_eq!(padding.len(), 1);
        assert_eq!(padding[0].line, 1);
        assert_eq!(padding[0].lines.len(), 4);
    }

    #[test]
    fn test_panel_not_shown_when_scrolled_out() {
        let mut host = HeadlessHost::new();
        let buf = host.open_buffer(None, "a\nb\nc");
        host.set_window(WindowGeometry {
            width: 40,
            height: 20,
            text_offset: 0,
            top_line: 5,
        });
        let mut canvas = NoCanvas;
        let options = Options::default();
        let mut ui = Ui {
            host: &mut host,
            canvas: &mut canvas,
            options: &options,
        };
        let mut view = OutputView::new(done_output("1"));
        view.show_floating(&mut ui, Position::new(buf, 1, 1));
        assert!(!view.has_panel());
    }

    #[test]
    fn test_virtual_text_is_capped() {
        let mut host = HeadlessHost::new();
        let buf = host.open_buffer(None, "for i in range(5): print(i)\n");
        let mut canvas = NoCanvas;
        let mut options = Options::default();
        options.virt_text_max_lines = 3;
        options.output_show_exec_time = false;
        let mut ui = Ui {
            host: &mut host,
            canvas: &mut canvas,
            options: &options,
        };

        let mut view = OutputView::new(done_output("0\n1\n2\n3\n4"));
        view.show_virtual(&mut ui, Position::new(buf, 0, 27));
        view.show_virtual(&mut ui, Position::new(buf, 0, 27));

        let virt = host.virtual_lines(buf);
        assert_eq!(virt.len(), 1);
        assert_eq!(
            virt[0].lines,
            lines(&["Out[1]: ✓ Done", "0", "+4 more lines"])
        );
    }

    #[test]
    fn test_enter_behaviours() {
        let mut host = HeadlessHost::new();
        let buf = host.open_buffer(None, "x\ny");
        let mut canvas = NoCanvas;
        let mut options = Options::default();
        options.enter_output_behavior = EnterOutputBehavior::NoOpen;

        {
            let mut ui = Ui {
                host: &mut host,
                canvas: &mut canvas,
                options: &options,
            };
            let mut view = OutputView::new(done_output("1"));
            assert!(!view.enter(&mut ui, Position::new(buf, 0, 1)));
            assert!(!view.has_panel());
        }

        options.enter_output_behavior = EnterOutputBehavior::OpenAndEnter;
        let mut ui = Ui {
            host: &mut host,
            canvas: &mut canvas,
            options: &options,
        };
        let mut view = OutputView::new(done_output("1"));
        assert!(!view.enter(&mut ui, Position::new(buf, 0, 1)));
        assert!(host.panels().next().unwrap().focused);
    }
}
