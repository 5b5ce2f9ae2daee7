//! Kernel coordinator: the cells and outputs of one kernel, and the FIFO
//! queue that feeds the kernel's messages into them.

use std::collections::VecDeque;

use log::{debug, info, warn};

use crate::cell::{Cell, Span};
use crate::config::EnterOutputBehavior;
use crate::history::History;
use crate::output::{Output, OutputStatus};
use crate::position::{BufferId, TextHost};
use crate::runtime::JupyterRuntime;
use crate::surface::{HighlightRange, Ui};
use crate::view::OutputView;

/// A cell together with its output and the code it last ran.
#[derive(Debug)]
pub struct CellEntry {
    pub cell: Cell,
    pub view: OutputView,
    pub code: String,
}

/// Output the tick loop is feeding.
#[derive(Debug)]
enum Current {
    Cell(Cell),
    /// The cell was deleted while its execution was pending. Its messages
    /// are drained into this output so the next cell does not receive them.
    Detached(Output),
}

pub struct KernelCoordinator {
    kernel_id: String,
    buffers: Vec<BufferId>,
    runtime: JupyterRuntime,
    entries: Vec<CellEntry>,
    current: Option<Current>,
    /// One slot per execution request sent; `None` once its cell is gone.
    queued: VecDeque<Option<Cell>>,
    selected_cell: Option<Cell>,
    should_show_floating_win: bool,
    updating_interface: bool,
    history: History,
}

impl KernelCoordinator {
    pub fn new(runtime: JupyterRuntime, buffer: BufferId) -> Self {
        Self {
            kernel_id: runtime.kernel_id().to_string(),
            buffers: vec![buffer],
            runtime,
            entries: Vec::new(),
            current: None,
            queued: VecDeque::new(),
            selected_cell: None,
            should_show_floating_win: false,
            updating_interface: false,
            history: History::new(),
        }
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn kernel_name(&self) -> &str {
        self.runtime.kernel_name()
    }

    pub fn runtime(&self) -> &JupyterRuntime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut JupyterRuntime {
        &mut self.runtime
    }

    pub fn buffers(&self) -> &[BufferId] {
        &self.buffers
    }

    pub fn add_buffer(&mut self, buffer: BufferId) {
        if !self.buffers.contains(&buffer) {
            self.buffers.push(buffer);
        }
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn selected_cell(&self) -> Option<&Cell> {
        self.selected_cell.as_ref()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CellEntry> {
        self.entries.iter()
    }

    pub fn output(&self, cell: &Cell) -> Option<&Output> {
        self.entry(cell).map(|e| &e.view.output)
    }

    fn entry(&self, cell: &Cell) -> Option<&CellEntry> {
        self.entries.iter().find(|e| e.cell == *cell)
    }

    fn entry_mut(&mut self, cell: &Cell) -> Option<&mut CellEntry> {
        self.entries.iter_mut().find(|e| e.cell == *cell)
    }

    /// Cells with a resolvable extent, ordered by buffer then begin position.
    pub fn sorted_cells<T: TextHost + ?Sized>(&self, text: &T) -> Vec<(Cell, Span)> {
        let mut cells: Vec<(Cell, Span)> = self
            .entries
            .iter()
            .filter_map(|e| e.cell.span(text).map(|span| (e.cell.clone(), span)))
            .collect();
        cells.sort_by_key(|(_, span)| (span.begin.buffer, span.begin.line, span.begin.column));
        cells
    }

    /// Cells that overlap `span`.
    pub fn overlapping<T: TextHost + ?Sized>(&self, text: &T, span: &Span) -> Vec<Cell> {
        self.entries
            .iter()
            .filter(|e| e.cell.overlaps(text, span))
            .map(|e| e.cell.clone())
            .collect()
    }

    /// Whether every cell overlapping `span` could be deleted.
    pub fn can_replace<T: TextHost + ?Sized>(&self, text: &T, span: &Span) -> bool {
        self.entries
            .iter()
            .filter(|e| e.cell.overlaps(text, span))
            .all(|e| e.view.output.status != OutputStatus::Running)
    }

    /// Whether no execution is pending.
    pub fn is_idle(&self) -> bool {
        let current_done = match &self.current {
            None => true,
            Some(Current::Detached(output)) => output.status == OutputStatus::Done,
            Some(Current::Cell(cell)) => self
                .output(cell)
                .is_none_or(|output| output.status == OutputStatus::Done),
        };
        current_done && self.queued.is_empty()
    }

    /// Remove the cells overlapping `cell`, keeping `cell`'s own anchors.
    /// Refuses, changing nothing, when one of them is running.
    fn try_delete_overlapping_cells(&mut self, cell: &Cell, ui: &mut Ui<'_>) -> bool {
        let Some(span) = cell.span(&*ui.host) else {
            return false;
        };
        if !self.can_replace(&*ui.host, &span) {
            ui.notify_warn(
                "Cannot delete a running cell. Wait for it to finish or interrupt the kernel before creating an overlapping cell.",
            );
            return false;
        }
        for other in self.overlapping(&*ui.host, &span) {
            let keep_anchors = other == *cell;
            self.remove_cell(&other, keep_anchors, ui);
        }
        true
    }

    /// Queue `code` for execution in `cell`. Returns false when the cell was
    /// not run; the cell's anchors are released unless it was already known.
    pub fn run_code(&mut self, code: &str, cell: Cell, ui: &mut Ui<'_>) -> bool {
        let known = self.entry(&cell).is_some();
        if !self.try_delete_overlapping_cells(&cell, ui) {
            if !known {
                cell.dispose(&mut *ui.host);
            }
            return false;
        }
        if let Err(e) = self.runtime.run_code(code) {
            warn!("[coordinator] {}: execute failed: {e:#}", self.kernel_id);
            ui.notify_error(&format!("Could not run code on kernel '{}': {e}", self.kernel_id));
            cell.dispose(&mut *ui.host);
            return false;
        }

        self.entries.push(CellEntry {
            cell: cell.clone(),
            view: OutputView::new(Output::new(None)),
            code: code.to_string(),
        });
        self.queued.push_back(Some(cell.clone()));
        self.selected_cell = Some(cell);
        if !ui.options.virt_text_output {
            self.should_show_floating_win = true;
        }

        self.update_interface(ui);
        self.check_if_done_running();
        true
    }

    /// Register a cell without running it.
    pub fn define_cell(&mut self, cell: Cell, ui: &mut Ui<'_>) -> bool {
        let code = cell.text(&*ui.host);
        if !self.try_delete_overlapping_cells(&cell, ui) {
            cell.dispose(&mut *ui.host);
            return false;
        }
        self.entries.push(CellEntry {
            cell,
            view: OutputView::new(Output::never_run()),
            code,
        });
        true
    }

    /// Add a cell with an output restored from disk or a notebook.
    pub fn restore(&mut self, cell: Cell, output: Output, code: String) {
        self.entries.push(CellEntry {
            cell,
            view: OutputView::new(output),
            code,
        });
    }

    pub fn reevaluate_cell(&mut self, ui: &mut Ui<'_>) -> bool {
        self.selected_cell = self.selected_span(&*ui.host);
        let Some(cell) = self.selected_cell.clone() else {
            return false;
        };
        let code = cell.text(&*ui.host);
        self.run_code(&code, cell, ui);
        true
    }

    pub fn reevaluate_all(&mut self, ui: &mut Ui<'_>) {
        for (cell, _) in self.sorted_cells(&*ui.host) {
            let code = cell.text(&*ui.host);
            self.run_code(&code, cell, ui);
        }
    }

    fn check_if_done_running(&mut self) {
        let idle = match &self.current {
            None => true,
            Some(Current::Detached(output)) => output.status == OutputStatus::Done,
            Some(Current::Cell(cell)) => self
                .output(cell)
                .is_none_or(|output| output.status == OutputStatus::Done),
        };
        if !idle {
            return;
        }
        if let Some(next) = self.queued.pop_front() {
            self.current = Some(match next {
                Some(cell) if self.entry(&cell).is_some() => Current::Cell(cell),
                _ => Current::Detached(Output::new(None)),
            });
        }
    }

    /// Feed pending kernel messages into the current output.
    pub fn tick(&mut self, ui: &mut Ui<'_>) {
        self.check_if_done_running();

        let was_ready = self.runtime.is_ready();
        let did_stuff = match self.current.as_mut() {
            None => self.runtime.tick(None, ui),
            Some(Current::Detached(output)) => self.runtime.tick(Some(output), ui),
            Some(Current::Cell(cell)) => match self.entries.iter_mut().find(|e| e.cell == *cell) {
                None => self.runtime.tick(None, ui),
                Some(entry) => {
                    let was_done = entry.view.output.status == OutputStatus::Done;
                    let did_stuff = self.runtime.tick(Some(&mut entry.view.output), ui);
                    if !was_done && entry.view.output.status == OutputStatus::Done {
                        debug!("[coordinator] {}: cell finished", self.kernel_id);
                        self.history.add(&entry.cell, &entry.code, &entry.view.output);
                    }
                    did_stuff
                }
            },
        };

        if did_stuff {
            self.update_interface(ui);
        }
        if !was_ready && self.runtime.is_ready() {
            info!("[coordinator] {} is ready", self.kernel_id);
            ui.notify_info(&format!(
                "Kernel '{}' (id: {}) is ready.",
                self.runtime.kernel_name(),
                self.kernel_id
            ));
        }
    }

    pub fn tick_input(&mut self, ui: &mut Ui<'_>) {
        self.runtime.tick_input(ui);
    }

    pub fn send_input(&mut self, value: &str, ui: &mut Ui<'_>) {
        if let Err(e) = self.runtime.send_input(value) {
            ui.notify_error(&format!("Could not send input to '{}': {e}", self.kernel_id));
        }
    }

    pub fn interrupt(&mut self, ui: &mut Ui<'_>) {
        if let Err(e) = self.runtime.interrupt() {
            ui.notify_error(&format!("Could not interrupt '{}': {e}", self.kernel_id));
        }
    }

    /// Restart the kernel. Pending executions are lost with the old kernel:
    /// their outputs are finished as failed and the queue is dropped.
    pub fn restart(&mut self, delete_outputs: bool, ui: &mut Ui<'_>) {
        if delete_outputs {
            for entry in &mut self.entries {
                entry.view.dispose(ui);
                entry.cell.dispose(&mut *ui.host);
            }
            self.entries.clear();
            self.history.clear();
            self.selected_cell = None;
            self.clear_interface(ui);
        } else {
            for entry in &mut self.entries {
                let output = &mut entry.view.output;
                if matches!(output.status, OutputStatus::Hold | OutputStatus::Running) {
                    output.success = false;
                    output.mark_done();
                }
            }
        }
        self.queued.clear();
        self.current = None;

        if let Err(e) = self.runtime.restart() {
            ui.notify_error(&format!("Could not restart '{}': {e}", self.kernel_id));
        }
    }

    /// Release every cell and shut the kernel down.
    pub fn deinit(&mut self, ui: &mut Ui<'_>) {
        for entry in &mut self.entries {
            entry.view.dispose(ui);
            entry.cell.dispose(&mut *ui.host);
        }
        self.entries.clear();
        self.queued.clear();
        self.current = None;
        self.selected_cell = None;
        for buffer in &self.buffers {
            ui.host.clear_highlights(*buffer, &self.kernel_id);
        }
        self.runtime.deinit();
    }

    /// Detach a buffer, dropping its cells. Returns true when no buffer is
    /// left.
    pub fn remove_buffer(&mut self, buffer: BufferId, ui: &mut Ui<'_>) -> bool {
        let cells: Vec<Cell> = self
            .entries
            .iter()
            .filter(|e| e.cell.buffer() == buffer)
            .map(|e| e.cell.clone())
            .collect();
        for cell in cells {
            self.remove_cell(&cell, false, ui);
        }
        self.buffers.retain(|b| *b != buffer);
        self.buffers.is_empty()
    }

    /// Delete a cell unless it is running.
    pub fn delete_cell(&mut self, cell: &Cell, quiet: bool, ui: &mut Ui<'_>) -> bool {
        let running = self
            .output(cell)
            .is_some_and(|output| output.status == OutputStatus::Running);
        if running {
            if !quiet {
                ui.notify_warn(
                    "Cannot delete a running cell. Wait for it to finish or interrupt the kernel before creating an overlapping cell.",
                );
            }
            return false;
        }
        self.remove_cell(cell, false, ui);
        true
    }

    fn remove_cell(&mut self, cell: &Cell, keep_anchors: bool, ui: &mut Ui<'_>) {
        let Some(idx) = self.entries.iter().position(|e| e.cell == *cell) else {
            return;
        };
        let mut entry = self.entries.remove(idx);
        entry.view.dispose(ui);
        ui.host.clear_highlights(cell.buffer(), &self.kernel_id);
        if !keep_anchors {
            self.history.remove(cell);
            cell.dispose(&mut *ui.host);
        }

        for slot in self.queued.iter_mut() {
            if slot.as_ref() == Some(cell) {
                *slot = None;
            }
        }
        if matches!(&self.current, Some(Current::Cell(c)) if c == cell) {
            self.current = match entry.view.output.status {
                OutputStatus::Done => None,
                _ => Some(Current::Detached(entry.view.output)),
            };
        }
        if self.selected_cell.as_ref() == Some(cell) {
            self.selected_cell = None;
        }
    }

    pub fn delete_current_cell(&mut self, ui: &mut Ui<'_>) {
        self.selected_cell = self.selected_span(&*ui.host);
        if let Some(cell) = self.selected_cell.clone() {
            self.delete_cell(&cell, false, ui);
        }
        self.selected_cell = None;
    }

    fn clear_empty_spans(&mut self, ui: &mut Ui<'_>) {
        let empty: Vec<Cell> = self
            .entries
            .iter()
            .filter(|e| e.cell.is_empty(&*ui.host))
            .map(|e| e.cell.clone())
            .collect();
        for cell in empty {
            self.delete_cell(&cell, true, ui);
        }
    }

    /// The most recently created cell under the cursor.
    fn selected_span<T: TextHost + ?Sized>(&self, text: &T) -> Option<Cell> {
        let cursor = text.cursor();
        self.entries
            .iter()
            .rev()
            .find(|e| e.cell.contains(text, &cursor))
            .map(|e| e.cell.clone())
    }

    pub fn enter_output(&mut self, ui: &mut Ui<'_>) {
        let Some(cell) = self.selected_cell.clone() else {
            return;
        };
        if ui.options.enter_output_behavior != EnterOutputBehavior::NoOpen {
            self.should_show_floating_win = true;
        }
        let Some(span) = cell.span(&*ui.host) else {
            return;
        };
        if let Some(entry) = self.entry_mut(&cell) {
            self.should_show_floating_win = entry.view.enter(ui, span.end);
        }
    }

    pub fn show_output(&mut self, ui: &mut Ui<'_>) {
        self.should_show_floating_win = true;
        self.update_interface(ui);
    }

    pub fn hide_output(&mut self, ui: &mut Ui<'_>) {
        self.should_show_floating_win = false;
        self.update_interface(ui);
    }

    pub fn clear_interface(&mut self, ui: &mut Ui<'_>) {
        if self.updating_interface {
            return;
        }
        for buffer in &self.buffers {
            ui.host.clear_highlights(*buffer, &self.kernel_id);
        }
    }

    pub fn clear_open_output_windows(&mut self, ui: &mut Ui<'_>) {
        for entry in &mut self.entries {
            entry.view.clear_float(ui);
        }
    }

    pub fn clear_virt_outputs(&mut self, ui: &mut Ui<'_>) {
        for entry in &mut self.entries {
            entry.view.clear_virtual(ui);
        }
    }

    /// Redraw the selection highlight, the selected cell's panel and, when
    /// enabled, every virtual-text output.
    pub fn update_interface(&mut self, ui: &mut Ui<'_>) {
        if self.updating_interface || !self.buffers.contains(&ui.host.current_buffer()) {
            return;
        }
        self.updating_interface = true;

        self.clear_empty_spans(ui);
        let new_selected = self.selected_span(&*ui.host);

        if self.selected_cell != new_selected {
            if let Some(old) = self.selected_cell.take() {
                if let Some(entry) = self.entry_mut(&old) {
                    entry.view.clear_float(ui);
                }
                ui.host.clear_highlights(old.buffer(), &self.kernel_id);
            }
        }
        if new_selected.is_none() {
            self.should_show_floating_win = false;
        }
        self.selected_cell = new_selected.clone();
        if let Some(cell) = new_selected {
            self.show_selected(&cell, ui);
        }

        if ui.options.virt_text_output {
            for entry in &mut self.entries {
                if let Some(span) = entry.cell.span(&*ui.host) {
                    entry.view.show_virtual(ui, span.end);
                }
            }
        }
        ui.canvas.present();

        self.updating_interface = false;
    }

    pub fn on_cursor_moved(&mut self, scrolled: bool, ui: &mut Ui<'_>) {
        let new_selected = self.selected_span(&*ui.host);

        if self.selected_cell.is_none() && new_selected.is_some() && ui.options.auto_open_output {
            self.should_show_floating_win = true;
        }

        if let Some(cell) = new_selected.as_ref().filter(|c| self.selected_cell.as_ref() == Some(*c)) {
            let window = ui.host.window();
            let visible = cell
                .span(&*ui.host)
                .is_some_and(|span| span.end.line < window.top_line + window.height);
            if scrolled && visible && self.should_show_floating_win {
                self.update_interface(ui);
            }
            return;
        }

        self.update_interface(ui);
    }

    fn show_selected(&mut self, cell: &Cell, ui: &mut Ui<'_>) {
        let Some(span) = cell.span(&*ui.host) else {
            return;
        };
        let buffer = span.buffer();
        if buffer != ui.host.current_buffer() {
            return;
        }

        let options = ui.options;
        let group = options.cell_highlight_group.as_str();
        ui.host.clear_highlights(buffer, &self.kernel_id);
        for range in highlight_ranges(&span) {
            ui.host.add_highlight(buffer, &self.kernel_id, range, group);
        }

        let show = self.should_show_floating_win;
        if let Some(entry) = self.entry_mut(cell) {
            if show {
                entry.view.show_floating(ui, span.end);
            } else {
                entry.view.clear_float(ui);
            }
        }
    }
}

/// Highlight ranges covering a cell.
pub fn highlight_ranges(span: &Span) -> Vec<HighlightRange> {
    let (begin, end) = (span.begin, span.end);
    if begin.line == end.line {
        return vec![HighlightRange {
            line: begin.line,
            start_col: begin.column,
            end_col: Some(end.column),
        }];
    }
    let mut ranges = vec![HighlightRange {
        line: begin.line,
        start_col: begin.column,
        end_col: None,
    }];
    for line in begin.line + 1..end.line {
        ranges.push(HighlightRange {
            line,
            start_col: 0,
            end_col: None,
        });
    }
    ranges.push(HighlightRange {
        line: end.line,
        start_col: 0,
        end_col: Some(end.column),
    });
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::headless::HeadlessHost;
    use crate::message::{KernelMessage, KernelStatus};
    use crate::position::{Gravity, Position};
    use crate::surface::NoCanvas;
    use crate::test_support::ScriptedTransport;
    use crate::transport::TransportKind;

    struct Fixture {
        host: HeadlessHost,
        canvas: NoCanvas,
        options: Options,
        buffer: BufferId,
        script: ScriptedTransport,
        coordinator: KernelCoordinator,
    }

    impl Fixture {
        fn new(text: &str) -> Self {
            let mut host = HeadlessHost::new();
            let buffer = host.open_buffer(Some("/tmp/nb.py"), text);
            let script = ScriptedTransport::new(TransportKind::Local);
            script.set_ready(true);
            let runtime = JupyterRuntime::new("python3", "python3", Box::new(script.clone()));
            Self {
                host,
                canvas: NoCanvas,
                options: Options::default(),
                buffer,
                script,
                coordinator: KernelCoordinator::new(runtime, buffer),
            }
        }

        fn cell(&mut self, begin: (usize, usize), end: (usize, usize)) -> Cell {
            let b = self
                .host
                .create_anchor(self.buffer, begin.0, begin.1, Gravity::Left);
            let e = self
                .host
                .create_anchor(self.buffer, end.0, end.1, Gravity::Right);
            Cell::new(b, e, "python3").unwrap()
        }

        fn run(&mut self, begin: (usize, usize), end: (usize, usize)) -> (Cell, bool) {
            let cell = self.cell(begin, end);
            let code = cell.text(&self.host);
            let mut ui = Ui {
                host: &mut self.host,
                canvas: &mut self.canvas,
                options: &self.options,
            };
            let ran = self.coordinator.run_code(&code, cell.clone(), &mut ui);
            (cell, ran)
        }

        fn tick(&mut self) {
            let mut ui = Ui {
                host: &mut self.host,
                canvas: &mut self.canvas,
                options: &self.options,
            };
            self.coordinator.tick(&mut ui);
        }

        fn with_ui<R>(&mut self, f: impl FnOnce(&mut KernelCoordinator, &mut Ui<'_>) -> R) -> R {
            let mut ui = Ui {
                host: &mut self.host,
                canvas: &mut self.canvas,
                options: &self.options,
            };
            f(&mut self.coordinator, &mut ui)
        }

        fn status(&self, cell: &Cell) -> Option<OutputStatus> {
            self.coordinator.output(cell).map(|o| o.status)
        }
    }

    fn finish(script: &ScriptedTransport, count: u32) {
        script.push_iopub(KernelMessage::Status(KernelStatus::Busy));
        script.push_iopub(KernelMessage::ExecuteInput {
            execution_count: count,
        });
        script.push_iopub(KernelMessage::Status(KernelStatus::Idle));
    }

    #[test]
    fn test_outputs_finish_in_submission_order() {
        let mut fx = Fixture::new("a = 1\nb = 2\nc = 3");
        let (c1, _) = fx.run((0, 0), (0, 5));
        let (c2, _) = fx.run((1, 0), (1, 5));
        let (c3, _) = fx.run((2, 0), (2, 5));
        assert_eq!(fx.script.executed(), vec!["a = 1", "b = 2", "c = 3"]);

        for count in 1..=3 {
            finish(&fx.script, count);
        }

        fx.tick();
        assert_eq!(fx.status(&c1), Some(OutputStatus::Done));
        assert_eq!(fx.status(&c2), Some(OutputStatus::Hold));
        assert_eq!(fx.status(&c3), Some(OutputStatus::Hold));

        fx.tick();
        assert_eq!(fx.status(&c2), Some(OutputStatus::Done));
        assert_eq!(fx.status(&c3), Some(OutputStatus::Hold));

        fx.tick();
        assert_eq!(fx.status(&c3), Some(OutputStatus::Done));
        assert_eq!(fx.coordinator.output(&c3).unwrap().execution_count, Some(3));
        assert!(fx.coordinator.is_idle());
        assert!(fx.coordinator.history().get(&c1).is_some());
    }

    #[test]
    fn test_rerun_replaces_overlapping_cell() {
        let mut fx = Fixture::new("x = 1\ny = 2");
        let (first, _) = fx.run((0, 0), (1, 5));
        finish(&fx.script, 1);
        fx.tick();

        let (second, ran) = fx.run((1, 0), (1, 5));
        assert!(ran);
        assert!(fx.coordinator.output(&first).is_none());
        assert!(fx.coordinator.output(&second).is_some());
        assert!(fx.host.anchor_position(&first.begin).is_none());
    }

    #[test]
    fn test_overlapping_running_cell_is_refused() {
        let mut fx = Fixture::new("x = 1\ny = 2");
        let (first, _) = fx.run((0, 0), (1, 5));
        fx.script.push_iopub(KernelMessage::ExecuteInput { execution_count: 1 });
        fx.tick();
        assert_eq!(fx.status(&first), Some(OutputStatus::Running));

        let anchors_before = fx.host.live_anchors();
        let (_, ran) = fx.run((1, 0), (1, 5));
        assert!(!ran);
        assert_eq!(fx.script.executed().len(), 1);
        assert_eq!(fx.host.live_anchors(), anchors_before);
        assert_eq!(fx.status(&first), Some(OutputStatus::Running));
    }

    #[test]
    fn test_rerunning_same_cell_keeps_anchors() {
        let mut fx = Fixture::new("x = 1");
        let (cell, _) = fx.run((0, 0), (0, 5));
        finish(&fx.script, 1);
        fx.tick();

        let code = cell.text(&fx.host);
        let ran = fx.with_ui(|c, ui| c.run_code(&code, cell.clone(), ui));
        assert!(ran);
        assert!(fx.host.anchor_position(&cell.begin).is_some());
        assert_eq!(fx.status(&cell), Some(OutputStatus::Hold));
    }

    #[test]
    fn test_deleted_pending_cell_does_not_steal_messages() {
        let mut fx = Fixture::new("a\nb");
        let (c1, _) = fx.run((0, 0), (0, 1));
        let (c2, _) = fx.run((1, 0), (1, 1));

        fx.host.set_cursor(Position::new(fx.buffer, 0, 0));
        fx.with_ui(|c, ui| c.delete_current_cell(ui));
        assert!(fx.coordinator.output(&c1).is_none());

        finish(&fx.script, 1);
        fx.tick();
        assert_eq!(fx.status(&c2), Some(OutputStatus::Hold));

        finish(&fx.script, 2);
        fx.tick();
        assert_eq!(fx.status(&c2), Some(OutputStatus::Done));
        assert_eq!(fx.coordinator.output(&c2).unwrap().execution_count, Some(2));
    }

    #[test]
    fn test_delete_running_cell_is_refused() {
        let mut fx = Fixture::new("x = 1");
        let (cell, _) = fx.run((0, 0), (0, 5));
        fx.script.push_iopub(KernelMessage::ExecuteInput { execution_count: 1 });
        fx.tick();

        fx.host.set_cursor(Position::new(fx.buffer, 0, 2));
        fx.with_ui(|c, ui| c.delete_current_cell(ui));
        assert!(fx.coordinator.output(&cell).is_some());
        assert!(fx
            .host
            .notifications()
            .iter()
            .any(|(_, m)| m.contains("Cannot delete a running cell")));
    }

    #[test]
    fn test_update_interface_is_idempotent() {
        let mut fx = Fixture::new("x = 1\ny = 2\nz = 3");
        fx.host.set_cursor(Position::new(fx.buffer, 1, 0));
        fx.run((0, 2), (2, 3));
        finish(&fx.script, 1);
        fx.tick();

        fx.with_ui(|c, ui| c.update_interface(ui));
        let highlights = fx.host.highlights(fx.buffer).to_vec();
        let panels: Vec<_> = fx.host.panels().cloned().collect();

        fx.with_ui(|c, ui| c.update_interface(ui));
        assert_eq!(fx.host.highlights(fx.buffer), highlights.as_slice());
        assert_eq!(fx.host.panels().cloned().collect::<Vec<_>>(), panels);
        assert_eq!(highlights.len(), 3);
        assert_eq!(panels.len(), 1);
    }

    #[test]
    fn test_cursor_leaving_cell_closes_panel() {
        let mut fx = Fixture::new("x = 1\n\ny = 2");
        fx.run((0, 0), (0, 5));
        finish(&fx.script, 1);
        fx.tick();
        assert_eq!(fx.host.panels().count(), 1);

        fx.host.set_cursor(Position::new(fx.buffer, 2, 0));
        fx.with_ui(|c, ui| c.on_cursor_moved(false, ui));
        assert_eq!(fx.host.panels().count(), 0);
        assert!(fx.coordinator.selected_cell().is_none());
    }

    #[test]
    fn test_ready_notification() {
        let mut host = HeadlessHost::new();
        let buffer = host.open_buffer(None, "x");
        let script = ScriptedTransport::new(TransportKind::Local);
        let runtime = JupyterRuntime::new("python3", "python3", Box::new(script.clone()));
        let mut coordinator = KernelCoordinator::new(runtime, buffer);
        let mut canvas = NoCanvas;
        let options = Options::default();
        let mut ui = Ui {
            host: &mut host,
            canvas: &mut canvas,
            options: &options,
        };
        coordinator.tick(&mut ui);
        script.set_ready(true);
        coordinator.tick(&mut ui);
        coordinator.tick(&mut ui);
        let ready: Vec<_> = host
            .notifications()
            .iter()
            .filter(|(_, m)| m.ends_with("(id: python3) is ready."))
            .collect();
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn test_restart_finishes_pending_outputs() {
        let mut fx = Fixture::new("a\nb");
        let (c1, _) = fx.run((0, 0), (0, 1));
        let (c2, _) = fx.run((1, 0), (1, 1));
        fx.with_ui(|c, ui| c.restart(false, ui));

        assert_eq!(fx.status(&c1), Some(OutputStatus::Done));
        assert_eq!(fx.status(&c2), Some(OutputStatus::Done));
        assert!(!fx.coordinator.output(&c1).unwrap().success);
        assert!(fx.coordinator.is_idle());
        assert_eq!(fx.script.restarts(), 1);
    }

    #[test]
    fn test_highlight_ranges() {
        let span = Span {
            begin: Position::new(BufferId(1), 1, 2),
            end: Position::new(BufferId(1), 3, 4),
        };
        let ranges = highlight_ranges(&span);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].start_col, 2);
        assert_eq!(ranges[0].end_col, None);
        assert_eq!(ranges[1].line, 2);
        assert_eq!(ranges[2].end_col, Some(4));
    }
}
