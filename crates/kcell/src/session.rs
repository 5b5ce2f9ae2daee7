//! The session: every running kernel, the buffers they are attached to, and
//! the commands an editor invokes.
//!
//! Commands never return errors to the caller. User-input failures become a
//! single notification and leave the session unchanged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde_json::Value;

use crate::cell::{Cell, Span};
use crate::config::Options;
use crate::coordinator::KernelCoordinator;
use crate::error::{SessionError, SessionResult};
use crate::ipynb;
use crate::output::{Output, OutputStatus, OutputType};
use crate::position::{BufferId, Gravity, Position};
use crate::runtime::JupyterRuntime;
use crate::save::{self, SaveFile, SavedCell, SavedPosition, SavedSpan};
use crate::surface::{Canvas, Host, Ui};
use crate::transport::KernelLauncher;

const RUNNING_CELL_WARNING: &str = "Cannot delete a running cell. Wait for it to finish or interrupt the kernel before creating an overlapping cell.";

pub struct Session<H: Host> {
    host: H,
    canvas: Box<dyn Canvas>,
    options: Options,
    /// Kernel ids attached to each buffer, in attach order.
    buffers: BTreeMap<BufferId, Vec<String>>,
    kernels: BTreeMap<String, KernelCoordinator>,
    launcher: Box<dyn KernelLauncher>,
}

impl<H: Host> Session<H> {
    pub fn new(
        host: H,
        canvas: Box<dyn Canvas>,
        launcher: Box<dyn KernelLauncher>,
        options: Options,
    ) -> Self {
        Self {
            host,
            canvas,
            options,
            buffers: BTreeMap::new(),
            kernels: BTreeMap::new(),
            launcher,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn coordinator(&self, kernel_id: &str) -> Option<&KernelCoordinator> {
        self.kernels.get(kernel_id)
    }

    pub fn kernel_ids(&self) -> impl Iterator<Item = &str> {
        self.kernels.keys().map(String::as_str)
    }

    /// Kernels attached to `buffer`.
    pub fn buffer_kernels(&self, buffer: BufferId) -> &[String] {
        self.buffers.get(&buffer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether every execution of every kernel has finished.
    pub fn is_idle(&self) -> bool {
        self.kernels.values().all(KernelCoordinator::is_idle)
    }

    fn ui(&mut self) -> Ui<'_> {
        Ui {
            host: &mut self.host,
            canvas: self.canvas.as_mut(),
            options: &self.options,
        }
    }

    fn parts(&mut self) -> (&mut BTreeMap<String, KernelCoordinator>, Ui<'_>) {
        (
            &mut self.kernels,
            Ui {
                host: &mut self.host,
                canvas: self.canvas.as_mut(),
                options: &self.options,
            },
        )
    }

    fn report<T>(&mut self, result: SessionResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("[session] {e}");
                self.ui().notify_error(&e.to_string());
                None
            }
        }
    }

    /// Run `f` on every kernel attached to the current buffer.
    fn for_current_kernels(&mut self, mut f: impl FnMut(&mut KernelCoordinator, &mut Ui<'_>)) {
        let buffer = self.host.current_buffer();
        let ids = self.buffer_kernels(buffer).to_vec();
        let (kernels, mut ui) = self.parts();
        for id in ids {
            if let Some(kernel) = kernels.get_mut(&id) {
                f(kernel, &mut ui);
            }
        }
    }

    fn require_initialized(&self) -> SessionResult<BufferId> {
        let buffer = self.host.current_buffer();
        if self.buffer_kernels(buffer).is_empty() {
            return Err(SessionError::NotInitialized);
        }
        Ok(buffer)
    }

    /// The kernel a command targets: `kernel` if given, otherwise the only
    /// kernel attached to the current buffer.
    fn resolve_kernel(&self, kernel: Option<&str>) -> SessionResult<String> {
        let buffer = self.require_initialized()?;
        let ids = self.buffer_kernels(buffer);
        match kernel {
            Some(id) if ids.iter().any(|k| k == id) => Ok(id.to_string()),
            Some(id) => Err(SessionError::UnknownKernel(id.to_string())),
            None if ids.len() == 1 => Ok(ids[0].clone()),
            None => Err(SessionError::AmbiguousKernel(ids.to_vec())),
        }
    }

    fn unique_kernel_id(&self, kernel_name: &str) -> String {
        if !self.kernels.contains_key(kernel_name) {
            return kernel_name.to_string();
        }
        (1usize..)
            .map(|n| format!("{kernel_name}_{n}"))
            .find(|id| !self.kernels.contains_key(id))
            .unwrap_or_else(|| kernel_name.to_string())
    }

    fn attach(&mut self, buffer: BufferId, kernel_id: &str) {
        let ids = self.buffers.entry(buffer).or_default();
        if !ids.iter().any(|id| id == kernel_id) {
            ids.push(kernel_id.to_string());
        }
    }

    // ---- Kernel lifecycle ----

    /// Kernel names `init` accepts: installed kernel specs, or with `shared`
    /// the ids of running kernels.
    pub fn available_kernels(&mut self, shared: bool) -> Vec<String> {
        if shared {
            return self.kernels.keys().cloned().collect();
        }
        self.launcher
            .available_kernels()
            .into_iter()
            .map(|spec| spec.name)
            .collect()
    }

    /// Start a kernel for the current buffer, or with `shared` attach a
    /// running one. Returns the kernel id.
    pub fn init(&mut self, kernel: Option<&str>, shared: bool) -> Option<String> {
        let result = self.try_init(kernel, shared);
        self.report(result)
    }

    fn try_init(&mut self, kernel: Option<&str>, shared: bool) -> SessionResult<String> {
        let name = match kernel {
            Some(name) => name.to_string(),
            None => {
                let mut available = self.available_kernels(shared);
                if available.is_empty() {
                    return Err(if shared {
                        SessionError::NoSharedKernels
                    } else {
                        SessionError::NoKernels
                    });
                }
                if available.len() > 1 {
                    return Err(SessionError::KernelChoice(available));
                }
                available.remove(0)
            }
        };
        self.init_kernel(&name, shared)
    }

    fn init_kernel(&mut self, kernel_name: &str, shared: bool) -> SessionResult<String> {
        let buffer = self.host.current_buffer();
        if shared {
            if let Some(coordinator) = self.kernels.get_mut(kernel_name) {
                coordinator.add_buffer(buffer);
                self.attach(buffer, kernel_name);
                info!("[session] Shared kernel {kernel_name} with buffer {buffer}");
                return Ok(kernel_name.to_string());
            }
            self.ui().notify_info(&format!(
                "No running kernel {kernel_name} to share. Continuing with a new kernel."
            ));
        }

        let transport = self
            .launcher
            .launch(kernel_name)
            .map_err(|source| SessionError::Launch {
                name: kernel_name.to_string(),
                source,
            })?;
        let kernel_id = self.unique_kernel_id(kernel_name);
        info!("[session] Started kernel {kernel_name} as {kernel_id} for buffer {buffer}");
        let runtime = JupyterRuntime::new(kernel_name, &kernel_id, transport);
        self.kernels
            .insert(kernel_id.clone(), KernelCoordinator::new(runtime, buffer));
        self.attach(buffer, &kernel_id);
        Ok(kernel_id)
    }

    /// Shut a kernel down and detach it from every buffer.
    fn remove_kernel(&mut self, kernel_id: &str) {
        let (kernels, mut ui) = self.parts();
        if let Some(mut coordinator) = kernels.remove(kernel_id) {
            coordinator.clear_interface(&mut ui);
            coordinator.clear_open_output_windows(&mut ui);
            coordinator.deinit(&mut ui);
            ui.canvas.present();
        }
        for ids in self.buffers.values_mut() {
            ids.retain(|id| id != kernel_id);
        }
        self.buffers.retain(|_, ids| !ids.is_empty());
        info!("[session] Removed kernel {kernel_id}");
    }

    pub fn deinit(&mut self, kernel: Option<&str>) {
        let result = self.resolve_kernel(kernel);
        if let Some(kernel_id) = self.report(result) {
            self.remove_kernel(&kernel_id);
        }
    }

    /// The editor unloaded `buffer`. Kernels left without buffers shut down.
    pub fn on_buffer_unload(&mut self, buffer: BufferId) {
        let Some(ids) = self.buffers.remove(&buffer) else {
            return;
        };
        let mut orphaned = Vec::new();
        {
            let (kernels, mut ui) = self.parts();
            for id in ids {
                if let Some(kernel) = kernels.get_mut(&id) {
                    if kernel.remove_buffer(buffer, &mut ui) {
                        orphaned.push(id);
                    }
                }
            }
        }
        for id in orphaned {
            self.remove_kernel(&id);
        }
    }

    /// Shut every kernel down.
    pub fn shutdown(&mut self) {
        let ids: Vec<String> = self.kernels.keys().cloned().collect();
        for id in ids {
            self.remove_kernel(&id);
        }
        self.canvas.deinit();
    }

    // ---- Evaluation ----

    fn create_cell(
        &mut self,
        buffer: BufferId,
        begin: (usize, usize),
        end: (usize, usize),
        kernel_id: &str,
    ) -> SessionResult<Cell> {
        let lines = self.host.buffer_lines(buffer);
        if begin > end {
            return Err(SessionError::BadSelection(
                "the selection ends before it begins".to_string(),
            ));
        }
        if end.0 >= lines.len().max(1) {
            return Err(SessionError::BadSelection(format!(
                "line {} is past the end of the buffer",
                end.0 + 1
            )));
        }
        let b = self.host.create_anchor(buffer, begin.0, begin.1, Gravity::Left);
        let e = self.host.create_anchor(buffer, end.0, end.1, Gravity::Right);
        match Cell::new(b, e, kernel_id) {
            Ok(cell) => Ok(cell),
            Err(err) => {
                self.host.dispose_anchor(&b);
                self.host.dispose_anchor(&e);
                Err(err.into())
            }
        }
    }

    /// Make room for a cell of `kernel_id` spanning `span` by deleting the
    /// overlapping cells of the other kernels. Nothing is deleted unless every
    /// kernel, `kernel_id` included, can give way.
    fn clear_other_kernels(&mut self, kernel_id: &str, span: &Span) -> bool {
        let buffer = span.buffer();
        let (kernels, mut ui) = self.parts();
        let blocked = kernels
            .values()
            .filter(|k| k.kernel_id() == kernel_id || k.buffers().contains(&buffer))
            .any(|k| !k.can_replace(&*ui.host, span));
        if blocked {
            debug!("[session] Overlap with a running cell");
            ui.notify_warn(RUNNING_CELL_WARNING);
            return false;
        }

        let mut others: Vec<&mut KernelCoordinator> = kernels
            .values_mut()
            .filter(|k| k.kernel_id() != kernel_id && k.buffers().contains(&buffer))
            .collect();
        for kernel in others.iter_mut() {
            for cell in kernel.overlapping(&*ui.host, span) {
                kernel.delete_cell(&cell, true, &mut ui);
            }
        }
        true
    }

    fn try_evaluate(
        &mut self,
        kernel: Option<&str>,
        begin: (usize, usize),
        end: (usize, usize),
        code: Option<&str>,
    ) -> SessionResult<bool> {
        let kernel_id = self.resolve_kernel(kernel)?;
        let buffer = self.host.current_buffer();
        let cell = self.create_cell(buffer, begin, end, &kernel_id)?;
        let Some(span) = cell.span(&self.host) else {
            cell.dispose(&mut self.host);
            return Err(SessionError::BadSelection("the cell has no extent".to_string()));
        };

        if !self.clear_other_kernels(&kernel_id, &span) {
            cell.dispose(&mut self.host);
            return Ok(false);
        }

        let code = match code {
            Some(code) => code.to_string(),
            None => span.text(&self.host.buffer_lines(buffer)),
        };
        let (kernels, mut ui) = self.parts();
        match kernels.get_mut(&kernel_id) {
            Some(coordinator) => Ok(coordinator.run_code(&code, cell, &mut ui)),
            None => {
                cell.dispose(&mut *ui.host);
                Err(SessionError::UnknownKernel(kernel_id))
            }
        }
    }

    /// Run the text between two (line, column) positions, end exclusive.
    /// Returns whether the cell was queued.
    pub fn evaluate_range(
        &mut self,
        kernel: Option<&str>,
        begin: (usize, usize),
        end: (usize, usize),
    ) -> bool {
        let result = self.try_evaluate(kernel, begin, end, None);
        self.report(result).unwrap_or(false)
    }

    /// Run the line under the cursor.
    pub fn evaluate_line(&mut self, kernel: Option<&str>) -> bool {
        let cursor = self.host.cursor();
        let len = self
            .host
            .buffer_lines(cursor.buffer)
            .get(cursor.line)
            .map_or(0, String::len);
        self.evaluate_range(kernel, (cursor.line, 0), (cursor.line, len))
    }

    /// Run `code` that is not part of the buffer. Its cell is zero-width at
    /// the top of the buffer.
    pub fn evaluate_argument(&mut self, kernel: Option<&str>, code: &str) -> bool {
        let result = self.try_evaluate(kernel, (0, 0), (0, 0), Some(code));
        self.report(result).unwrap_or(false)
    }

    pub fn reevaluate_cell(&mut self) {
        let result = self.require_initialized();
        if self.report(result).is_none() {
            return;
        }
        let buffer = self.host.current_buffer();
        let ids = self.buffer_kernels(buffer).to_vec();
        let (kernels, mut ui) = self.parts();
        for id in ids {
            if let Some(kernel) = kernels.get_mut(&id) {
                if kernel.reevaluate_cell(&mut ui) {
                    break;
                }
            }
        }
    }

    pub fn reevaluate_all(&mut self) {
        let result = self.require_initialized();
        if self.report(result).is_some() {
            self.for_current_kernels(|kernel, ui| kernel.reevaluate_all(ui));
        }
    }

    /// Register the lines `start..=end` as a cell without running it.
    pub fn define_cell(&mut self, kernel: Option<&str>, start: usize, end: usize) -> bool {
        let result = self.try_define_cell(kernel, start, end);
        self.report(result).unwrap_or(false)
    }

    fn try_define_cell(&mut self, kernel: Option<&str>, start: usize, end: usize) -> SessionResult<bool> {
        let kernel_id = self.resolve_kernel(kernel)?;
        let buffer = self.host.current_buffer();
        let end_col = self
            .host
            .buffer_lines(buffer)
            .get(end)
            .map_or(0, String::len);
        let cell = self.create_cell(buffer, (start, 0), (end, end_col), &kernel_id)?;
        let Some(span) = cell.span(&self.host) else {
            cell.dispose(&mut self.host);
            return Ok(false);
        };
        if !self.clear_other_kernels(&kernel_id, &span) {
            cell.dispose(&mut self.host);
            return Ok(false);
        }
        let (kernels, mut ui) = self.parts();
        match kernels.get_mut(&kernel_id) {
            Some(coordinator) => Ok(coordinator.define_cell(cell, &mut ui)),
            None => {
                cell.dispose(&mut *ui.host);
                Err(SessionError::UnknownKernel(kernel_id))
            }
        }
    }

    // ---- Kernel control ----

    fn with_kernel(
        &mut self,
        kernel: Option<&str>,
        f: impl FnOnce(&mut KernelCoordinator, &mut Ui<'_>),
    ) {
        let result = self.resolve_kernel(kernel);
        let Some(kernel_id) = self.report(result) else {
            return;
        };
        let (kernels, mut ui) = self.parts();
        if let Some(coordinator) = kernels.get_mut(&kernel_id) {
            f(coordinator, &mut ui);
        }
    }

    pub fn interrupt(&mut self, kernel: Option<&str>) {
        self.with_kernel(kernel, |k, ui| k.interrupt(ui));
    }

    pub fn restart(&mut self, kernel: Option<&str>, delete_outputs: bool) {
        self.with_kernel(kernel, |k, ui| k.restart(delete_outputs, ui));
    }

    pub fn send_input(&mut self, kernel_id: &str, value: &str) {
        if !self.kernels.contains_key(kernel_id) {
            let err = SessionError::UnknownKernel(kernel_id.to_string());
            self.report::<()>(Err(err));
            return;
        }
        let (kernels, mut ui) = self.parts();
        if let Some(kernel) = kernels.get_mut(kernel_id) {
            kernel.send_input(value, &mut ui);
        }
    }

    // ---- Cells and outputs ----

    pub fn delete_cell(&mut self) {
        let result = self.require_initialized();
        if self.report(result).is_some() {
            self.for_current_kernels(|kernel, ui| kernel.delete_current_cell(ui));
        }
    }

    pub fn show_output(&mut self) {
        let result = self.require_initialized();
        if self.report(result).is_some() {
            self.for_current_kernels(|kernel, ui| kernel.show_output(ui));
        }
    }

    pub fn hide_output(&mut self) {
        self.for_current_kernels(|kernel, ui| kernel.hide_output(ui));
    }

    pub fn enter_output(&mut self) {
        let result = self.require_initialized();
        if self.report(result).is_some() {
            self.for_current_kernels(|kernel, ui| kernel.enter_output(ui));
        }
    }

    /// Begin positions of every cell in the current buffer, in order.
    fn cell_starts(&self) -> Vec<Position> {
        let buffer = self.host.current_buffer();
        let mut starts: Vec<Position> = self
            .buffer_kernels(buffer)
            .iter()
            .filter_map(|id| self.kernels.get(id))
            .flat_map(|kernel| kernel.sorted_cells(&self.host))
            .filter(|(_, span)| span.buffer() == buffer)
            .map(|(_, span)| span.begin)
            .collect();
        starts.sort_by_key(|p| (p.line, p.column));
        starts.dedup();
        starts
    }

    fn move_cursor_to(&mut self, position: Position) {
        self.host.set_cursor(position);
        self.on_cursor_moved(false);
    }

    /// Move to the start of the `count`th cell after the cursor, wrapping.
    pub fn next_cell(&mut self, count: usize) {
        let starts = self.cell_starts();
        if starts.is_empty() {
            return;
        }
        let cursor = self.host.cursor();
        let first = starts
            .iter()
            .position(|p| (p.line, p.column) > (cursor.line, cursor.column))
            .unwrap_or(0);
        let target = (first + count.max(1) - 1) % starts.len();
        self.move_cursor_to(starts[target]);
    }

    /// Move to the start of the `count`th cell before the cursor, wrapping.
    pub fn prev_cell(&mut self, count: usize) {
        let starts = self.cell_starts();
        if starts.is_empty() {
            return;
        }
        let cursor = self.host.cursor();
        let len = starts.len();
        let last = starts
            .iter()
            .rposition(|p| (p.line, p.column) < (cursor.line, cursor.column))
            .unwrap_or(len - 1);
        let back = (count.max(1) - 1) % len;
        let target = (last + len - back) % len;
        self.move_cursor_to(starts[target]);
    }

    /// Move to the start of the `n`th cell (one-based), wrapping.
    pub fn goto_cell(&mut self, n: usize) {
        let starts = self.cell_starts();
        if starts.is_empty() {
            return;
        }
        let target = n.saturating_sub(1) % starts.len();
        self.move_cursor_to(starts[target]);
    }

    // ---- Persistence ----

    /// Save the current buffer's cells of one kernel.
    pub fn save(&mut self, path: Option<&Path>, kernel: Option<&str>) -> Option<PathBuf> {
        let result = self.try_save(path, kernel);
        self.report(result)
    }

    fn try_save(&mut self, path: Option<&Path>, kernel: Option<&str>) -> SessionResult<PathBuf> {
        let kernel_id = self.resolve_kernel(kernel)?;
        let buffer = self.host.current_buffer();
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => save::default_save_file(&self.options, self.host.buffer_name(buffer).as_deref())?,
        };
        let coordinator = self
            .kernels
            .get(&kernel_id)
            .ok_or_else(|| SessionError::UnknownKernel(kernel_id.clone()))?;

        let cells = coordinator
            .sorted_cells(&self.host)
            .into_iter()
            .filter(|(_, span)| span.buffer() == buffer)
            .filter_map(|(cell, span)| {
                let output = coordinator.output(&cell)?;
                let span = SavedSpan {
                    begin: SavedPosition {
                        lineno: span.begin.line,
                        colno: span.begin.column,
                    },
                    end: SavedPosition {
                        lineno: span.end.line,
                        colno: span.end.column,
                    },
                };
                Some(SavedCell::from_output(span, output))
            })
            .collect();
        let checksum = save::content_checksum(&self.host.buffer_lines(buffer));
        SaveFile::new(coordinator.kernel_name(), checksum, cells).write(&path)?;
        info!("[session] Saved {kernel_id} to {}", path.display());
        Ok(path)
    }

    /// Start the kernel named in a save file and restore its cells onto the
    /// current buffer.
    pub fn load(&mut self, path: Option<&Path>, shared: bool) -> Option<String> {
        let result = self.try_load(path, shared);
        self.report(result)
    }

    fn try_load(&mut self, path: Option<&Path>, shared: bool) -> SessionResult<String> {
        let buffer = self.host.current_buffer();
        if !self.buffer_kernels(buffer).is_empty() {
            return Err(SessionError::AlreadyInitialized);
        }
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => save::default_save_file(&self.options, self.host.buffer_name(buffer).as_deref())?,
        };
        let file = SaveFile::read(&path)?;
        file.verify_checksum(&self.host.buffer_lines(buffer))?;

        let existing = shared && self.kernels.contains_key(&file.kernel);
        let kernel_id = self.init_kernel(&file.kernel, shared)?;
        if let Err(e) = self.restore_saved_cells(&kernel_id, buffer, &file) {
            if existing {
                self.detach(buffer, &kernel_id);
            } else {
                self.remove_kernel(&kernel_id);
            }
            return Err(e);
        }
        info!("[session] Loaded {} cell(s) from {}", file.cells.len(), path.display());
        self.update_interface();
        Ok(kernel_id)
    }

    fn detach(&mut self, buffer: BufferId, kernel_id: &str) {
        let (kernels, mut ui) = self.parts();
        if let Some(kernel) = kernels.get_mut(kernel_id) {
            kernel.remove_buffer(buffer, &mut ui);
        }
        if let Some(ids) = self.buffers.get_mut(&buffer) {
            ids.retain(|id| id != kernel_id);
        }
        self.buffers.retain(|_, ids| !ids.is_empty());
    }

    fn restore_saved_cells(
        &mut self,
        kernel_id: &str,
        buffer: BufferId,
        file: &SaveFile,
    ) -> SessionResult<()> {
        for saved in &file.cells {
            let (begin, end) = (saved.span.begin, saved.span.end);
            let b = self
                .host
                .create_anchor(buffer, begin.lineno, begin.colno, Gravity::Left);
            let e = self
                .host
                .create_anchor(buffer, end.lineno, end.colno, Gravity::Right);
            let cell = Cell::new(b, e, kernel_id)?;
            let code = cell.text(&self.host);

            let mut output = Output::new(saved.execution_count);
            output.success = saved.success;
            output.old = true;
            output.status = OutputStatus::Done;

            let options = &self.options;
            let coordinator = self
                .kernels
                .get_mut(kernel_id)
                .ok_or_else(|| SessionError::UnknownKernel(kernel_id.to_string()))?;
            for chunk in &saved.chunks {
                output.chunks.push(coordinator.runtime_mut().restore_chunk(
                    chunk.data.clone(),
                    chunk.metadata.clone(),
                    OutputType::DisplayData,
                    options,
                ));
            }
            coordinator.restore(cell, output, code);
        }
        Ok(())
    }

    /// Write the current buffer's outputs into the notebook at `path`
    /// (default: the buffer's file with an `.ipynb` extension).
    pub fn export_ipynb(&mut self, path: Option<&Path>, overwrite: bool) -> Option<PathBuf> {
        let result = self.try_export_ipynb(path, overwrite);
        self.report(result).flatten()
    }

    fn try_export_ipynb(&mut self, path: Option<&Path>, overwrite: bool) -> SessionResult<Option<PathBuf>> {
        let kernel_id = self.resolve_kernel(None)?;
        let buffer = self.host.current_buffer();
        let mut path = match path {
            Some(path) => path.to_path_buf(),
            None => ipynb::default_notebook_path(self.host.buffer_name(buffer).as_deref())?,
        };
        if path.extension().is_none_or(|ext| ext != "ipynb") {
            let mut name = path.into_os_string();
            name.push(".ipynb");
            path = PathBuf::from(name);
        }
        if !path.exists() {
            self.ui().notify_warn(&format!(
                "Cannot export to file: {} because it does not exist.",
                path.display()
            ));
            return Ok(None);
        }

        let mut notebook = ipynb::read_notebook(&path)?;
        let coordinator = self
            .kernels
            .get(&kernel_id)
            .ok_or_else(|| SessionError::UnknownKernel(kernel_id.clone()))?;
        let language = coordinator
            .runtime()
            .language()
            .unwrap_or_else(|| "python".to_string());
        let sorted = coordinator.sorted_cells(&self.host);
        let cells: Vec<ipynb::ExportCell<'_>> = sorted
            .iter()
            .filter(|(_, span)| span.buffer() == buffer)
            .filter_map(|(cell, span)| {
                Some(ipynb::ExportCell {
                    line: span.begin.line,
                    code: cell.text(&self.host),
                    output: coordinator.output(cell)?,
                })
            })
            .collect();
        ipynb::export_outputs(&mut notebook, &cells, &language, &path)?;
        let count = cells.len();

        let target = ipynb::export_target(&path, overwrite);
        self.ui().notify_info(&format!(
            "Exporting {count} cell output(s) to {}",
            target.display()
        ));
        ipynb::write_notebook(notebook, &target)?;
        Ok(Some(target))
    }

    /// Restore outputs from the notebook at `path` onto matching regions of
    /// the current buffer. Returns the number of cells imported.
    pub fn import_ipynb(&mut self, path: Option<&Path>) -> usize {
        let result = self.try_import_ipynb(path);
        self.report(result).unwrap_or(0)
    }

    fn try_import_ipynb(&mut self, path: Option<&Path>) -> SessionResult<usize> {
        let kernel_id = self.resolve_kernel(None)?;
        let buffer = self.host.current_buffer();
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => ipynb::default_notebook_path(self.host.buffer_name(buffer).as_deref())?,
        };
        let notebook = ipynb::read_notebook(&path)?;
        let language = self
            .kernels
            .get(&kernel_id)
            .and_then(|k| k.runtime().language())
            .unwrap_or_else(|| "python".to_string());

        let lines = self.host.buffer_lines(buffer);
        let mut from = 0;
        let mut imported = 0;
        let mut failed = 0;
        for nb_cell in ipynb::cells_with_outputs(&notebook) {
            let Some((first, last)) = ipynb::find_source(&lines, from, &nb_cell.source, &language)
            else {
                failed += 1;
                continue;
            };
            from = last + 1;

            let end_col = lines.get(last).map_or(0, String::len);
            let cell = self.create_cell(buffer, (first, 0), (last, end_col), &kernel_id)?;
            let Some(span) = cell.span(&self.host) else {
                cell.dispose(&mut self.host);
                failed += 1;
                continue;
            };
            let replaceable = self
                .kernels
                .get(&kernel_id)
                .is_some_and(|k| k.can_replace(&self.host, &span));
            if !replaceable || !self.clear_other_kernels(&kernel_id, &span) {
                cell.dispose(&mut self.host);
                failed += 1;
                continue;
            }

            let code = cell.text(&self.host);
            let (kernels, mut ui) = self.parts();
            let Some(coordinator) = kernels.get_mut(&kernel_id) else {
                cell.dispose(&mut *ui.host);
                return Err(SessionError::UnknownKernel(kernel_id));
            };
            for old in coordinator.overlapping(&*ui.host, &span) {
                coordinator.delete_cell(&old, true, &mut ui);
            }
            let options = ui.options;
            let runtime = coordinator.runtime_mut();
            let output = ipynb::output_from_notebook(&nb_cell, |data, metadata, output_type| {
                runtime.restore_chunk(data, metadata, output_type, options)
            });
            coordinator.restore(cell, output, code);
            imported += 1;
        }

        if failed > 0 {
            self.ui().notify_warn(&format!(
                "Failed to import {failed} cell(s) from {}",
                path.display()
            ));
        }
        self.ui().notify_info(&format!(
            "Imported {imported} cell output(s) from {}",
            path.display()
        ));
        self.update_interface();
        Ok(imported)
    }

    // ---- Timers and editor events ----

    /// Feed pending kernel messages into outputs. Safe to call at any time.
    pub fn tick(&mut self) {
        let (kernels, mut ui) = self.parts();
        for kernel in kernels.values_mut() {
            kernel.tick(&mut ui);
        }
    }

    /// Forward pending stdin requests to the host prompt.
    pub fn tick_input(&mut self) {
        let (kernels, mut ui) = self.parts();
        for kernel in kernels.values_mut() {
            kernel.tick_input(&mut ui);
        }
    }

    pub fn on_cursor_moved(&mut self, scrolled: bool) {
        self.for_current_kernels(|kernel, ui| kernel.on_cursor_moved(scrolled, ui));
    }

    pub fn update_interface(&mut self) {
        self.for_current_kernels(|kernel, ui| kernel.update_interface(ui));
    }

    pub fn clear_interface(&mut self) {
        let (kernels, mut ui) = self.parts();
        for kernel in kernels.values_mut() {
            kernel.clear_interface(&mut ui);
            kernel.clear_open_output_windows(&mut ui);
        }
        ui.canvas.present();
    }

    // ---- Options and info ----

    pub fn update_option(&mut self, name: &str, value: Value) {
        let result = self.options.update(name, value);
        if self.report(result).is_none() {
            return;
        }
        debug!("[session] Option {name} updated");
        if name == "virt_text_output" && !self.options.virt_text_output {
            let (kernels, mut ui) = self.parts();
            for kernel in kernels.values_mut() {
                kernel.clear_virt_outputs(&mut ui);
            }
        }
        self.update_interface();
    }

    /// Lines describing the running kernels and the installed kernel specs.
    pub fn info(&mut self) -> Vec<String> {
        let specs = self.launcher.available_kernels();
        let buffer = self.host.current_buffer();
        let attached = self.buffer_kernels(buffer).to_vec();
        let others: Vec<&String> = self
            .kernels
            .keys()
            .filter(|id| !attached.contains(id))
            .collect();
        let inactive: Vec<_> = specs
            .iter()
            .filter(|spec| {
                !self
                    .kernels
                    .values()
                    .any(|k| k.kernel_name() == spec.name)
            })
            .collect();

        let mut lines = vec![
            "kcell info".to_string(),
            format!("Initialized: {}", !self.kernels.is_empty()),
            String::new(),
        ];
        let describe_running = |lines: &mut Vec<String>, id: &str| {
            let Some(kernel) = self.kernels.get(id) else {
                return;
            };
            let buffers: Vec<String> = kernel.buffers().iter().map(|b| b.to_string()).collect();
            lines.push(format!(
                "Kernel: {id} (running, buffers: [{}])",
                buffers.join(", ")
            ));
            if let Some(spec) = specs.iter().find(|s| s.name == kernel.kernel_name()) {
                lines.push(format!("  language:     {}", spec.language));
                lines.push(format!("  cmd:          {}", spec.argv.join(" ")));
                lines.push(format!("  resource_dir: {}", spec.resource_dir.display()));
            }
            lines.push(String::new());
        };

        if !attached.is_empty() {
            lines.push(format!(
                "{} active kernel(s), attached to current buffer:",
                attached.len()
            ));
            for id in &attached {
                describe_running(&mut lines, id);
            }
        }
        if !others.is_empty() {
            lines.push(format!(
                "{} active kernel(s), not attached to this buffer:",
                others.len()
            ));
            for id in &others {
                describe_running(&mut lines, id);
            }
        }
        if !inactive.is_empty() {
            lines.push(format!("{} inactive kernel(s):", inactive.len()));
            for spec in inactive {
                lines.push(format!("Kernel: {}", spec.name));
                lines.push(format!("  language:     {}", spec.language));
                lines.push(format!("  cmd:          {}", spec.argv.join(" ")));
                lines.push(format!("  resource_dir: {}", spec.resource_dir.display()));
                lines.push(String::new());
            }
        }
        lines
    }

    /// Every run of the cell under the cursor.
    pub fn cell_history(&mut self) -> Option<Vec<String>> {
        let buffer = self.host.current_buffer();
        let cursor = self.host.cursor();
        let show_time = self.options.output_show_exec_time;
        for id in self.buffer_kernels(buffer) {
            let Some(kernel) = self.kernels.get(id) else {
                continue;
            };
            let cell = kernel
                .sorted_cells(&self.host)
                .into_iter()
                .rev()
                .find(|(_, span)| span.contains(&cursor))
                .map(|(cell, _)| cell);
            if let Some(cell) = cell {
                let language = kernel
                    .runtime()
                    .language()
                    .unwrap_or_else(|| "text".to_string());
                if let Some(lines) = kernel.history().render(&cell, &language, show_time) {
                    return Some(lines);
                }
            }
        }
        self.ui().notify_info("No history for the cell under the cursor.");
        None
    }
}
