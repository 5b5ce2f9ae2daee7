//! kcell CLI entry point.
//!
//! Runs cells of a file against a Jupyter kernel without an editor, using the
//! in-memory host. Useful for scripting and for checking kernel setups.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use log::{info, warn};

use kcell::config::load_options;
use kcell::headless::HeadlessHost;
use kcell::output::clean_up_text;
use kcell::position::TextHost;
use kcell::save::SaveFile;
use kcell::surface::{Level, NoCanvas};
use kcell::transport::{JupyterLauncher, KernelLauncher};
use kcell::Session;

#[derive(Parser, Debug)]
#[command(name = "kcell")]
#[command(about = "Run regions of a file as code cells against Jupyter kernels")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List installed kernelspecs
    Kernels,

    /// Evaluate a file, or line ranges of it, and print the outputs
    Run {
        /// File to evaluate
        file: PathBuf,

        /// Kernelspec name, connection file or Kernel Gateway URL
        #[arg(long)]
        kernel: Option<String>,

        /// 1-based inclusive line range, e.g. 3:7 (repeatable, default: whole file)
        #[arg(long = "range", value_parser = parse_range)]
        ranges: Vec<(usize, usize)>,

        /// Write the outputs to this save file
        #[arg(long)]
        save: Option<PathBuf>,

        /// Copy the outputs into this notebook (overwriting it)
        #[arg(long)]
        export: Option<PathBuf>,

        /// Give up waiting for the kernel after this many seconds
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Summarize a save file
    Inspect {
        /// Save file to read
        file: PathBuf,
    },
}

fn parse_range(raw: &str) -> Result<(usize, usize), String> {
    let (first, last) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected FIRST:LAST, got {raw}"))?;
    let first: usize = first.trim().parse().map_err(|e| format!("{first}: {e}"))?;
    let last: usize = last.trim().parse().map_err(|e| format!("{last}: {e}"))?;
    if first == 0 || last < first {
        return Err(format!("invalid line range {raw}"));
    }
    Ok((first, last))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Commands::Kernels => list_kernels(),
        Commands::Run {
            file,
            kernel,
            ranges,
            save,
            export,
            timeout,
        } => run_file(
            &file,
            kernel.as_deref(),
            &ranges,
            save.as_deref(),
            export.as_deref(),
            Duration::from_secs(timeout),
        ),
        Commands::Inspect { file } => inspect(&file),
    }
}

fn list_kernels() -> anyhow::Result<()> {
    let mut launcher = JupyterLauncher::new()?;
    let specs = launcher.available_kernels();
    if specs.is_empty() {
        println!("No kernelspecs found");
        return Ok(());
    }
    for spec in specs {
        println!("{:<24} {:<12} {}", spec.name, spec.language, spec.display_name);
    }
    Ok(())
}

fn run_file(
    file: &Path,
    kernel: Option<&str>,
    ranges: &[(usize, usize)],
    save: Option<&Path>,
    export: Option<&Path>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let mut host = HeadlessHost::new();
    let buffer = host.open_buffer(Some(&file.to_string_lossy()), &text);
    let lines = host.buffer_lines(buffer);

    let launcher = JupyterLauncher::new()?;
    let options = load_options();
    let tick_rate = Duration::from_millis(options.tick_rate_ms.max(1));
    let mut session = Session::new(host, Box::new(NoCanvas), Box::new(launcher), options);

    let Some(kernel_id) = session.init(kernel, false) else {
        print_notifications(&mut session);
        bail!("Could not start a kernel");
    };
    info!("[kcell] Started kernel {kernel_id}");

    let ranges = if ranges.is_empty() {
        vec![(1, lines.len())]
    } else {
        ranges.to_vec()
    };
    for (first, last) in ranges {
        let last = last.min(lines.len());
        if first > last {
            warn!("[kcell] Skipping range {first}:{last} past the end of the file");
            continue;
        }
        let end_column = lines.get(last - 1).map_or(0, String::len);
        session.evaluate_range(Some(&kernel_id), (first - 1, 0), (last - 1, end_column));
    }

    let started = Instant::now();
    while !session.is_idle() {
        if started.elapsed() > timeout {
            session.shutdown();
            return Err(anyhow!("Timed out after {}s waiting for the kernel", timeout.as_secs()));
        }
        std::thread::sleep(tick_rate);
        session.tick();
        session.tick_input();
    }

    print_outputs(&session, &kernel_id);

    if let Some(path) = save {
        if let Some(written) = session.save(Some(path), Some(&kernel_id)) {
            info!("[kcell] Saved outputs to {}", written.display());
        }
    }
    if let Some(path) = export {
        session.export_ipynb(Some(path), true);
    }

    print_notifications(&mut session);
    session.shutdown();
    Ok(())
}

fn print_outputs(session: &Session<HeadlessHost>, kernel_id: &str) {
    let Some(coordinator) = session.coordinator(kernel_id) else {
        return;
    };
    let now = chrono::Local::now();
    let show_exec_time = session.options().output_show_exec_time;
    for (cell, span) in coordinator.sorted_cells(session.host()) {
        let Some(output) = coordinator.output(&cell) else {
            continue;
        };
        println!(
            "--- lines {}-{} {}",
            span.begin.line + 1,
            span.end.line + 1,
            output.header_text(show_exec_time, now)
        );
        for chunk in &output.chunks {
            let text = clean_up_text(&chunk.raw_text());
            if !text.is_empty() {
                println!("{text}");
            }
        }
    }
}

fn print_notifications(session: &mut Session<HeadlessHost>) {
    for (level, message) in session.host().notifications() {
        match level {
            Level::Error | Level::Warn => eprintln!("{message}"),
            _ => println!("{message}"),
        }
    }
    session.host_mut().clear_notifications();
}

fn inspect(file: &Path) -> anyhow::Result<()> {
    let save = SaveFile::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    println!("Kernel: {}", save.kernel);
    println!("Content checksum: {}", save.content_checksum);
    println!("Cells: {}", save.cells.len());
    for cell in &save.cells {
        let count = cell
            .execution_count
            .map_or_else(|| "_".to_string(), |n| n.to_string());
        println!(
            "  [{count}] {}:{}-{}:{} {} chunk(s){}",
            cell.span.begin.lineno + 1,
            cell.span.begin.colno,
            cell.span.end.lineno + 1,
            cell.span.end.colno,
            cell.chunks.len(),
            if cell.success { "" } else { " (failed)" }
        );
    }
    Ok(())
}
