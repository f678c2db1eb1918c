use std::fs::File;
use std::io::{self, Stdout};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::Parser;
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use super::data_io::{
    ManifestSink, default_manifest_path, detect_data_format, ensure_output_dir, run_log_path,
};
use super::harvest::run_harvest;
use super::tui::draw_loop;
use super::types::{Cli, DataFormat, HarvestEvent, HarvestPlan, ProgressState, RunArgs};
use super::ui_utils::format_bytes;

pub fn handle_harvest_event(
    state: &mut ProgressState,
    sink: Option<&mut ManifestSink>,
    event: HarvestEvent,
) -> io::Result<()> {
    match event {
        HarvestEvent::PageStarted { page, index, total } => {
            state.pages_total = total;
            state.pages_started = state.pages_started.max(index + 1);
            state.current_page = Some(page);
        }
        HarvestEvent::ItemsFound { page, count } => {
            state.items += count;
            state.push_status(format!("page {page}: {count} items"));
        }
        HarvestEvent::Image(record) => {
            if let Some(sink) = sink {
                sink.write_record(&record)?;
            }
            state.push_record(record);
        }
        HarvestEvent::Status(message) => state.push_status(message),
        HarvestEvent::Error(err) => state.push_error(err),
        HarvestEvent::Finished => state.done = true,
    }

    Ok(())
}

pub async fn run() -> io::Result<()> {
    let cli = Cli::parse();
    let plan = HarvestPlan::from_command(&cli.site)?;
    let out_dir = ensure_output_dir(&cli.run.save_dir, plan.run_name())?;
    init_logging(cli.run.no_tui, &cli.run.save_dir, plan.run_name())?;

    let mut sink = match manifest_target(&cli.run, plan.run_name()) {
        Some((path, format)) => {
            info!(manifest = %path.display(), "writing manifest");
            Some((ManifestSink::new(&path, format)?, path))
        }
        None => None,
    };
    let mut state = ProgressState::new(plan.page_count());

    let (tx, mut rx) = mpsc::unbounded_channel::<HarvestEvent>();
    let stop = Arc::new(AtomicBool::new(false));
    let harvest_handle = tokio::spawn(run_harvest(
        cli.run.clone(),
        plan.clone(),
        out_dir.clone(),
        stop.clone(),
        tx,
    ));

    let front_end_result = if cli.run.no_tui {
        Ok(())
    } else {
        run_tui(
            &plan,
            &mut state,
            sink.as_mut().map(|(sink, _)| sink),
            &stop,
            cli.run.auto_close,
            &mut rx,
        )
    };
    if front_end_result.is_err() {
        stop.store(true, Ordering::Relaxed);
    }

    // Whatever the screen did not consume still belongs in the manifest.
    drain_events(&mut state, sink.as_mut().map(|(sink, _)| sink), &mut rx).await?;
    let harvest_result = match harvest_handle.await {
        Ok(result) => result.map_err(io::Error::from),
        Err(e) => {
            error!("harvest task join error: {e}");
            Err(io::Error::other(e))
        }
    };

    let manifest_label = match sink.as_mut() {
        Some((sink, path)) => {
            sink.finalize()?;
            path.display().to_string()
        }
        None => "disabled".to_string(),
    };
    eprintln!(
        "finished harvest: pages={} items={} saved={} failed={} bytes={} dir={} manifest={}",
        state.pages_started,
        state.items,
        state.saved,
        state.failed,
        format_bytes(state.bytes),
        out_dir.display(),
        manifest_label
    );

    harvest_result.and(front_end_result)
}

async fn drain_events(
    state: &mut ProgressState,
    mut sink: Option<&mut ManifestSink>,
    rx: &mut UnboundedReceiver<HarvestEvent>,
) -> io::Result<()> {
    while let Some(event) = rx.recv().await {
        handle_harvest_event(state, sink.as_deref_mut(), event)?;
        if let Some(sink) = sink.as_deref_mut() {
            sink.flush()?;
        }
    }
    Ok(())
}

fn manifest_target(run: &RunArgs, name: &str) -> Option<(PathBuf, DataFormat)> {
    if run.no_manifest {
        return None;
    }
    let configured: DataFormat = run.format.into();
    Some(match &run.manifest {
        Some(path) => (path.clone(), detect_data_format(path, configured)),
        None => (
            default_manifest_path(&run.save_dir, name, configured),
            configured,
        ),
    })
}

/// Headless runs log to stderr; the TUI owns the terminal, so its log goes beside the run directory.
fn init_logging(headless: bool, save_dir: &Path, name: &str) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if headless {
        builder.with_writer(io::stderr).try_init()
    } else {
        let log_file = File::create(run_log_path(save_dir, name))?;
        builder
            .with_ansi(false)
            .with_writer(Mutex::new(log_file))
            .try_init()
    };
    result.map_err(|e| io::Error::other(format!("logging init failed: {e}")))
}

fn run_tui(
    plan: &HarvestPlan,
    state: &mut ProgressState,
    sink: Option<&mut ManifestSink>,
    stop: &AtomicBool,
    auto_close: bool,
    rx: &mut UnboundedReceiver<HarvestEvent>,
) -> io::Result<()> {
    enable_raw_mode()?;
    let mut stdout: Stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;

    let tui_result = draw_loop(&mut terminal, plan, state, sink, stop, auto_close, rx);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    tui_result
}
