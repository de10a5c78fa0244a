pub mod blocks;
pub mod bridge;
pub mod bus;
pub mod cli;
pub mod compiler;
pub mod defaults;
pub mod error;
pub mod interpreter;
pub mod ir;
pub mod options;
pub mod primitives;
pub mod project;
pub mod scheduler;
pub mod stage;
pub mod timeline;
pub mod value;
pub mod world;

use anyhow::{Context, Result};
use bridge::{HostCommand, HostEvent, RuntimeHandle};
use bus::MessageRecord;
use compiler::CompileReport;
use ir::Program;
use options::RuntimeOptions;
use project::ProjectDoc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use timeline::{TimelineAction, TimelineEvent};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

/// How long the host keeps reading events after its final `Stop`.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub fn run_cli(args: &cli::Args) -> Result<()> {
    init_tracing(&args.log_level);
    let run_for = run_duration(args.run_for)?;

    let total_stages = 3 + usize::from(args.emit_ir.is_some()) + usize::from(!args.check);
    let progress = CliProgress::new("Run", total_stages);
    let mut stage = 0usize;

    stage += 1;
    progress.emit(stage, "Resolving input path");
    let input = canonicalize_file(&args.input)?;

    stage += 1;
    progress.emit(stage, "Loading project");
    let project = project::load_project(&input)?;

    stage += 1;
    progress.emit(stage, "Compiling scripts");
    let (program, report) = compiler::compile_with_report(&project);
    print_warnings(&report);

    if let Some(emit_path) = &args.emit_ir {
        stage += 1;
        progress.emit(stage, "Writing IR");
        let json = serde_json::to_string_pretty(&program)?;
        std::fs::write(emit_path, json)
            .with_context(|| format!("Failed to write IR to '{}'.", emit_path.display()))?;
    }

    if args.check {
        return Ok(());
    }

    stage += 1;
    progress.emit(stage, "Running");
    let timeline = match &args.timeline {
        Some(path) => timeline::load_timeline(path, &project)?,
        None => Vec::new(),
    };
    let mut options = RuntimeOptions::default();
    if let Some(seed) = args.seed {
        options = options.with_seed(seed);
    }
    if let Some(capacity) = args.history_cap {
        options = options.with_history_capacity(capacity);
    }
    let history = run_headless(
        &project,
        program,
        timeline,
        options,
        run_for,
    )?;
    print_history(&history);
    Ok(())
}

fn run_duration(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        anyhow::bail!("--run-for must be a non-negative number of seconds.");
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow::anyhow!("--run-for {} is too large.", secs))
}

/// Loads and compiles a project file without running it.
pub fn compile_file(input: &Path) -> Result<(ProjectDoc, Program, CompileReport)> {
    let input = canonicalize_file(input)?;
    let project = project::load_project(&input)?;
    let (program, report) = compiler::compile_with_report(&project);
    Ok((project, program, report))
}

/// Runs `program` on a runtime thread for `run_for`, replaying `timeline`
/// and printing every host event to stdout as a JSON line. Returns the
/// broadcast history.
pub fn run_headless(
    project: &ProjectDoc,
    program: Program,
    timeline: Vec<TimelineEvent>,
    options: RuntimeOptions,
    run_for: Duration,
) -> Result<Vec<MessageRecord>> {
    let host = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build host runtime.")?;
    let (handle, events) = RuntimeHandle::spawn(options)?;
    handle.send(HostCommand::LoadProgram {
        entities: world::entity_specs(project),
        program,
    })?;
    handle.send(HostCommand::Start)?;
    host.block_on(drive_host(&handle, events, timeline, run_for))?;
    Ok(handle.shutdown()?)
}

async fn drive_host(
    handle: &RuntimeHandle,
    mut events: UnboundedReceiver<HostEvent>,
    timeline: Vec<TimelineEvent>,
    run_for: Duration,
) -> Result<()> {
    let start = tokio::time::Instant::now();
    let deadline = start.checked_add(run_for).unwrap_or_else(|| far_future(start));
    let mut pending = timeline.into_iter().peekable();
    let mut mouse = (0.0, 0.0);

    loop {
        let wake = match pending.peek().and_then(|event| start.checked_add(event.at)) {
            Some(at) if at < deadline => at,
            _ => deadline,
        };
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { return Ok(()) };
                answer_event(handle, &event, mouse)?;
                print_event(&event)?;
            }
            _ = tokio::time::sleep_until(wake) => {
                if wake >= deadline {
                    break;
                }
                if let Some(event) = pending.next() {
                    tracing::debug!("timeline line {}: {:?}", event.line, event.action);
                    match event.action {
                        TimelineAction::KeyDown(key) => handle.send(HostCommand::KeyDown { key })?,
                        TimelineAction::KeyUp(key) => handle.send(HostCommand::KeyUp { key })?,
                        TimelineAction::Click(entity) => {
                            handle.send(HostCommand::ClickEntity { entity })?
                        }
                        TimelineAction::Mouse { x, y } => mouse = (x, y),
                        TimelineAction::Stop => handle.send(HostCommand::Stop)?,
                    }
                }
            }
        }
    }

    handle.send(HostCommand::Stop)?;
    loop {
        match tokio::time::timeout(DRAIN_TIMEOUT, events.recv()).await {
            Ok(Some(event)) => {
                answer_event(handle, &event, mouse)?;
                print_event(&event)?;
                if event == HostEvent::ExecutionStopped {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => {
                tracing::warn!("runtime did not confirm stop within {:?}", DRAIN_TIMEOUT);
                break;
            }
        }
    }
    Ok(())
}

/// A deadline the host will never reach, for run lengths past `Instant`'s range.
fn far_future(start: tokio::time::Instant) -> tokio::time::Instant {
    start + Duration::from_secs(86400 * 365 * 30)
}

fn answer_event(handle: &RuntimeHandle, event: &HostEvent, mouse: (f64, f64)) -> Result<()> {
    if let HostEvent::MousePositionRequest { .. } = event {
        handle.send(HostCommand::MousePositionResponse {
            x: mouse.0,
            y: mouse.1,
        })?;
    }
    Ok(())
}

fn print_event(event: &HostEvent) -> Result<()> {
    let line = serde_json::to_string(event)?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", line)?;
    Ok(())
}

fn print_warnings(report: &CompileReport) {
    for warning in &report.warnings {
        eprintln!("warning: {}", warning);
    }
}

fn print_history(history: &[MessageRecord]) {
    eprintln!("[Run] {} broadcast(s) recorded.", history.len());
    for record in history {
        eprintln!(
            "  {:>7} ms  '{}' from {} -> {} listener(s)",
            record.timestamp_ms,
            record.name,
            record.sender,
            record.received_by.len()
        );
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn canonicalize_file(path: &Path) -> Result<PathBuf> {
    if !path.exists() || !path.is_file() {
        return Err(anyhow::anyhow!("Input file not found: '{}'.", path.display()));
    }
    Ok(path.canonicalize()?)
}

struct CliProgress {
    prefix: &'static str,
    total: usize,
}

impl CliProgress {
    fn new(prefix: &'static str, total: usize) -> Self {
        Self {
            prefix,
            total: total.max(1),
        }
    }

    fn emit(&self, step: usize, label: &str) {
        let step = step.clamp(1, self.total);
        let bar = render_progress_bar(step, self.total, 14);
        eprintln!(
            "[{}] {}... ({}/{}) {}",
            self.prefix, label, step, self.total, bar
        );
    }
}

fn render_progress_bar(step: usize, total: usize, width: usize) -> String {
    let width = width.max(1);
    let filled = ((step * width) + (total / 2)) / total;
    let mut s = String::with_capacity(width + 2);
    s.push('[');
    for i in 0..width {
        s.push(if i < filled { '=' } else { '-' });
    }
    s.push(']');
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_bar_rounds_to_width() {
        assert_eq!(render_progress_bar(1, 2, 4), "[==--]");
        assert_eq!(render_progress_bar(3, 3, 4), "[====]");
    }

    #[test]
    fn run_lengths_are_validated() {
        assert_eq!(run_duration(1.5).unwrap(), Duration::from_millis(1500));
        assert!(run_duration(-1.0).is_err());
        assert!(run_duration(f64::NAN).is_err());
        let err = run_duration(1e300).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn far_future_is_reachable_from_now() {
        let now = tokio::time::Instant::now();
        assert!(far_future(now) > now);
        assert!(now.checked_add(Duration::MAX).is_none());
    }

    #[test]
    fn missing_input_is_reported() {
        let err = canonicalize_file(Path::new("/definitely/not/here.sb3")).unwrap_err();
        assert!(err.to_string().contains("Input file not found"));
    }
}
