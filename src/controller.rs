//! Command parsing and the background worker that drives configuration
//! changes and periodic aggregation.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use crate::aggregate::compute_flat_tracepoint_stats;
use crate::config::{MethodConfig, MethodMatcher, TraceConfig, TraceRequest};
use crate::error::{CommandError, HostError};
use crate::host::{HostRuntime, LoadedClass, Severity, ViewHandle};
use crate::manager::CallTreeManager;
use crate::matcher::{ClassPattern, MethodPattern};

/// `option` in the command grammar: `all` measures both call count and
/// wall time, `count` measures only call count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOption {
    Count,
    All,
}

/// A parsed `target`: `classPattern["#" methodPattern ["[" paramList "]"]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub class_pattern: ClassPattern,
    pub method_pattern: Option<MethodPattern>,
    pub traced_params: Vec<usize>,
}

/// A fully parsed command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Clear,
    Reset,
    Trace { option: TraceOption, target: Target },
    Untrace { target: Target },
    Save(PathBuf),
}

/// `classPattern` alone (no `#`) matching literally every class, with no
/// method narrowing, is rejected for `trace`: it would instrument every
/// method of every class in the process. `untrace *` has no such cost --
/// disabling everything is cheap, and is the normal way to express a
/// "stop all tracing" command -- so this check only applies to `trace`.
fn reject_too_broad(target: &Target, original: &str) -> Result<(), CommandError> {
    if target.class_pattern.as_str() == "*" && target.method_pattern.is_none() {
        return Err(CommandError::TooBroad(original.to_string()));
    }
    Ok(())
}

fn parse_param_list(raw: &str) -> Result<Vec<usize>, CommandError> {
    raw.split(',')
        .map(|token| {
            token
                .trim()
                .parse::<usize>()
                .map_err(|_| CommandError::InvalidTarget(raw.to_string()))
        })
        .collect()
}

fn parse_target(raw: &str) -> Result<Target, CommandError> {
    if raw.is_empty() {
        return Err(CommandError::InvalidTarget(raw.to_string()));
    }

    let Some((class_part, rest)) = raw.split_once('#') else {
        return Ok(Target {
            class_pattern: ClassPattern::new(raw),
            method_pattern: None,
            traced_params: Vec::new(),
        });
    };

    if class_part.is_empty() {
        return Err(CommandError::InvalidTarget(raw.to_string()));
    }

    let (method_part, traced_params) = match rest.split_once('[') {
        Some((method_part, bracketed)) => {
            let Some(param_list) = bracketed.strip_suffix(']') else {
                return Err(CommandError::InvalidTarget(raw.to_string()));
            };
            (method_part, parse_param_list(param_list)?)
        }
        None => (rest, Vec::new()),
    };

    if method_part.is_empty() {
        return Err(CommandError::InvalidTarget(raw.to_string()));
    }

    Ok(Target {
        class_pattern: ClassPattern::new(class_part),
        method_pattern: Some(MethodPattern::new(method_part)),
        traced_params,
    })
}

/// Parses one line of input per the command grammar.
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(CommandError::Empty);
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["clear"] => Ok(Command::Clear),
        ["reset"] => Ok(Command::Reset),
        ["save", path] => {
            let path = Path::new(path);
            if !path.is_absolute() {
                return Err(CommandError::RelativeSavePath(path.display().to_string()));
            }
            Ok(Command::Save(path.to_path_buf()))
        }
        ["trace", rest @ ..] => parse_trace_like(rest, true),
        ["untrace", rest @ ..] => parse_trace_like(rest, false),
        _ => Err(CommandError::UnrecognizedCommand(line.to_string())),
    }
}

fn parse_trace_like(rest: &[&str], is_trace: bool) -> Result<Command, CommandError> {
    let (option, target_str) = match rest {
        ["count", target] => (Some(TraceOption::Count), *target),
        ["all", target] => (Some(TraceOption::All), *target),
        [target] => (None, *target),
        _ => {
            return Err(CommandError::InvalidTarget(rest.join(" ")));
        }
    };

    let target = parse_target(target_str)?;
    if is_trace {
        reject_too_broad(&target, target_str)?;
        Ok(Command::Trace {
            option: option.unwrap_or(TraceOption::All),
            target,
        })
    } else {
        Ok(Command::Untrace { target })
    }
}

fn matcher_for(target: &Target) -> MethodMatcher {
    MethodMatcher::new(target.class_pattern.clone(), target.method_pattern.clone())
}

/// Retransforms every loaded class that might be affected by `matcher`,
/// one class at a time so the worker can yield and so a single failure
/// doesn't block the rest. Returns `true` if the host runtime's
/// instrumentation facility reported itself unavailable -- a terminal
/// condition distinct from a per-class retransform failure, which is
/// merely logged and skipped while the rest of the batch proceeds.
fn retransform_matching(
    host: &dyn HostRuntime,
    matcher: &MethodMatcher,
    progress: &dyn crate::host::ProgressHandle,
) -> bool {
    let classes: Vec<LoadedClass> = host
        .all_loaded_classes()
        .into_iter()
        .filter(|class| matcher.might_match_method_in_class(&class.fqcn))
        .collect();

    let total = classes.len().max(1);
    for (done, class) in classes.into_iter().enumerate() {
        if progress.is_canceled() {
            break;
        }
        match host.retransform_classes(std::slice::from_ref(&class)) {
            Ok(()) => {}
            Err(HostError::Unavailable) => return true,
            Err(err) => {
                tracing::error!(class = %class.fqcn, error = %err, "retransform failed, class left instrumented with stale bytecode");
            }
        }
        progress.set_fraction((done + 1) as f64 / total as f64);
    }
    false
}

enum WorkerMessage {
    Command(String),
    Shutdown,
}

/// Serializes configuration changes and periodic aggregation onto a single
/// background worker thread. No async runtime is used: a
/// `std::sync::mpsc` channel plus `recv_timeout` realizes a serial task
/// queue with a scheduled periodic task.
pub struct Controller {
    sender: mpsc::Sender<WorkerMessage>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Controller {
    pub fn new(
        config: Arc<TraceConfig>,
        manager: Arc<CallTreeManager>,
        host: Arc<dyn HostRuntime>,
        view: Arc<dyn ViewHandle>,
        refresh_period: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("tracer-controller".to_string())
            .spawn(move || run_worker(config, manager, host, view, refresh_period, receiver))
            .expect("failed to spawn controller worker thread");

        Controller {
            sender,
            worker: Some(worker),
        }
    }

    pub fn builder(
        config: Arc<TraceConfig>,
        manager: Arc<CallTreeManager>,
        host: Arc<dyn HostRuntime>,
        view: Arc<dyn ViewHandle>,
    ) -> ControllerBuilder {
        ControllerBuilder::new(config, manager, host, view)
    }

    /// Queues a command line for the worker to parse and execute. Never
    /// blocks the caller; syntax and semantic errors surface later via the
    /// view's popup, not as a return value here.
    pub fn submit_command(&self, line: impl Into<String>) {
        let _ = self.sender.send(WorkerMessage::Command(line.into()));
    }
}

/// Configure & build a [`Controller`]. The four collaborators are
/// required up front; only the refresh period has a default.
pub struct ControllerBuilder {
    config: Arc<TraceConfig>,
    manager: Arc<CallTreeManager>,
    host: Arc<dyn HostRuntime>,
    view: Arc<dyn ViewHandle>,
    refresh_period: Duration,
}

impl ControllerBuilder {
    pub fn new(
        config: Arc<TraceConfig>,
        manager: Arc<CallTreeManager>,
        host: Arc<dyn HostRuntime>,
        view: Arc<dyn ViewHandle>,
    ) -> Self {
        ControllerBuilder {
            config,
            manager,
            host,
            view,
            refresh_period: Duration::from_millis(500),
        }
    }

    /// How often the worker refreshes the view when no command is
    /// pending. Defaults to 500ms.
    pub fn refresh_period(mut self, refresh_period: Duration) -> Self {
        self.refresh_period = refresh_period;
        self
    }

    pub fn build(self) -> Controller {
        Controller::new(self.config, self.manager, self.host, self.view, self.refresh_period)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(
    config: Arc<TraceConfig>,
    manager: Arc<CallTreeManager>,
    host: Arc<dyn HostRuntime>,
    view: Arc<dyn ViewHandle>,
    refresh_period: Duration,
    receiver: mpsc::Receiver<WorkerMessage>,
) {
    // Once the host runtime's instrumentation facility reports itself
    // unavailable, tracing is permanently disabled for the rest of the
    // process's lifetime -- every later command that would need
    // transformation becomes a no-op with a one-line warning instead of
    // touching the host again.
    let mut host_unavailable = false;
    loop {
        match receiver.recv_timeout(refresh_period) {
            Ok(WorkerMessage::Command(line)) => {
                handle_command(
                    &line,
                    &config,
                    &manager,
                    host.as_ref(),
                    view.as_ref(),
                    &mut host_unavailable,
                );
            }
            Ok(WorkerMessage::Shutdown) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                refresh(&manager, view.as_ref());
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn refresh(manager: &CallTreeManager, view: &dyn ViewHandle) {
    let tree = Arc::new(manager.snapshot_all_threads_merged());
    let stats = compute_flat_tracepoint_stats(&tree);
    view.refresh_call_tree_data(tree, stats);
}

/// Commands whose handling needs the host runtime at all -- `clear` and
/// `save` never touch it, so they stay available even after the host is
/// declared permanently unavailable.
fn requires_host(command: &Command) -> bool {
    matches!(command, Command::Trace { .. } | Command::Untrace { .. } | Command::Reset)
}

fn warn_host_unavailable(view: &dyn ViewHandle) {
    view.show_command_line_popup(
        "tracing is permanently disabled: host runtime instrumentation facility is unavailable",
        Severity::Warning,
    );
}

fn handle_command(
    line: &str,
    config: &Arc<TraceConfig>,
    manager: &Arc<CallTreeManager>,
    host: &dyn HostRuntime,
    view: &dyn ViewHandle,
    host_unavailable: &mut bool,
) {
    let command = match parse_command(line) {
        Ok(command) => command,
        Err(err) => {
            view.show_command_line_popup(&err.to_string(), Severity::Warning);
            return;
        }
    };

    if *host_unavailable && requires_host(&command) {
        warn_host_unavailable(view);
        return;
    }

    match command {
        Command::Clear => manager.clear_call_trees(),
        Command::Reset => {
            let prior = config.clear_all_requests();
            let progress = view.create_progress_indicator();
            for request in &prior {
                if retransform_matching(host, &request.matcher, progress.as_ref()) {
                    *host_unavailable = true;
                    break;
                }
            }
            manager.clear_call_trees();
            if *host_unavailable {
                warn_host_unavailable(view);
            }
        }
        Command::Trace { option, target } => {
            let method_config = match option {
                TraceOption::Count => MethodConfig::enabled_count_only(target.traced_params.clone()),
                TraceOption::All => MethodConfig::enabled_all(target.traced_params.clone()),
            };
            let matcher = matcher_for(&target);
            config.append_trace_request(TraceRequest::new(matcher.clone(), method_config));
            let progress = view.create_progress_indicator();
            if retransform_matching(host, &matcher, progress.as_ref()) {
                *host_unavailable = true;
                warn_host_unavailable(view);
            }
        }
        Command::Untrace { target } => {
            let matcher = matcher_for(&target);
            config.append_trace_request(TraceRequest::new(matcher.clone(), MethodConfig::disabled()));
            let progress = view.create_progress_indicator();
            if retransform_matching(host, &matcher, progress.as_ref()) {
                *host_unavailable = true;
                warn_host_unavailable(view);
            }
        }
        Command::Save(path) => view.save_snapshot(&path),
    }
}
