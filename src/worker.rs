use crate::{
    analysis::{self, FullAnalysis},
    cancel::{CancelToken, Outcome},
    context::Workspace,
    correct::{correct, CorrectionResult},
    diagnose::{diagnose, Violation},
    item::TreeFilters,
    store::MetadataStore,
    translations::{find_missing_translations, TranslationMatch},
    tree::{TreeBuilder, TreeNode},
};
use anyhow::{anyhow, Result};
use std::{
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info};

/// Which violations a correction should repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    /// `(dependent folder, provider folder)` pairs.
    Pairs(Vec<(String, String)>),
}

impl Selection {
    fn pick(&self, violations: Vec<Violation>) -> Vec<Violation> {
        match self {
            Selection::All => violations,
            Selection::Pairs(pairs) => violations
                .into_iter()
                .filter(|violation| {
                    pairs
                        .iter()
                        .any(|(dep, provider)| violation.pair() == (dep.as_str(), provider.as_str()))
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Task {
    AnalyzeItem { id: String, filters: TreeFilters },
    FullAnalysis { diagnose: bool },
    Diagnose,
    Correct { selection: Selection },
    FindTranslations { language: String },
    ClearCache,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum TaskResult {
    /// `None` when the requested item is on the ignore list.
    Tree(Option<TreeNode>),
    Analysis(Box<FullAnalysis>),
    Violations(Vec<Violation>),
    Correction {
        result: CorrectionResult,
        selected: Vec<Violation>,
    },
    Translations(Vec<TranslationMatch>),
    CacheCleared,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Progress(String),
    Completed(TaskResult),
    Cancelled,
    Failed(String),
}

/// One background thread running whole operations in submission order.
pub struct Worker {
    tasks: Sender<Task>,
    events: Receiver<WorkerEvent>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(workspace: Workspace, store: MetadataStore) -> Self {
        let (task_tx, task_rx) = mpsc::channel::<Task>();
        let (event_tx, event_rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let handle = thread::spawn(move || {
            for task in task_rx {
                if matches!(task, Task::Shutdown) {
                    debug!("worker shutting down");
                    break;
                }
                token.reset();
                let event = match run_task(&workspace, &store, &token, &event_tx, task) {
                    Ok(Outcome::Completed(result)) => WorkerEvent::Completed(result),
                    Ok(Outcome::Cancelled) => {
                        info!("operation cancelled");
                        WorkerEvent::Cancelled
                    }
                    Err(err) => {
                        error!("operation failed: {err:#}");
                        WorkerEvent::Failed(format!("{err:#}"))
                    }
                };
                if event_tx.send(event).is_err() {
                    break;
                }
            }
        });
        Self {
            tasks: task_tx,
            events: event_rx,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn submit(&self, task: Task) -> Result<()> {
        self.tasks
            .send(task)
            .map_err(|_| anyhow!("worker is no longer running"))
    }

    /// Asks the running operation to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(WorkerEvent::Failed(
                "worker stopped unexpectedly".to_string(),
            )),
        }
    }

    /// Blocks until the submitted operation finishes, passing progress lines to `on_progress`.
    pub fn wait(&self, mut on_progress: impl FnMut(&str)) -> WorkerEvent {
        loop {
            match self.events.recv() {
                Ok(WorkerEvent::Progress(message)) => on_progress(&message),
                Ok(event) => return event,
                Err(_) => return WorkerEvent::Failed("worker stopped unexpectedly".to_string()),
            }
        }
    }

    pub fn shutdown(mut self) {
        self.cancel.cancel();
        let _ = self.tasks.send(Task::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_task(
    workspace: &Workspace,
    store: &MetadataStore,
    cancel: &CancelToken,
    events: &Sender<WorkerEvent>,
    task: Task,
) -> Result<Outcome<TaskResult>> {
    let progress = |message: &str| {
        let _ = events.send(WorkerEvent::Progress(message.to_string()));
    };
    if matches!(task, Task::ClearCache) {
        store.clear()?;
        return Ok(Outcome::Completed(TaskResult::CacheCleared));
    }

    progress("Reading installed mods and rules");
    let (ctx, _) = workspace.context(cancel)?;
    match task {
        Task::AnalyzeItem { id, filters } => {
            progress(&format!("Building dependency tree for {id}"));
            let outcome = TreeBuilder::new(&ctx, store, filters).build(&id)?;
            Ok(outcome.map(TaskResult::Tree))
        }
        Task::FullAnalysis { diagnose } => {
            progress("Building dependency network");
            let outcome = analysis::run_full(&ctx, store, diagnose)?;
            if let Outcome::Completed(result) = &outcome {
                analysis::save(result, &workspace.paths.last_analysis())?;
            }
            Ok(outcome.map(|result| TaskResult::Analysis(Box::new(result))))
        }
        Task::Diagnose => {
            progress("Loading dependency graph");
            let outcome = analysis::load_or_run(&workspace.paths.last_analysis(), &ctx, store)?;
            Ok(outcome.map(|analysis| TaskResult::Violations(diagnose(&ctx, &analysis.graph))))
        }
        Task::Correct { selection } => {
            progress("Loading dependency graph");
            let Outcome::Completed(analysis) =
                analysis::load_or_run(&workspace.paths.last_analysis(), &ctx, store)?
            else {
                return Ok(Outcome::Cancelled);
            };
            let selected = selection.pick(diagnose(&ctx, &analysis.graph));
            progress(&format!("Correcting {} violation(s)", selected.len()));
            Ok(correct(&ctx, &analysis.graph, &selected)
                .map(|result| TaskResult::Correction { result, selected }))
        }
        Task::FindTranslations { language } => {
            progress(&format!("Looking for {language} translations"));
            let outcome = find_missing_translations(&ctx, store, &language)?;
            Ok(outcome.map(TaskResult::Translations))
        }
        Task::ClearCache | Task::Shutdown => Err(anyhow!("unexpected task")),
    }
}
