use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::NaiveDate;
use indicatif::ProgressBar;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::db::UpsertStore;
use crate::extract::ExtractionPipeline;
use crate::record::{self, sentinel, Record};
use crate::session::{BrowserSession, SessionError};
use crate::tasks::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    Running,
    Finalizing,
    Done,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub concurrency: usize,
    pub navigation_timeout: Duration,
    pub task_delay: Duration,
}

impl RunOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            concurrency: settings.concurrency.max(1),
            navigation_timeout: settings.navigation_timeout(),
            task_delay: settings.task_delay(),
        }
    }
}

/// Outcome of a whole run. `persisted` carries the store result so the
/// caller can keep the records when the final write fails.
pub struct RunReport {
    pub records: Vec<Record>,
    pub invalid: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub not_attempted: usize,
    pub aborted: Option<String>,
    pub persisted: anyhow::Result<usize>,
}

struct TaskOutcome {
    record: Record,
    state: TaskState,
}

/// Set once by the first session-level failure.
#[derive(Default)]
struct AbortSignal(OnceLock<String>);

impl AbortSignal {
    fn trip(&self, reason: String) {
        let _ = self.0.set(reason);
    }

    fn reason(&self) -> Option<&str> {
        self.0.get().map(String::as_str)
    }
}

struct Shared {
    session: Arc<dyn BrowserSession>,
    pipeline: Arc<ExtractionPipeline>,
    options: RunOptions,
    today: NaiveDate,
    abort: AbortSignal,
}

pub struct Orchestrator {
    session: Arc<dyn BrowserSession>,
    pipeline: Arc<ExtractionPipeline>,
    options: RunOptions,
}

impl Orchestrator {
    pub fn new(
        session: Arc<dyn BrowserSession>,
        pipeline: Arc<ExtractionPipeline>,
        options: RunOptions,
    ) -> Self {
        Self {
            session,
            pipeline,
            options,
        }
    }

    /// Scrape every valid task, then write all collected records in one batch.
    /// The write happens even when the session is lost part-way through.
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        today: NaiveDate,
        store: &mut UpsertStore,
        pb: &ProgressBar,
    ) -> RunReport {
        enter(RunPhase::Init);
        let mut invalid = 0usize;
        let mut valid = Vec::with_capacity(tasks.len());
        for (i, task) in tasks.into_iter().enumerate() {
            match task.validate() {
                Ok(()) => valid.push(task),
                Err(e) => {
                    invalid += 1;
                    warn!("--- Skipping row {}: {} ---", i + 1, e);
                }
            }
        }

        enter(RunPhase::Running);
        info!(
            "Processing {} tasks via {} session (date: {})",
            valid.len(),
            self.session.name(),
            today
        );
        let (outcomes, states, aborted) = self.collect(valid, today, pb).await;

        enter(RunPhase::Finalizing);
        let records: Vec<Record> = outcomes.into_iter().flatten().map(|o| o.record).collect();
        let persisted = store.upsert(&records);

        enter(RunPhase::Done);
        let count = |s: TaskState| states.iter().filter(|x| **x == s).count();
        RunReport {
            invalid,
            succeeded: count(TaskState::Succeeded),
            failed: count(TaskState::Failed),
            not_attempted: count(TaskState::Pending),
            aborted,
            persisted,
            records,
        }
    }

    async fn collect(
        &self,
        tasks: Vec<Task>,
        today: NaiveDate,
        pb: &ProgressBar,
    ) -> (Vec<Option<TaskOutcome>>, Vec<TaskState>, Option<String>) {
        let total = tasks.len();
        let mut states = vec![TaskState::Pending; total];
        let mut outcomes: Vec<Option<TaskOutcome>> = (0..total).map(|_| None).collect();
        if total == 0 {
            pb.finish_and_clear();
            return (outcomes, states, None);
        }

        pb.set_length(total as u64);
        let shared = Arc::new(Shared {
            session: Arc::clone(&self.session),
            pipeline: Arc::clone(&self.pipeline),
            options: self.options.clone(),
            today,
            abort: AbortSignal::default(),
        });
        let queue = Arc::new(Mutex::new(
            tasks.into_iter().enumerate().collect::<VecDeque<_>>(),
        ));

        // Workers report (index, Some(outcome)) when done, (index, None) when starting.
        let workers = self.options.concurrency.min(total);
        let (tx, mut rx) = mpsc::channel::<(usize, Option<TaskOutcome>)>(workers * 2);
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let shared = Arc::clone(&shared);
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            handles.push(tokio::spawn(worker(shared, queue, tx)));
        }
        drop(tx);

        let mut done = 0usize;
        while let Some((idx, outcome)) = rx.recv().await {
            match outcome {
                None => states[idx] = TaskState::InProgress,
                Some(outcome) => {
                    done += 1;
                    states[idx] = outcome.state;
                    pb.println(format!(
                        "[{}/{}] {} -> {}",
                        done, total, outcome.record.url, outcome.record.price
                    ));
                    outcomes[idx] = Some(outcome);
                    pb.inc(1);
                }
            }
        }

        for h in handles {
            if let Err(e) = h.await {
                warn!("Worker ended abnormally: {}", e);
            }
        }
        // A worker that died mid-task leaves its slot InProgress with no record.
        for s in states.iter_mut().filter(|s| **s == TaskState::InProgress) {
            *s = TaskState::Failed;
        }

        pb.finish_and_clear();
        let aborted = shared.abort.reason().map(String::from);
        (outcomes, states, aborted)
    }
}

async fn worker(
    shared: Arc<Shared>,
    queue: Arc<Mutex<VecDeque<(usize, Task)>>>,
    tx: mpsc::Sender<(usize, Option<TaskOutcome>)>,
) {
    loop {
        if let Some(reason) = shared.abort.reason() {
            debug!("Worker stopping: {}", reason);
            break;
        }
        let Some((idx, task)) = queue.lock().await.pop_front() else {
            break;
        };

        if tx.send((idx, None)).await.is_err() {
            break;
        }
        let outcome = attempt(&shared, &task).await;
        if tx.send((idx, Some(outcome))).await.is_err() {
            break;
        }

        if !shared.options.task_delay.is_zero() && !queue.lock().await.is_empty() {
            tokio::time::sleep(shared.options.task_delay).await;
        }
    }
}

async fn attempt(shared: &Shared, task: &Task) -> TaskOutcome {
    let timeout = shared.options.navigation_timeout;
    info!("--- Processing {} ---", task.url);

    let navigated = tokio::time::timeout(timeout, shared.session.navigate(&task.url, timeout))
        .await
        .unwrap_or_else(|_| Err(SessionError::Timeout(timeout)));

    match navigated {
        Ok(page) => {
            let price = shared.pipeline.extract(page.as_ref(), task).await;
            let image = shared.pipeline.extract_image(page.as_ref()).await;
            let record = record::build(task, price, shared.today).with_image(image);
            let state = if record.is_failure() {
                TaskState::Failed
            } else {
                TaskState::Succeeded
            };
            TaskOutcome { record, state }
        }
        Err(e) => {
            let price = match e {
                SessionError::Timeout(_) => sentinel::PAGE_TIMEOUT,
                _ => sentinel::PAGE_ERROR,
            };
            warn!("[ERROR] {}: {}", task.url, first_line(&e.to_string()));
            if e.is_session_level() {
                warn!("Session lost, stopping remaining tasks");
                shared.abort.trip(e.to_string());
            }
            TaskOutcome {
                record: record::build(task, price, shared.today),
                state: TaskState::Failed,
            }
        }
    }
}

fn enter(phase: RunPhase) {
    debug!("Run phase: {:?}", phase);
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or_default()
}
