use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Adding task {task} would create a dependency cycle through {cycle_with}")]
    CycleDetected { task: TaskId, cycle_with: TaskId },

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid transition for task {task}: {event} from {from} ({reason})")]
    InvalidTransition {
        task: TaskId,
        from: String,
        event: String,
        reason: String,
    },

    #[error("No eligible worker for task {task} (attempt {attempts}, {rejected} candidates rejected)")]
    NoEligibleWorker {
        task: TaskId,
        attempts: u32,
        rejected: usize,
    },

    #[error("Transient worker failure on task {task}: {detail}")]
    TransientWorkerFailure { task: TaskId, detail: String },

    #[error("Persistent worker failure on task {task}: {detail}")]
    PersistentWorkerFailure { task: TaskId, detail: String },

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("Ledger sequence gap: expected {expected}, found {found}")]
    LedgerGap { expected: u64, found: u64 },

    #[error("Replay mismatch at sequence {seq}: {detail}")]
    ReplayMismatch { seq: u64, detail: String },

    #[error("Invalid fraction: {0}")]
    InvalidFraction(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
