use uuid::Uuid;

/// Failures of an orchestration step that abort it before or instead of any
/// state mutation. Backend failures never show up here: they are converted
/// into an `erred` transition plus a failure event by the step itself.
#[derive(thiserror::Error, Debug)]
pub enum OrchestrationError {
    #[error("{kind} {uuid} does not exist")]
    NotFound { kind: &'static str, uuid: Uuid },

    #[error("{kind} {uuid} has no backup source")]
    IntegrityFault { kind: &'static str, uuid: Uuid },

    #[error("no backup strategy registered for source type '{0}'")]
    UnsupportedSource(String),

    #[error("cannot {transition} {kind} {uuid} from state '{current}'")]
    IllegalTransition {
        kind: &'static str,
        uuid: Uuid,
        transition: &'static str,
        current: String,
        /// The entity already sits at or past the transition's target state,
        /// which is what a redelivered unit of work looks like.
        duplicate: bool,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OrchestrationError {
    pub fn not_found(kind: &'static str, uuid: Uuid) -> Self {
        Self::NotFound { kind, uuid }
    }

    /// Logs the error with the severity its kind calls for.
    pub fn log(&self, task: &str) {
        match self {
            Self::NotFound { .. } => {
                tracing::error!(task, error = %self, "Task was called for a missing entity");
            }
            Self::IntegrityFault { .. } | Self::UnsupportedSource(_) => {
                tracing::error!(task, error = %self, "Task aborted: data integrity fault");
            }
            Self::IllegalTransition { duplicate: true, .. } => {
                tracing::info!(task, error = %self, "Task skipped: already applied (duplicate delivery)");
            }
            Self::IllegalTransition { duplicate: false, .. } => {
                tracing::error!(task, error = %self, "Task aborted: state changed concurrently");
            }
            Self::Internal(e) => {
                tracing::error!(task, "Task failed: {e:#}");
            }
        }
    }
}
