use thiserror::Error;

use crate::model::TimerInfo;
use crate::persistence::PersistError;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid cron expression {expression:?}: {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("No timer registered for {0}")]
    UnknownTimer(TimerInfo),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl SchedulerError {
    pub(crate) fn invalid_cron(expression: &str, reason: impl ToString) -> Self {
        SchedulerError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
