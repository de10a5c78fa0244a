use crate::world::EntityId;
use thiserror::Error;

/// A primitive refused its arguments. Ends the failing task only.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PrimitiveError {
    #[error("argument {argument} expects a number, got '{value}'")]
    InvalidNumber {
        argument: &'static str,
        value: String,
    },
    #[error("{what} must be a finite number")]
    NonFinite { what: &'static str },
    #[error("unknown costume '{0}'")]
    UnknownCostume(String),
    #[error("unknown backdrop '{0}'")]
    UnknownBackdrop(String),
    #[error("unknown sound '{0}'")]
    UnknownSound(String),
    #[error("entity {0} does not exist")]
    UnknownEntity(EntityId),
    #[error("there is no background to switch")]
    NoBackground,
}

/// Why a task stopped executing before reaching the end of its script.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Interrupt {
    #[error("script stopped itself")]
    StopScript,
    #[error("task cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] PrimitiveError),
}

pub type StepResult<T = ()> = Result<T, Interrupt>;
