use thiserror::Error;

/// A value that breaks one of the entity invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Character name must not be empty")]
    EmptyName,
    #[error("History turn {turn} has no content")]
    EmptyTurn { turn: usize },
    #[error("History turn {turn} selects answer {chosen} but has only {len} candidates")]
    ChosenAnswerOutOfRange {
        turn: usize,
        chosen: usize,
        len: usize,
    },
}
