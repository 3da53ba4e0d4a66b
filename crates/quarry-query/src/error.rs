#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    #[error("invalid stage: {0}")]
    InvalidStage(String),

    #[error("unrecognized pipeline stage name: {0}")]
    UnknownStage(String),

    #[error("unrecognized expression operator: {0}")]
    UnknownOperator(String),

    #[error("evaluation error: {0}")]
    Evaluation(String),
}
