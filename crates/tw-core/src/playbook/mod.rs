//! Playbook engine: definitions, trigger matching, templating, conditions
//! and the sequential step executor.

pub mod conditions;
pub mod context;
pub mod execution;
pub mod executor;
pub mod model;
pub mod store;
pub mod template;
pub mod trigger;

pub use conditions::{
    parse as parse_condition, CompareOp, ConditionError, ConditionEvaluator, Expr, Operand,
};
pub use context::ExecutionContext;
pub use execution::{
    Checkpoint, ExecutionError, ExecutionRecord, ExecutionStatus, StepState, StepStatus,
};
pub use executor::{ExecutorConfig, PlaybookExecutor};
pub use model::{ErrorPolicy, PlaybookDefinition, PlaybookValidationError, Step, TriggerType};
pub use store::{ExecutionStore, InMemoryExecutionStore, StoreError};
pub use template::TemplateResolver;
pub use trigger::{
    InMemoryPlaybookSource, PlaybookFilter, PlaybookSource, TriggerError, TriggerMatcher,
};
