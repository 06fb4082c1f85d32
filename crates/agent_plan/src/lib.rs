//! Plan model shared by the planner, executor and session store.
//!
//! A [`Plan`] is an ordered list of [`PlanStep`]s proposed by the model for one
//! task. Step ids are assigned here, densely from zero, so no caller can build
//! a plan with gaps or reordered ids. The executor only ever changes a step's
//! [`StepStatus`], and only along the edges accepted by
//! [`StepStatus::can_transition_to`].

mod plan;
mod result;
mod status;
mod tool;

pub use plan::{
    Plan, PlanShapeError, PlanStep, ProposedStep, StepId, Task, TaskId, TransitionError,
};
pub use result::{ErrorKind, ResourceRef, ToolInvocationResult};
pub use status::StepStatus;
pub use tool::ToolKind;
