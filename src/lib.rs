//! neuromech: composable neural-mechanism models.
//!
//! Mechanisms transform inputs through Functions; States sit at their
//! boundaries; Projections carry values between States. Learning, Control
//! and Gating mechanisms modulate the rest through ParameterStates and
//! InputStates. A [`composition::System`] assembles Processes into
//! dependency graphs and runs them trial by trial under a
//! [`scheduler::Scheduler`].

#[path = "core/error.rs"]
pub mod error;

#[path = "core/value.rs"]
pub mod value;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/function.rs"]
pub mod function;

#[path = "core/learning.rs"]
pub mod learning;

#[path = "core/state.rs"]
pub mod state;

#[path = "core/projection.rs"]
pub mod projection;

#[path = "core/mechanism.rs"]
pub mod mechanism;

#[path = "core/state_spec.rs"]
pub mod state_spec;

#[path = "core/model.rs"]
pub mod model;

#[path = "core/deferred.rs"]
pub mod deferred;

#[path = "core/adaptive.rs"]
pub mod adaptive;

#[path = "core/scheduler.rs"]
pub mod scheduler;

#[path = "core/composition.rs"]
pub mod composition;

pub mod observer;

pub mod prelude {
    pub use crate::adaptive::{
        ControlMechanismSpec, ControlSignalSpec, CostOptions, GatingMechanismSpec, GatingSignalSpec, MonitorSpec,
    };
    pub use crate::composition::{
        inputs, Inputs, LearningSpec, PathwayItem, Process, ProcessSpec, Role, RunOptions, System, SystemConfig,
        TrialOutput, UnresolvedPolicy,
    };
    pub use crate::error::{Error, Result};
    pub use crate::function::{Function, Params};
    pub use crate::learning::LearningRule;
    pub use crate::mechanism::{MechanismSpec, ModulatoryKeyword, OutputStateSpec, ParamSpec};
    pub use crate::model::{MechanismId, Model, ProjectionId, StateId};
    pub use crate::projection::{Endpoint, MatrixSpec, ProjectionSpec};
    pub use crate::scheduler::Condition;
    pub use crate::state::Modulation;
    pub use crate::state_spec::{SpecDict, StateSpec};
    pub use crate::value::Value;
}
