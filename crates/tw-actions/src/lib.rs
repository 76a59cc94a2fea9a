//! # tw-actions
//!
//! Action plugins for Triage Warden playbooks.
//!
//! This crate provides the action registry that the playbook executor
//! dispatches through, plus the built-in actions that need no external
//! system.

pub mod builtin;
pub mod registry;

pub use builtin::{
    register_builtins, register_simulated, LogMessageAction, SetVariablesAction, SimulatedAction,
};
pub use registry::{
    Action, ActionError, ActionInfo, ActionRegistry, ActionResult, ParameterDef, ParameterType,
};
