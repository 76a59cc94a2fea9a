//! Playbook and configuration validation.
//!
//! Structural problems that would make a playbook misbehave are errors.
//! Things that only matter at run time, such as actions that are not built
//! in, are warnings.

use crate::config::AppConfig;
use colored::Colorize;
use serde::Serialize;
use std::collections::HashSet;
use tw_actions::ActionRegistry;
use tw_core::playbook::PlaybookDefinition;

/// Result of validation.
#[derive(Debug, Default, Serialize)]
pub struct ValidationResult {
    /// Problems that must be fixed.
    pub errors: Vec<String>,
    /// Problems that should be addressed.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Prints the validation result to the console.
    pub fn print(&self) {
        if !self.warnings.is_empty() {
            println!();
            println!("{}", "Warnings:".yellow().bold());
            for warning in &self.warnings {
                println!("  {} {}", "⚠".yellow(), warning);
            }
        }

        if !self.errors.is_empty() {
            println!();
            println!("{}", "Errors:".red().bold());
            for error in &self.errors {
                println!("  {} {}", "✗".red(), error);
            }
        }

        if self.errors.is_empty() && self.warnings.is_empty() {
            println!("  {} OK", "✓".green());
        }
    }
}

/// Validates playbooks against the available actions.
pub struct PlaybookValidator<'a> {
    registry: &'a ActionRegistry,
}

impl<'a> PlaybookValidator<'a> {
    pub fn new(registry: &'a ActionRegistry) -> Self {
        Self { registry }
    }

    pub fn validate(&self, playbooks: &[PlaybookDefinition]) -> ValidationResult {
        let mut result = ValidationResult::new();

        if playbooks.is_empty() {
            result.add_warning("No playbooks defined");
        }

        let mut ids = HashSet::new();
        for playbook in playbooks {
            if !ids.insert(playbook.id) {
                result.add_error(format!(
                    "Playbook '{}': duplicate id {}",
                    playbook.name, playbook.id
                ));
            }
            self.validate_playbook(playbook, &mut result);
        }

        result
    }

    fn validate_playbook(&self, playbook: &PlaybookDefinition, result: &mut ValidationResult) {
        if let Err(errors) = playbook.validate() {
            for error in errors {
                result.add_error(format!("Playbook '{}': {}", playbook.name, error));
            }
        }

        if !playbook.is_active {
            result.add_warning(format!(
                "Playbook '{}' is inactive and will never be triggered",
                playbook.name
            ));
        }

        if playbook.steps.is_empty() {
            result.add_warning(format!("Playbook '{}' has no steps", playbook.name));
        }

        for step in &playbook.steps {
            if !step.uses.is_empty() && !self.registry.contains(&step.uses) {
                result.add_warning(format!(
                    "Playbook '{}' step '{}': action '{}' is not available locally (use --simulate)",
                    playbook.name, step.id, step.uses
                ));
            }

            if step.timeout_ms == Some(0) {
                result.add_warning(format!(
                    "Playbook '{}' step '{}': timeout of 0 ms fails every attempt",
                    playbook.name, step.id
                ));
            }
        }
    }
}

/// Validates application configuration.
pub fn validate_config(config: &AppConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.engine.max_concurrent_executions == 0 {
        result.add_warning(
            "engine.max_concurrent_executions is 0; one execution will run at a time",
        );
    }

    if config.engine.event_history_size == 0 {
        result.add_warning("engine.event_history_size is 0; recent events are not kept");
    }

    if let Err(e) = config.logging_config(false) {
        result.add_error(format!("{:#}", e));
    }

    result
}
