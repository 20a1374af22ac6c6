//! Instruction registry: maps node type names to handlers.

use std::collections::HashMap;
use std::sync::Arc;

use crate::transport::Transport;
use crate::{CalculationInstruction, ConditionInstruction, DelayInstruction, Instruction, RequestInstruction};

/// Registry of available instructions.
///
/// Populated once at startup and handed to the executor; it is never
/// mutated while executions are being processed.
#[derive(Clone, Default)]
pub struct InstructionRegistry {
    instructions: HashMap<String, Arc<dyn Instruction>>,
}

impl InstructionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in instruction. Outbound requests go
    /// through `transport`.
    pub fn with_builtins(transport: Arc<dyn Transport>) -> Self {
        let mut registry = Self::new();
        registry.register("request", Arc::new(RequestInstruction::new(transport)));
        registry.register("condition", Arc::new(ConditionInstruction));
        registry.register("calculation", Arc::new(CalculationInstruction));
        registry.register("delay", Arc::new(DelayInstruction));
        registry
    }

    /// Register (or replace) the handler for `node_type`.
    pub fn register(&mut self, node_type: impl Into<String>, instruction: Arc<dyn Instruction>) {
        self.instructions.insert(node_type.into(), instruction);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn Instruction>> {
        self.instructions.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.instructions.contains_key(node_type)
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.instructions.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
