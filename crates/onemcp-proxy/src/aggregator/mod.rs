//! Capability aggregation across upstream connections.

pub mod capabilities;
pub mod instructions;

pub use capabilities::{
    CapabilityAggregator, CapabilitySnapshot, ChangeSet, ServerPrompt, ServerResource, ServerTool,
    Subscription,
};
pub use instructions::InstructionAggregator;
