//! CLI command modules

pub mod menu;
pub mod node;

pub use node::{execute_node_command, NodeArgs};
