//! Workflow readers.
//!
//! - `directory` -- `*.json` / `*.yaml` / `*.yml` files under a directory
//! - `memory` -- definitions registered in process

pub mod directory;
pub mod memory;

pub use directory::{parse_workflow_file, DirectoryWorkflowReader};
pub use memory::MemoryWorkflowReader;
