//! Concrete tool handler bodies, one module per category. `all_descriptors`
//! is the single place the catalog is assembled; the registry enforces
//! coordinate uniqueness at boot.

pub mod docker;
pub mod fs;
pub mod git;
pub mod http;
pub mod memory;
pub mod plan;
pub mod shell;
pub mod workspace;

use crate::registry::ToolDescriptor;

pub fn all_descriptors() -> Vec<ToolDescriptor> {
    let mut out = Vec::new();
    out.extend(fs::descriptors());
    out.extend(workspace::descriptors());
    out.extend(shell::descriptors());
    out.extend(git::descriptors());
    out.extend(docker::descriptors());
    out.extend(http::descriptors());
    out.extend(memory::descriptors());
    out.extend(plan::descriptors());
    out
}
