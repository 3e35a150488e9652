//! Canonical event topic constants shared across services.
//!
//! This crate centralizes the string constants used when publishing events
//! so the bus publishers and the WebSocket/admin subscribers stay in sync.
//! Keep this list alphabetized within sections and favor dot.case names.

// HITL approval lifecycle
pub const TOPIC_HITL_CREATED: &str = "hitl.request.created";
pub const TOPIC_HITL_UPDATED: &str = "hitl.request.updated";

// Audit trail
pub const TOPIC_AUDIT_APPENDED: &str = "audit.entry.appended";
pub const TOPIC_AUDIT_PRUNED: &str = "audit.retention.pruned";

// Plan executor
pub const TOPIC_PLAN_CREATED: &str = "plan.created";
pub const TOPIC_PLAN_COMPLETED: &str = "plan.completed";
pub const TOPIC_PLAN_CANCELLED: &str = "plan.cancelled";
pub const TOPIC_PLAN_TASK_UPDATED: &str = "plan.task.updated";

// Memory graph
pub const TOPIC_MEMORY_NODE_STORED: &str = "memory.node.stored";
pub const TOPIC_MEMORY_NODE_DELETED: &str = "memory.node.deleted";
pub const TOPIC_MEMORY_LINK_PUT: &str = "memory.link.put";

// Secrets
pub const TOPIC_SECRETS_RELOADED: &str = "secrets.reloaded";

/// Prefix covering every HITL topic; used by the HITL WebSocket subscription.
pub const PREFIX_HITL: &str = "hitl.";
/// Prefix covering every audit topic; used by the audit WebSocket subscription.
pub const PREFIX_AUDIT: &str = "audit.";
