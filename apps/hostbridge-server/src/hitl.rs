//! Human-in-the-loop approval manager.
//!
//! Each pending invocation parks on a oneshot rendezvous channel: `submit`
//! deposits the request and awaits a single decision message, `decide` sends
//! it. Message passing (rather than shared flags) rules out lost wakeups. A
//! request leaves `pending` at most once; expiry is authoritative: once
//! `created_at + ttl <= now` the request reads as expired and no decision
//! can land, enforced both lazily on every read and by a background sweeper.

use crate::error::ToolError;
use hostbridge_events::Bus;
use hostbridge_protocol::{HitlRequestView, HitlStatus};
use hostbridge_topics as topics;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitlOutcome {
    Approved,
    Rejected,
    Expired,
    /// The waiting caller went away before any decision.
    Cancelled,
}

struct Entry {
    view: HitlRequestView,
    /// RFC3339 deadline precomputed from created_at + ttl.
    deadline: chrono::DateTime<chrono::Utc>,
    waker: Option<oneshot::Sender<HitlStatus>>,
}

#[derive(Clone)]
pub struct HitlManager {
    table: Arc<Mutex<HashMap<String, Entry>>>,
    bus: Bus,
    default_ttl: u64,
}

impl HitlManager {
    pub fn new(bus: Bus, default_ttl: u64) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            bus,
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> u64 {
        self.default_ttl
    }

    /// Spawn the background sweeper: expires due requests every second and
    /// drops decided entries an hour after creation.
    pub fn start_sweeper(&self) {
        let mgr = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                mgr.sweep();
            }
        });
    }

    fn sweep(&self) {
        let now = chrono::Utc::now();
        let mut expired: Vec<HitlRequestView> = Vec::new();
        {
            let mut table = self.table.lock().expect("hitl table poisoned");
            for entry in table.values_mut() {
                if entry.view.status == HitlStatus::Pending && entry.deadline <= now {
                    entry.view.status = HitlStatus::Expired;
                    if let Some(waker) = entry.waker.take() {
                        let _ = waker.send(HitlStatus::Expired);
                    }
                    expired.push(entry.view.clone());
                }
            }
            let cutoff = now - chrono::Duration::hours(1);
            table.retain(|_, e| {
                e.view.status == HitlStatus::Pending
                    || chrono::DateTime::parse_from_rfc3339(&e.view.created_at)
                        .map(|t| t.with_timezone(&chrono::Utc) >= cutoff)
                        .unwrap_or(true)
            });
        }
        for view in expired {
            info!(id = %view.id, "hitl request expired");
            self.bus.publish(topics::TOPIC_HITL_UPDATED, &view);
        }
    }

    /// Insert a pending request and suspend until a decision, the TTL, or
    /// caller cancellation. The params recorded here are the pre-resolution
    /// template form so reviewers never see secret values.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit(
        &self,
        id: &str,
        tool_category: &str,
        tool_name: &str,
        request_params: Value,
        request_context: Value,
        policy_rule_matched: &str,
        ttl_seconds: Option<u64>,
        cancel: &CancellationToken,
    ) -> HitlOutcome {
        let ttl = ttl_seconds.unwrap_or(self.default_ttl).max(1);
        let created = chrono::Utc::now();
        let view = HitlRequestView {
            id: id.to_string(),
            created_at: created.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            ttl_seconds: ttl,
            tool_category: tool_category.to_string(),
            tool_name: tool_name.to_string(),
            policy_rule_matched: policy_rule_matched.to_string(),
            request_params,
            request_context,
            status: HitlStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            reviewer_note: None,
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.table.lock().expect("hitl table poisoned");
            table.insert(
                id.to_string(),
                Entry {
                    view: view.clone(),
                    deadline: created + chrono::Duration::seconds(ttl as i64),
                    waker: Some(tx),
                },
            );
        }
        info!(id, tool = %format!("{tool_category}_{tool_name}"), ttl, "hitl request created");
        self.bus.publish(topics::TOPIC_HITL_CREATED, &view);

        tokio::select! {
            _ = cancel.cancelled() => {
                // Caller went away; leave the request for the sweeper so an
                // admin screen still sees it expire.
                self.detach_waker(id);
                HitlOutcome::Cancelled
            }
            outcome = tokio::time::timeout(Duration::from_secs(ttl), rx) => match outcome {
                Ok(Ok(HitlStatus::Approved)) => HitlOutcome::Approved,
                Ok(Ok(HitlStatus::Rejected)) => HitlOutcome::Rejected,
                Ok(Ok(_)) | Ok(Err(_)) => HitlOutcome::Expired,
                Err(_) => {
                    self.expire(id);
                    HitlOutcome::Expired
                }
            },
        }
    }

    fn detach_waker(&self, id: &str) {
        let mut table = self.table.lock().expect("hitl table poisoned");
        if let Some(entry) = table.get_mut(id) {
            entry.waker = None;
        }
    }

    fn expire(&self, id: &str) {
        let view = {
            let mut table = self.table.lock().expect("hitl table poisoned");
            match table.get_mut(id) {
                Some(entry) if entry.view.status == HitlStatus::Pending => {
                    entry.view.status = HitlStatus::Expired;
                    entry.waker = None;
                    Some(entry.view.clone())
                }
                _ => None,
            }
        };
        if let Some(view) = view {
            info!(id, "hitl request expired");
            self.bus.publish(topics::TOPIC_HITL_UPDATED, &view);
        }
    }

    /// Transition a pending request to approved or rejected. Fails with
    /// `not_found` when the id is unknown, already decided, or past its TTL.
    pub fn decide(
        &self,
        id: &str,
        approve: bool,
        reviewer: &str,
        note: Option<String>,
    ) -> Result<HitlRequestView, ToolError> {
        let now = chrono::Utc::now();
        let (view, waker) = {
            let mut table = self.table.lock().expect("hitl table poisoned");
            let entry = table
                .get_mut(id)
                .ok_or_else(|| ToolError::not_found(format!("HITL request '{id}' not found")))?;
            if entry.view.status == HitlStatus::Pending && entry.deadline <= now {
                entry.view.status = HitlStatus::Expired;
                entry.waker = None;
            }
            if entry.view.status != HitlStatus::Pending {
                return Err(ToolError::not_found(format!(
                    "HITL request '{id}' is not pending (status: {})",
                    entry.view.status.as_str()
                )));
            }
            entry.view.status = if approve {
                HitlStatus::Approved
            } else {
                HitlStatus::Rejected
            };
            entry.view.reviewed_by = Some(reviewer.to_string());
            entry.view.reviewed_at =
                Some(now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
            entry.view.reviewer_note = note;
            (entry.view.clone(), entry.waker.take())
        };
        info!(id, approve, reviewer, "hitl request decided");
        self.bus.publish(topics::TOPIC_HITL_UPDATED, &view);
        if let Some(waker) = waker {
            if waker.send(view.status).is_err() {
                warn!(id, "hitl waiter already gone");
            }
        }
        Ok(view)
    }

    pub fn list_pending(&self) -> Vec<HitlRequestView> {
        let now = chrono::Utc::now();
        let table = self.table.lock().expect("hitl table poisoned");
        let mut out: Vec<HitlRequestView> = table
            .values()
            .filter(|e| e.view.status == HitlStatus::Pending && e.deadline > now)
            .map(|e| e.view.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn snapshot(&self, id: &str) -> Option<HitlRequestView> {
        let now = chrono::Utc::now();
        let table = self.table.lock().expect("hitl table poisoned");
        table.get(id).map(|e| {
            let mut view = e.view.clone();
            if view.status == HitlStatus::Pending && e.deadline <= now {
                view.status = HitlStatus::Expired;
            }
            view
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> HitlManager {
        HitlManager::new(Bus::new(32), 300)
    }

    #[tokio::test]
    async fn approve_wakes_waiter() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        let waiter = {
            let mgr = mgr.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                mgr.submit(
                    "r1",
                    "fs",
                    "write",
                    json!({"path": "app.conf"}),
                    json!({"protocol": "rest"}),
                    "Matches HITL pattern",
                    Some(30),
                    &cancel,
                )
                .await
            })
        };
        // Wait for the request to land in the table.
        for _ in 0..100 {
            if !mgr.list_pending().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let view = mgr.decide("r1", true, "admin", Some("ok".into())).unwrap();
        assert_eq!(view.status, HitlStatus::Approved);
        assert_eq!(waiter.await.unwrap(), HitlOutcome::Approved);
        // Second decision must fail: the request already left pending.
        let err = mgr.decide("r1", false, "admin", None).unwrap_err();
        assert_eq!(err.kind, hostbridge_protocol::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn reject_wakes_waiter() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        let waiter = {
            let mgr = mgr.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                mgr.submit("r2", "shell", "execute", json!({}), json!({}), "x", Some(30), &cancel)
                    .await
            })
        };
        for _ in 0..100 {
            if !mgr.list_pending().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        mgr.decide("r2", false, "admin", None).unwrap();
        assert_eq!(waiter.await.unwrap(), HitlOutcome::Rejected);
    }

    #[tokio::test]
    async fn ttl_expiry_unblocks_and_blocks_later_decisions() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        let outcome = mgr
            .submit("r3", "fs", "write", json!({}), json!({}), "x", Some(1), &cancel)
            .await;
        assert_eq!(outcome, HitlOutcome::Expired);
        let err = mgr.decide("r3", true, "admin", None).unwrap_err();
        assert_eq!(err.kind, hostbridge_protocol::ErrorKind::NotFound);
        assert_eq!(mgr.snapshot("r3").unwrap().status, HitlStatus::Expired);
    }

    #[tokio::test]
    async fn cancellation_unparks_without_decision() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        let waiter = {
            let mgr = mgr.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                mgr.submit("r4", "fs", "write", json!({}), json!({}), "x", Some(60), &cancel)
                    .await
            })
        };
        for _ in 0..100 {
            if !mgr.list_pending().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), HitlOutcome::Cancelled);
    }

    #[tokio::test]
    async fn created_event_precedes_pending_visibility() {
        let mgr = manager();
        let mut rx = mgr.bus.subscribe();
        let cancel = CancellationToken::new();
        {
            let mgr = mgr.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                mgr.submit("r5", "fs", "write", json!({}), json!({}), "x", Some(30), &cancel)
                    .await
            });
        }
        let env = rx.recv().await.unwrap();
        assert_eq!(env.kind, topics::TOPIC_HITL_CREATED);
        // After observing the created event the request is listable.
        assert_eq!(mgr.list_pending().len(), 1);
        mgr.decide("r5", false, "admin", None).unwrap();
    }
}
