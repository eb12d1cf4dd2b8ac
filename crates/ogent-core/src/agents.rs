//! Agent registry: the index of live agents.
//!
//! Maps `agent_id` ↔ `session_id` and holds capability info. All operations
//! are atomic under a single lock; reads return snapshots. For every live
//! agent there is exactly one live session, and at most one live agent per
//! session.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::AgentInfo;

/// A live agent as seen by the controller.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub session_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub info: AgentInfo,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, AgentRecord>,
    by_session: HashMap<Uuid, String>,
}

/// In-memory agent registry.
#[derive(Default)]
pub struct AgentRegistry {
    inner: RwLock<Inner>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent for a session. When `agent_id` is absent one is
    /// synthesized from the session id. If the id is already bound to a
    /// different session, the older session is stale: it is evicted and
    /// returned so the caller can close it.
    pub fn register(
        &self,
        session_id: Uuid,
        agent_id: Option<String>,
        info: AgentInfo,
    ) -> (AgentRecord, Option<Uuid>) {
        let agent_id =
            agent_id.unwrap_or_else(|| format!("agent-{}", session_id.as_simple()));

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let evicted = match inner.by_id.get(&agent_id) {
            Some(existing) if existing.session_id != session_id => {
                let stale = existing.session_id;
                inner.by_session.remove(&stale);
                debug!(agent_id = %agent_id, stale_session = %stale, "evicting stale session");
                Some(stale)
            }
            _ => None,
        };

        let record = match inner.by_id.get_mut(&agent_id) {
            // Re-registration: rebind the session, merge capability info.
            Some(existing) => {
                existing.session_id = session_id;
                existing.connected_at = Utc::now();
                existing.info.merge(info);
                existing.clone()
            }
            None => {
                let record = AgentRecord {
                    agent_id: agent_id.clone(),
                    session_id,
                    connected_at: Utc::now(),
                    info,
                };
                inner.by_id.insert(agent_id.clone(), record.clone());
                record
            }
        };
        inner.by_session.insert(session_id, agent_id.clone());

        info!(agent_id = %agent_id, session_id = %session_id, "agent registered");
        (record, evicted)
    }

    /// Remove an agent by id. Idempotent: absent ids are a no-op.
    pub fn unregister(&self, agent_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = inner.by_id.remove(agent_id) {
            inner.by_session.remove(&record.session_id);
            info!(agent_id = %agent_id, "agent unregistered");
        }
    }

    /// Remove the agent bound to `session_id`, if any. Returns the removed
    /// record. A session that was already evicted by a re-registration does
    /// not remove the (rebound) agent.
    pub fn unregister_session(&self, session_id: Uuid) -> Option<AgentRecord> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let agent_id = inner.by_session.remove(&session_id)?;
        let record = inner.by_id.remove(&agent_id)?;
        info!(agent_id = %record.agent_id, session_id = %session_id, "agent session unregistered");
        Some(record)
    }

    /// Snapshot of an agent by id.
    pub fn get(&self, agent_id: &str) -> Result<AgentRecord> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .by_id
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))
    }

    /// Snapshot of the agent bound to a session.
    pub fn by_session(&self, session_id: Uuid) -> Option<AgentRecord> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let agent_id = inner.by_session.get(&session_id)?;
        inner.by_id.get(agent_id).cloned()
    }

    /// Snapshot of all live agents.
    pub fn list(&self) -> Vec<AgentRecord> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut agents: Vec<_> = inner.by_id.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Merge a capability update into an agent's info.
    pub fn update_info(&self, agent_id: &str, info: AgentInfo) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let record = inner
            .by_id
            .get_mut(agent_id)
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?;
        record.info.merge(info);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_id
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_synthesizes_agent_id() {
        let registry = AgentRegistry::new();
        let session = Uuid::new_v4();
        let (record, evicted) = registry.register(session, None, AgentInfo::default());
        assert_eq!(record.agent_id, format!("agent-{}", session.as_simple()));
        assert!(evicted.is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_uses_supplied_id() {
        let registry = AgentRegistry::new();
        let (record, _) = registry.register(
            Uuid::new_v4(),
            Some("agent-1".to_string()),
            AgentInfo::default(),
        );
        assert_eq!(record.agent_id, "agent-1");
        assert!(registry.get("agent-1").is_ok());
    }

    #[test]
    fn test_reconnect_evicts_stale_session() {
        let registry = AgentRegistry::new();
        let old_session = Uuid::new_v4();
        let new_session = Uuid::new_v4();

        registry.register(old_session, Some("agent-1".to_string()), AgentInfo::default());
        let (record, evicted) =
            registry.register(new_session, Some("agent-1".to_string()), AgentInfo::default());

        assert_eq!(evicted, Some(old_session));
        assert_eq!(record.session_id, new_session);
        // Registration uniqueness: one agent, one session.
        assert_eq!(registry.len(), 1);
        assert!(registry.by_session(old_session).is_none());
        assert_eq!(
            registry.by_session(new_session).unwrap().agent_id,
            "agent-1"
        );
    }

    #[test]
    fn test_stale_session_close_does_not_remove_rebound_agent() {
        let registry = AgentRegistry::new();
        let old_session = Uuid::new_v4();
        let new_session = Uuid::new_v4();
        registry.register(old_session, Some("agent-1".to_string()), AgentInfo::default());
        registry.register(new_session, Some("agent-1".to_string()), AgentInfo::default());

        // The old connection's close handler fires after the reconnect.
        assert!(registry.unregister_session(old_session).is_none());
        assert!(registry.get("agent-1").is_ok());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = AgentRegistry::new();
        registry.register(Uuid::new_v4(), Some("agent-1".to_string()), AgentInfo::default());
        registry.unregister("agent-1");
        registry.unregister("agent-1");
        registry.unregister("agent-never-existed");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_get_absent_is_agent_not_found() {
        let registry = AgentRegistry::new();
        assert!(matches!(
            registry.get("ghost"),
            Err(Error::AgentNotFound(_))
        ));
    }

    #[test]
    fn test_update_info_merges() {
        let registry = AgentRegistry::new();
        registry.register(
            Uuid::new_v4(),
            Some("agent-1".to_string()),
            AgentInfo {
                platform: Some("Linux".to_string()),
                ..Default::default()
            },
        );
        registry
            .update_info(
                "agent-1",
                AgentInfo {
                    remote_enabled: true,
                    remote_target: Some("ops@db-1".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let record = registry.get("agent-1").unwrap();
        assert_eq!(record.info.platform.as_deref(), Some("Linux"));
        assert!(record.info.remote_enabled);
    }

    #[test]
    fn test_list_is_sorted_by_agent_id() {
        let registry = AgentRegistry::new();
        registry.register(Uuid::new_v4(), Some("b".to_string()), AgentInfo::default());
        registry.register(Uuid::new_v4(), Some("a".to_string()), AgentInfo::default());
        let ids: Vec<_> = registry.list().into_iter().map(|a| a.agent_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
