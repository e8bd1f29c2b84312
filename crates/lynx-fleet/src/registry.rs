use crate::types::Agent;
use chrono::{DateTime, Utc};
use lynx_core::{AgentStatus, Capability, FleetError, FleetResult};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Owns every known agent and its load counter.
///
/// `current_load` only moves through [`reserve`](Self::reserve) and
/// [`release`](Self::release); callers get clones, never the records.
pub struct AgentRegistry {
    agents: HashMap<Uuid, Agent>,
    next_seq: u64,
    /// Weight of the newest outcome in the success-rate EMA.
    smoothing: f64,
}

impl AgentRegistry {
    /// Empty registry with the default EMA smoothing of `0.1`.
    pub fn new() -> Self {
        Self::with_smoothing(0.1)
    }

    /// Empty registry; `smoothing` is the weight of the newest outcome.
    pub fn with_smoothing(smoothing: f64) -> Self {
        Self {
            agents: HashMap::new(),
            next_seq: 0,
            smoothing,
        }
    }

    /// Add an agent. Its load counters are reset; the id must be new.
    pub fn register(&mut self, mut agent: Agent) -> FleetResult<Uuid> {
        if self.agents.contains_key(&agent.id) {
            return Err(FleetError::DuplicateAgent(agent.id));
        }
        if agent.max_concurrency == 0 {
            return Err(FleetError::Config(format!(
                "agent {} must accept at least one concurrent task",
                agent.id
            )));
        }
        if agent.capabilities.is_empty() || agent.capabilities.iter().any(Capability::is_empty) {
            return Err(FleetError::Config(format!(
                "agent {} must advertise at least one non-empty capability",
                agent.id
            )));
        }

        agent.current_load = 0;
        agent.stale = false;
        agent.seq = self.next_seq;
        self.next_seq += 1;
        agent.refresh_status();

        let id = agent.id;
        info!(
            agent_id = %id,
            capabilities = ?agent.capabilities,
            max_concurrency = agent.max_concurrency,
            "Agent registered"
        );
        self.agents.insert(id, agent);
        Ok(id)
    }

    /// Remove an idle agent.
    pub fn deregister(&mut self, id: Uuid) -> FleetResult<Agent> {
        let agent = self.agents.get(&id).ok_or(FleetError::UnknownAgent(id))?;
        if agent.current_load > 0 {
            return Err(FleetError::AgentBusy {
                id,
                load: agent.current_load,
            });
        }
        info!(agent_id = %id, "Agent deregistered");
        self.agents.remove(&id).ok_or(FleetError::UnknownAgent(id))
    }

    /// Look up one agent.
    pub fn get(&self, id: Uuid) -> Option<&Agent> {
        self.agents.get(&id)
    }

    /// All agents in registration order.
    pub fn agents(&self) -> Vec<&Agent> {
        let mut agents: Vec<&Agent> = self.agents.values().collect();
        agents.sort_by_key(|a| a.seq);
        agents
    }

    /// Online agents with headroom for `capability`, best candidate first.
    ///
    /// Ordered by load ratio ascending, then `tasks_completed` descending,
    /// then registration order.
    pub fn find_eligible(&self, capability: &Capability) -> Vec<&Agent> {
        let mut eligible: Vec<&Agent> = self
            .agents
            .values()
            .filter(|a| a.has_capability(capability) && a.is_online() && a.has_headroom())
            .collect();
        eligible.sort_by(|a, b| rank(a, b));
        eligible
    }

    /// Take one slot of the agent's capacity.
    pub fn reserve(&mut self, id: Uuid) -> FleetResult<u32> {
        let agent = self.agents.get_mut(&id).ok_or(FleetError::UnknownAgent(id))?;
        if !agent.has_headroom() {
            return Err(FleetError::AgentAtCapacity(id));
        }
        agent.current_load += 1;
        agent.refresh_status();
        debug!(agent_id = %id, load = agent.current_load, "Agent reserved");
        Ok(agent.current_load)
    }

    /// Give back one slot of the agent's capacity.
    pub fn release(&mut self, id: Uuid) -> FleetResult<u32> {
        let agent = self.agents.get_mut(&id).ok_or(FleetError::UnknownAgent(id))?;
        if agent.current_load == 0 {
            return Err(FleetError::NoReservation(id));
        }
        agent.current_load -= 1;
        agent.refresh_status();
        debug!(agent_id = %id, load = agent.current_load, "Agent released");
        Ok(agent.current_load)
    }

    /// Fold one execution outcome into the agent's counters and EMA.
    pub fn record_outcome(&mut self, id: Uuid, success: bool) -> FleetResult<f64> {
        let smoothing = self.smoothing;
        let agent = self.agents.get_mut(&id).ok_or(FleetError::UnknownAgent(id))?;
        let sample = if success { 1.0 } else { 0.0 };
        agent.success_rate =
            ((1.0 - smoothing) * agent.success_rate + smoothing * sample).clamp(0.0, 1.0);
        if success {
            agent.tasks_completed += 1;
        } else {
            agent.tasks_failed += 1;
        }
        Ok(agent.success_rate)
    }

    /// Exclude an agent from scheduling. In-flight work is unaffected.
    /// Returns `true` if the status changed.
    pub fn set_offline(&mut self, id: Uuid) -> FleetResult<bool> {
        let agent = self.agents.get_mut(&id).ok_or(FleetError::UnknownAgent(id))?;
        agent.stale = false;
        if agent.status == AgentStatus::Offline {
            return Ok(false);
        }
        agent.status = AgentStatus::Offline;
        info!(agent_id = %id, "Agent taken offline");
        Ok(true)
    }

    /// Return an offline agent to scheduling. Returns `true` if the status changed.
    pub fn set_online(&mut self, id: Uuid) -> FleetResult<bool> {
        let agent = self.agents.get_mut(&id).ok_or(FleetError::UnknownAgent(id))?;
        agent.stale = false;
        agent.last_heartbeat = Utc::now();
        if agent.status != AgentStatus::Offline {
            return Ok(false);
        }
        agent.status = AgentStatus::Idle;
        agent.refresh_status();
        info!(agent_id = %id, "Agent back online");
        Ok(true)
    }

    /// Record a liveness signal. An agent the sweep took offline comes back;
    /// an agent an operator took offline stays offline.
    /// Returns `true` if the status changed.
    pub fn heartbeat(&mut self, id: Uuid, at: DateTime<Utc>) -> FleetResult<bool> {
        let agent = self.agents.get_mut(&id).ok_or(FleetError::UnknownAgent(id))?;
        agent.last_heartbeat = at;
        if agent.stale {
            agent.stale = false;
            agent.status = AgentStatus::Idle;
            agent.refresh_status();
            info!(agent_id = %id, "Agent heartbeat resumed");
            return Ok(true);
        }
        Ok(false)
    }

    /// Take offline every online agent whose last heartbeat is older than
    /// `timeout`. Returns the ids that changed.
    pub fn sweep_stale(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<Uuid> {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return Vec::new();
        };
        let mut swept = Vec::new();
        for agent in self.agents.values_mut() {
            if agent.is_online() && now - agent.last_heartbeat > timeout {
                agent.status = AgentStatus::Offline;
                agent.stale = true;
                warn!(
                    agent_id = %agent.id,
                    last_heartbeat = %agent.last_heartbeat,
                    "Agent heartbeat stale, taking offline"
                );
                swept.push(agent.id);
            }
        }
        swept
    }

    /// Whether any registered agent, online or not, advertises `capability`.
    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.agents.values().any(|a| a.has_capability(capability))
    }

    /// Every capability advertised by at least one agent.
    pub fn capabilities(&self) -> BTreeSet<Capability> {
        self.agents
            .values()
            .flat_map(|a| a.capabilities.iter().cloned())
            .collect()
    }

    /// Summed in-flight load across the fleet.
    pub fn total_load(&self) -> u32 {
        self.agents.values().map(|a| a.current_load).sum()
    }

    /// Summed capacity of online agents.
    pub fn total_capacity(&self) -> u32 {
        self.agents
            .values()
            .filter(|a| a.is_online())
            .map(|a| a.max_concurrency)
            .sum()
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Compares load ratios exactly by cross-multiplying.
fn rank(a: &Agent, b: &Agent) -> Ordering {
    let lhs = u64::from(a.current_load) * u64::from(b.max_concurrency);
    let rhs = u64::from(b.current_load) * u64::from(a.max_concurrency);
    lhs.cmp(&rhs)
        .then_with(|| b.tasks_completed.cmp(&a.tasks_completed))
        .then_with(|| a.seq.cmp(&b.seq))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn testing() -> Capability {
        Capability::new("testing")
    }

    #[test]
    fn test_register_and_duplicate() {
        let mut registry = AgentRegistry::new();
        let agent = Agent::new(["testing"], 2);
        let id = agent.id;
        registry.register(agent.clone()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(matches!(
            registry.register(agent),
            Err(FleetError::DuplicateAgent(dup)) if dup == id
        ));
    }

    #[test]
    fn test_register_rejects_zero_capacity() {
        let mut registry = AgentRegistry::new();
        let result = registry.register(Agent::new(["testing"], 0));
        assert!(matches!(result, Err(FleetError::Config(_))));
        let result = registry.register(Agent::new(Vec::<&str>::new(), 1));
        assert!(matches!(result, Err(FleetError::Config(_))));
    }

    #[test]
    fn test_deregister_busy_agent_fails() {
        let mut registry = AgentRegistry::new();
        let id = registry.register(Agent::new(["testing"], 2)).unwrap();
        registry.reserve(id).unwrap();
        assert!(matches!(
            registry.deregister(id),
            Err(FleetError::AgentBusy { load: 1, .. })
        ));
        registry.release(id).unwrap();
        assert!(registry.deregister(id).is_ok());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_deregister_unknown() {
        let mut registry = AgentRegistry::new();
        assert!(matches!(
            registry.deregister(Uuid::new_v4()),
            Err(FleetError::UnknownAgent(_))
        ));
    }

    #[test]
    fn test_reserve_respects_capacity() {
        let mut registry = AgentRegistry::new();
        let id = registry.register(Agent::new(["testing"], 2)).unwrap();
        assert_eq!(registry.reserve(id).unwrap(), 1);
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Working);
        assert_eq!(registry.reserve(id).unwrap(), 2);
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Overloaded);
        assert!(matches!(
            registry.reserve(id),
            Err(FleetError::AgentAtCapacity(_))
        ));
        assert_eq!(registry.get(id).unwrap().current_load, 2);
    }

    #[test]
    fn test_release_never_underflows() {
        let mut registry = AgentRegistry::new();
        let id = registry.register(Agent::new(["testing"], 1)).unwrap();
        assert!(matches!(
            registry.release(id),
            Err(FleetError::NoReservation(_))
        ));
        assert_eq!(registry.get(id).unwrap().current_load, 0);
    }

    #[test]
    fn test_find_eligible_orders_by_load_ratio() {
        let mut registry = AgentRegistry::new();
        let busy = registry.register(Agent::new(["testing"], 2)).unwrap();
        let idle = registry.register(Agent::new(["testing"], 4)).unwrap();
        let _other = registry.register(Agent::new(["frontend"], 4)).unwrap();
        registry.reserve(busy).unwrap();
        registry.reserve(idle).unwrap();

        // busy: 1/2, idle: 1/4
        let eligible = registry.find_eligible(&testing());
        let ids: Vec<Uuid> = eligible.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![idle, busy]);
    }

    #[test]
    fn test_find_eligible_prefers_proven_agents_on_ties() {
        let mut registry = AgentRegistry::new();
        let rookie = registry.register(Agent::new(["testing"], 2)).unwrap();
        let veteran = registry.register(Agent::new(["testing"], 2)).unwrap();
        registry.record_outcome(veteran, true).unwrap();

        let first = registry.find_eligible(&testing())[0].id;
        assert_eq!(first, veteran);
        let _ = rookie;
    }

    #[test]
    fn test_find_eligible_skips_offline_and_full() {
        let mut registry = AgentRegistry::new();
        let offline = registry.register(Agent::new(["testing"], 1)).unwrap();
        let full = registry.register(Agent::new(["testing"], 1)).unwrap();
        registry.set_offline(offline).unwrap();
        registry.reserve(full).unwrap();
        assert!(registry.find_eligible(&testing()).is_empty());
        assert!(registry.has_capability(&testing()));
    }

    #[test]
    fn test_success_rate_ema() {
        let mut registry = AgentRegistry::new();
        let id = registry.register(Agent::new(["testing"], 1)).unwrap();
        let rate = registry.record_outcome(id, false).unwrap();
        assert!((rate - 0.9).abs() < 1e-9);
        let rate = registry.record_outcome(id, true).unwrap();
        assert!((rate - 0.91).abs() < 1e-9);
        let agent = registry.get(id).unwrap();
        assert_eq!(agent.tasks_completed, 1);
        assert_eq!(agent.tasks_failed, 1);
    }

    #[test]
    fn test_sweep_and_heartbeat() {
        let mut registry = AgentRegistry::new();
        let id = registry.register(Agent::new(["testing"], 1)).unwrap();
        let later = Utc::now() + chrono::Duration::seconds(120);

        let swept = registry.sweep_stale(later, Duration::from_secs(90));
        assert_eq!(swept, vec![id]);
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Offline);

        assert!(registry.heartbeat(id, later).unwrap());
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Idle);
    }

    #[test]
    fn test_heartbeat_does_not_undo_manual_offline() {
        let mut registry = AgentRegistry::new();
        let id = registry.register(Agent::new(["testing"], 1)).unwrap();
        registry.set_offline(id).unwrap();
        assert!(!registry.heartbeat(id, Utc::now()).unwrap());
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Offline);
        assert!(registry.set_online(id).unwrap());
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Idle);
    }

    #[test]
    fn test_totals() {
        let mut registry = AgentRegistry::new();
        let a = registry.register(Agent::new(["testing"], 2)).unwrap();
        let b = registry.register(Agent::new(["database"], 3)).unwrap();
        registry.reserve(a).unwrap();
        registry.reserve(b).unwrap();
        assert_eq!(registry.total_load(), 2);
        assert_eq!(registry.total_capacity(), 5);
        registry.set_offline(b).unwrap();
        assert_eq!(registry.total_capacity(), 2);
        assert_eq!(registry.capabilities().len(), 2);
    }
}
