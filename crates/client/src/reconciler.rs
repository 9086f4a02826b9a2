//! Flow membership reconciliation.
//!
//! Each tick diffs a fresh `/flows` snapshot against the cache and reports
//! which flows were joined or left since the previous tick. Private flows
//! that are left are evicted; open flows stay cached with `joined = false`.

use std::collections::HashSet;

use flowdock_config::SyncConfig;
use tracing::debug;

use crate::cache::EntityCache;
use crate::error::{ClientError, ClientResult};
use crate::events::ClientEvent;
use crate::ids::FlowId;
use crate::model::{Flow, FlowRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Treat a snapshot as unchanged when its length equals the joined set
    /// size. Misses a join and a leave landing in the same tick.
    pub size_shortcut: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            size_shortcut: true,
        }
    }
}

impl From<&SyncConfig> for ReconcileOptions {
    fn from(sync: &SyncConfig) -> Self {
        Self {
            size_shortcut: sync.size_shortcut,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Joined,
    Unchanged,
    Left,
}

/// Outcome of one reconciliation tick.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// Newly joined flows in snapshot order
    pub joined: Vec<Flow>,
    /// Newly left flows: snapshot order first, then absent flows by id
    pub left: Vec<Flow>,
    pub shortcut_taken: bool,
    /// Every snapshot record and every absent previously joined flow
    pub classified: Vec<(FlowId, Transition)>,
}

impl Reconciliation {
    pub fn has_joins(&self) -> bool {
        !self.joined.is_empty()
    }

    pub fn transition(&self, id: &FlowId) -> Option<Transition> {
        self.classified
            .iter()
            .find(|(flow, _)| flow == id)
            .map(|(_, transition)| *transition)
    }

    /// Events in emission order: single joins, the batched join, single
    /// leaves, the batched leave, then the refresh signal.
    pub fn events(&self) -> Vec<ClientEvent> {
        let mut events: Vec<ClientEvent> = self
            .joined
            .iter()
            .cloned()
            .map(ClientEvent::JoinedFlow)
            .collect();
        if !self.joined.is_empty() {
            events.push(ClientEvent::JoinedFlows(self.joined.clone()));
        }

        events.extend(self.left.iter().cloned().map(ClientEvent::LeftFlow));
        if !self.left.is_empty() {
            events.push(ClientEvent::LeftFlows(self.left.clone()));
        }

        events.push(ClientEvent::FlowsRefreshed);
        events
    }
}

/// Diff `snapshot` against the cache and apply the result.
///
/// Fails without touching the cache when a record for an unknown flow
/// carries no organization.
pub fn reconcile(
    cache: &mut EntityCache,
    snapshot: &[FlowRecord],
    options: ReconcileOptions,
) -> ClientResult<Reconciliation> {
    if options.size_shortcut && snapshot.len() == cache.joined_len() {
        debug!(flows = snapshot.len(), "flow snapshot size unchanged, skipping diff");
        return Ok(Reconciliation {
            shortcut_taken: true,
            ..Reconciliation::default()
        });
    }

    for record in snapshot {
        if cache.resolve_organization(record).is_none() {
            return Err(ClientError::UnknownOrganization {
                flow: record.id.clone(),
                organization: None,
            });
        }
    }

    let mut outcome = Reconciliation::default();
    let mut seen: HashSet<FlowId> = HashSet::with_capacity(snapshot.len());

    for record in snapshot {
        if !seen.insert(record.id.clone()) {
            continue;
        }

        let flagged = cache.flow(&record.id).is_some_and(|flow| flow.joined);
        let tracked = cache.is_joined(&record.id);
        // A record that says "not joined" only ever leaves; it never joins.
        let transition = match (record.joined, flagged || tracked) {
            (false, true) => Transition::Left,
            (false, false) => Transition::Unchanged,
            (true, _) if tracked => Transition::Unchanged,
            (true, _) => Transition::Joined,
        };

        cache.upsert_flow(record)?;
        match transition {
            Transition::Joined => {
                cache.mark_joined(&record.id);
                if let Some(flow) = cache.flow(&record.id) {
                    outcome.joined.push(flow.clone());
                }
            }
            Transition::Left => {
                cache.mark_unjoined(&record.id);
                if let Some(flow) = leave(cache, &record.id) {
                    outcome.left.push(flow);
                }
            }
            Transition::Unchanged => {}
        }
        outcome.classified.push((record.id.clone(), transition));
    }

    let mut absent: Vec<FlowId> = cache
        .flows()
        .filter(|flow| !seen.contains(&flow.id))
        .filter(|flow| flow.joined || cache.is_joined(&flow.id))
        .map(|flow| flow.id.clone())
        .collect();
    absent.sort();

    for id in absent {
        cache.mark_unjoined(&id);
        if let Some(flow) = leave(cache, &id) {
            outcome.left.push(flow);
        }
        outcome.classified.push((id, Transition::Left));
    }

    debug!(
        joined = outcome.joined.len(),
        left = outcome.left.len(),
        cached = cache.flow_count(),
        "reconciled flow snapshot"
    );
    Ok(outcome)
}

/// Evict a left flow unless it is open. Returns the flow as it was last seen.
fn leave(cache: &mut EntityCache, id: &FlowId) -> Option<Flow> {
    let open = cache.flow(id)?.open;
    if open {
        cache.flow(id).cloned()
    } else {
        cache.evict_flow(id)
    }
}
