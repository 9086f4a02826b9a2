//! In-memory mirror of organizations, flows and users.
//!
//! The cache is the single owner of every entity. Relations are id sets on
//! both sides (organization <-> flow, organization <-> user, flow <-> user)
//! and every mutation here keeps both sides in step.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::error::{ClientError, ClientResult};
use crate::ids::{FlowId, OrganizationId, UserId};
use crate::model::{Flow, FlowRecord, Organization, OrganizationRecord, User, UserRecord};

#[derive(Debug, Default)]
pub struct EntityCache {
    organizations: HashMap<OrganizationId, Organization>,
    flows: HashMap<FlowId, Flow>,
    users: HashMap<UserId, User>,
    /// Flows the reconciler currently considers joined. Always a subset of
    /// `flows`.
    joined: HashSet<FlowId>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn organization(&self, id: OrganizationId) -> Option<&Organization> {
        self.organizations.get(&id)
    }

    pub fn organization_by_name(&self, parameterized_name: &str) -> Option<&Organization> {
        self.organizations
            .values()
            .find(|org| org.parameterized_name == parameterized_name)
    }

    pub fn organizations(&self) -> impl Iterator<Item = &Organization> {
        self.organizations.values()
    }

    pub fn flow(&self, id: &FlowId) -> Option<&Flow> {
        self.flows.get(id)
    }

    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }

    pub fn flow_ids(&self) -> Vec<FlowId> {
        let mut ids: Vec<FlowId> = self.flows.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    /// Members of an organization, resolved through the user cache.
    pub fn organization_users(&self, id: OrganizationId) -> Vec<&User> {
        self.organizations
            .get(&id)
            .map(|org| org.users.iter().filter_map(|user| self.users.get(user)).collect())
            .unwrap_or_default()
    }

    /// Members of a flow, resolved through the user cache.
    pub fn flow_users(&self, id: &FlowId) -> Vec<&User> {
        self.flows
            .get(id)
            .map(|flow| flow.users.iter().filter_map(|user| self.users.get(user)).collect())
            .unwrap_or_default()
    }

    pub fn joined_flows(&self) -> Vec<&Flow> {
        let mut flows: Vec<&Flow> = self
            .joined
            .iter()
            .filter_map(|id| self.flows.get(id))
            .collect();
        flows.sort_by(|a, b| a.id.cmp(&b.id));
        flows
    }

    pub fn is_joined(&self, id: &FlowId) -> bool {
        self.joined.contains(id)
    }

    pub fn joined_len(&self) -> usize {
        self.joined.len()
    }

    pub fn organization_count(&self) -> usize {
        self.organizations.len()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Insert or merge a user. Returns true when the user was first seen.
    pub fn upsert_user(&mut self, record: &UserRecord) -> bool {
        match self.users.get_mut(&record.id) {
            Some(user) => {
                user.merge(record);
                false
            }
            None => {
                self.users.insert(record.id, User::from_record(record));
                true
            }
        }
    }

    /// Insert or merge an organization together with its listed members.
    /// Returns true when the organization was first seen.
    pub fn upsert_organization(&mut self, record: &OrganizationRecord) -> bool {
        let created = match self.organizations.get_mut(&record.id) {
            Some(org) => {
                org.merge(record);
                false
            }
            None => {
                self.organizations
                    .insert(record.id, Organization::from_record(record));
                true
            }
        };

        for user in &record.users {
            self.upsert_user(user);
            self.link_user_to_organization(user.id, record.id);
        }

        created
    }

    /// Record membership on both sides. No-op if either side is unknown.
    pub fn link_user_to_organization(&mut self, user_id: UserId, organization_id: OrganizationId) {
        let (Some(user), Some(org)) = (
            self.users.get_mut(&user_id),
            self.organizations.get_mut(&organization_id),
        ) else {
            return;
        };
        user.organizations.insert(organization_id);
        org.users.insert(user_id);
    }

    /// Organization a flow record would be attached to, without mutating.
    pub fn resolve_organization(&self, record: &FlowRecord) -> Option<OrganizationId> {
        record
            .organization_id()
            .or_else(|| self.flows.get(&record.id).map(|flow| flow.organization_id))
    }

    /// Insert or merge a flow and maintain every back-reference it touches.
    ///
    /// The owning organization comes from the cache; an embedded summary is
    /// cached on first sight. A record with no organization for a flow we do
    /// not know fails with [`ClientError::UnknownOrganization`].
    pub fn upsert_flow(&mut self, record: &FlowRecord) -> ClientResult<bool> {
        let organization_id =
            self.resolve_organization(record)
                .ok_or_else(|| ClientError::UnknownOrganization {
                    flow: record.id.clone(),
                    organization: None,
                })?;

        if !self.organizations.contains_key(&organization_id) {
            match &record.organization {
                Some(embedded) => {
                    debug!(organization = %organization_id, flow = %record.id, "caching embedded organization");
                    self.upsert_organization(embedded);
                }
                None => {
                    return Err(ClientError::UnknownOrganization {
                        flow: record.id.clone(),
                        organization: Some(organization_id),
                    })
                }
            }
        }

        let created = match self.flows.get_mut(&record.id) {
            Some(flow) => {
                let previous = flow.organization_id;
                flow.merge(record, organization_id);
                if previous != organization_id {
                    if let Some(old) = self.organizations.get_mut(&previous) {
                        old.flows.remove(&record.id);
                    }
                }
                false
            }
            None => {
                self.flows
                    .insert(record.id.clone(), Flow::from_record(record, organization_id));
                true
            }
        };

        if let Some(org) = self.organizations.get_mut(&organization_id) {
            org.flows.insert(record.id.clone());
        }

        if let Some(users) = &record.users {
            self.replace_flow_members(&record.id, organization_id, users);
        }

        Ok(created)
    }

    fn replace_flow_members(
        &mut self,
        flow_id: &FlowId,
        organization_id: OrganizationId,
        records: &[UserRecord],
    ) {
        let members: BTreeSet<UserId> = records.iter().map(|user| user.id).collect();
        for record in records {
            self.upsert_user(record);
        }

        let previous = match self.flows.get_mut(flow_id) {
            Some(flow) => std::mem::replace(&mut flow.users, members.clone()),
            None => return,
        };

        for departed in previous.difference(&members) {
            if let Some(user) = self.users.get_mut(departed) {
                user.flows.remove(flow_id);
            }
        }

        for member in &members {
            if let Some(user) = self.users.get_mut(member) {
                user.flows.insert(flow_id.clone());
            }
            self.link_user_to_organization(*member, organization_id);
        }
    }

    /// Add a cached flow to the joined set. Unknown flows are ignored.
    pub fn mark_joined(&mut self, id: &FlowId) -> bool {
        if !self.flows.contains_key(id) {
            return false;
        }
        self.joined.insert(id.clone())
    }

    pub fn mark_unjoined(&mut self, id: &FlowId) -> bool {
        if let Some(flow) = self.flows.get_mut(id) {
            flow.joined = false;
        }
        self.joined.remove(id)
    }

    /// Remove a flow entirely, unlinking it from its organization and members.
    pub fn evict_flow(&mut self, id: &FlowId) -> Option<Flow> {
        let flow = self.flows.remove(id)?;
        self.joined.remove(id);

        if let Some(org) = self.organizations.get_mut(&flow.organization_id) {
            org.flows.remove(id);
        }
        for member in &flow.users {
            if let Some(user) = self.users.get_mut(member) {
                user.flows.remove(id);
            }
        }

        debug!(flow = %id, "evicted flow");
        Some(flow)
    }

    pub fn clear(&mut self) {
        self.organizations.clear();
        self.flows.clear();
        self.users.clear();
        self.joined.clear();
    }
}
