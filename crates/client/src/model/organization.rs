use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{assign, UserRecord};
use crate::ids::{FlowId, OrganizationId, UserId};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    #[serde(default)]
    pub trial: bool,
}

/// Organization payload as returned by `/organizations`, or embedded in a
/// flow record (in which case `users` is absent).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrganizationRecord {
    pub id: OrganizationId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parameterized_name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub user_limit: Option<u64>,
    #[serde(default)]
    pub user_count: Option<u64>,
    #[serde(default)]
    pub subscription: Option<Subscription>,
    #[serde(default)]
    pub users: Vec<UserRecord>,
}

impl OrganizationRecord {
    pub fn new(id: u64, parameterized_name: impl Into<String>) -> Self {
        let parameterized_name = parameterized_name.into();
        Self {
            id: id.into(),
            name: parameterized_name.clone(),
            parameterized_name,
            url: None,
            active: true,
            user_limit: None,
            user_count: None,
            subscription: None,
            users: Vec::new(),
        }
    }
}

/// A cached organization (workspace).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    pub parameterized_name: String,
    pub url: Option<String>,
    pub active: bool,
    pub user_limit: Option<u64>,
    pub user_count: Option<u64>,
    pub trial: bool,
    /// Member users, resolved through the user cache
    pub users: BTreeSet<UserId>,
    /// Flows of this organization, resolved through the flow cache
    pub flows: BTreeSet<FlowId>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    pub fn from_record(record: &OrganizationRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            parameterized_name: record.parameterized_name.clone(),
            url: record.url.clone(),
            active: record.active,
            user_limit: record.user_limit,
            user_count: record.user_count,
            trial: record.subscription.as_ref().is_some_and(|s| s.trial),
            users: BTreeSet::new(),
            flows: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    /// Merge scalar fields. Membership is maintained by the cache.
    pub fn merge(&mut self, record: &OrganizationRecord) -> bool {
        let mut changed = false;
        changed |= assign(&mut self.name, &record.name);
        changed |= assign(&mut self.parameterized_name, &record.parameterized_name);
        changed |= assign(&mut self.url, &record.url);
        changed |= assign(&mut self.active, &record.active);
        // Embedded summaries omit the counters; keep what we know.
        if record.user_limit.is_some() {
            changed |= assign(&mut self.user_limit, &record.user_limit);
        }
        if record.user_count.is_some() {
            changed |= assign(&mut self.user_count, &record.user_count);
        }
        if let Some(subscription) = &record.subscription {
            changed |= assign(&mut self.trial, &subscription.trial);
        }
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }
}

impl fmt::Display for Organization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Organization@{}[name=\"{}\",users={}]",
            self.id,
            self.name,
            self.user_count.unwrap_or(self.users.len() as u64)
        )
    }
}
