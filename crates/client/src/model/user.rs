use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::assign;
use crate::ids::{FlowId, OrganizationId, UserId};

/// User payload as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nick: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub disabled: bool,
}

impl UserRecord {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            nick: String::new(),
            email: String::new(),
            avatar: None,
            website: None,
            admin: false,
            disabled: false,
        }
    }
}

/// A cached user. Stored once in the global user cache no matter how many
/// organizations or flows list it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub nick: String,
    pub email: String,
    pub avatar: Option<String>,
    pub website: Option<String>,
    pub admin: bool,
    pub disabled: bool,
    /// Organizations this user belongs to
    pub organizations: BTreeSet<OrganizationId>,
    /// Flows this user is a member of
    pub flows: BTreeSet<FlowId>,
    /// Last time a merge changed a field
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn from_record(record: &UserRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            nick: record.nick.clone(),
            email: record.email.clone(),
            avatar: record.avatar.clone(),
            website: record.website.clone(),
            admin: record.admin,
            disabled: record.disabled,
            organizations: BTreeSet::new(),
            flows: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    /// Merge a fresh record into this user, keeping relations intact.
    pub fn merge(&mut self, record: &UserRecord) -> bool {
        let mut changed = false;
        changed |= assign(&mut self.name, &record.name);
        changed |= assign(&mut self.nick, &record.nick);
        changed |= assign(&mut self.email, &record.email);
        changed |= assign(&mut self.avatar, &record.avatar);
        changed |= assign(&mut self.website, &record.website);
        changed |= assign(&mut self.admin, &record.admin);
        changed |= assign(&mut self.disabled, &record.disabled);
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }

    pub fn display_name(&self) -> &str {
        if self.nick.is_empty() {
            &self.name
        } else {
            &self.nick
        }
    }
}
