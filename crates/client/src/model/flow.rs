use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{assign, OrganizationRecord, UserRecord};
use crate::ids::{FlowId, OrganizationId, UserId};

/// Flow summary as returned by `/flows` and `/flows/all`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowRecord {
    pub id: FlowId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parameterized_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub open: bool,
    #[serde(default)]
    pub joined: bool,
    #[serde(default)]
    pub unread_mentions: u64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub access_mode: Option<String>,
    #[serde(default)]
    pub organization: Option<OrganizationRecord>,
    /// Present only when the listing was requested with `users=1`. When
    /// present it is the authoritative member list.
    #[serde(default)]
    pub users: Option<Vec<UserRecord>>,
}

impl FlowRecord {
    pub fn new(id: impl Into<FlowId>, organization: OrganizationRecord) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            parameterized_name: id.to_string(),
            id,
            description: None,
            open: false,
            joined: false,
            unread_mentions: 0,
            url: None,
            web_url: None,
            access_mode: None,
            organization: Some(organization),
            users: None,
        }
    }

    pub fn organization_id(&self) -> Option<OrganizationId> {
        self.organization.as_ref().map(|org| org.id)
    }
}

/// A cached flow (chat room).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    pub parameterized_name: String,
    pub description: Option<String>,
    pub open: bool,
    pub joined: bool,
    pub unread_mentions: u64,
    pub url: Option<String>,
    pub web_url: Option<String>,
    pub access_mode: Option<String>,
    /// Owning organization, resolved through the organization cache
    pub organization_id: OrganizationId,
    pub users: BTreeSet<UserId>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn from_record(record: &FlowRecord, organization_id: OrganizationId) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            parameterized_name: record.parameterized_name.clone(),
            description: record.description.clone(),
            open: record.open,
            joined: record.joined,
            unread_mentions: record.unread_mentions,
            url: record.url.clone(),
            web_url: record.web_url.clone(),
            access_mode: record.access_mode.clone(),
            organization_id,
            users: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    /// Merge scalar fields and the owning organization id. Member sets are
    /// handled by the cache, which also fixes up back-references.
    pub fn merge(&mut self, record: &FlowRecord, organization_id: OrganizationId) -> bool {
        let mut changed = false;
        changed |= assign(&mut self.name, &record.name);
        changed |= assign(&mut self.parameterized_name, &record.parameterized_name);
        changed |= assign(&mut self.description, &record.description);
        changed |= assign(&mut self.open, &record.open);
        changed |= assign(&mut self.joined, &record.joined);
        changed |= assign(&mut self.unread_mentions, &record.unread_mentions);
        changed |= assign(&mut self.url, &record.url);
        changed |= assign(&mut self.web_url, &record.web_url);
        changed |= assign(&mut self.access_mode, &record.access_mode);
        changed |= assign(&mut self.organization_id, &organization_id);
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Flow@{}[name=\"{}\",users={}]",
            self.id,
            self.name,
            self.users.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_defaults_missing_fields() {
        let record: FlowRecord = serde_json::from_value(json!({
            "id": "abc",
            "open": true,
            "organization": { "id": 1, "parameterized_name": "acme" }
        }))
        .unwrap();

        assert!(record.open);
        assert!(!record.joined);
        assert!(record.users.is_none());
        assert_eq!(record.organization_id(), Some(OrganizationId(1)));
    }

    #[test]
    fn merge_is_idempotent() {
        let record = FlowRecord::new("abc", OrganizationRecord::new(1, "acme"));
        let mut flow = Flow::from_record(&record, OrganizationId(1));
        let stamp = flow.updated_at;

        assert!(!flow.merge(&record, OrganizationId(1)));
        assert_eq!(flow.updated_at, stamp);

        let mut renamed = record.clone();
        renamed.name = "Renamed".into();
        assert!(flow.merge(&renamed, OrganizationId(1)));
        assert_eq!(flow.name, "Renamed");
    }
}
