// engagement-consumer/src/models.rs - Canonical Engagement document

use canonsync::{CanonicalDocument, DocumentMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// `null` in a collection position reads as empty
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ============ CANONICAL ENGAGEMENT ============

/// Canonical "Engagement" document: shared prime data plus the MPM overlay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEngagement {
    #[serde(flatten)]
    pub metadata: DocumentMetadata,
    /// Data shared across all systems and subscribers
    pub engagement: EngagementPrimeData,
    /// Data owned by MPM
    pub mpm: EntitySubData,
}

impl CanonicalDocument for CanonicalEngagement {
    const PAYLOAD_TYPE: &'static str = "dm.engagement.v2";
    const SCHEMA_VERSION: u32 = 2;

    fn metadata(&self) -> &DocumentMetadata {
        &self.metadata
    }
}

impl CanonicalEngagement {
    /// A document that has never been written; both sections start at `value_date`
    pub fn new(id: Uuid, event_id: Uuid, value_date: DateTime<Utc>, source: &str) -> Self {
        Self {
            metadata: DocumentMetadata::new(id, Self::SCHEMA_VERSION, event_id, value_date, source),
            engagement: EngagementPrimeData::new(value_date),
            mpm: EntitySubData::new(value_date),
        }
    }

    /// Stamp metadata ahead of a write
    pub fn update_document_metadata(&mut self, value_date: DateTime<Utc>, source: &str, event_id: Uuid) {
        // the MPM overlay is the only one so far, so it alone decides deletion
        let deleted = self.mpm.deleted;
        self.metadata.record_write(value_date, source, event_id, deleted);
    }
}

// ============ PRIME DATA ============

/// Prime section. Equality ignores the high-water mark.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementPrimeData {
    /// Value date of the last write to any field in this section
    pub last_update_date_time: DateTime<Utc>,
    #[serde(flatten)]
    pub details: EngagementDetails,
}

impl EngagementPrimeData {
    pub fn new(value_date: DateTime<Utc>) -> Self {
        Self {
            last_update_date_time: value_date,
            details: EngagementDetails::default(),
        }
    }
}

impl PartialEq for EngagementPrimeData {
    fn eq(&self, other: &Self) -> bool {
        self.details == other.details
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementDetails {
    /// Legacy numeric identifier
    pub engagement_no: i32,

    pub client_id: Uuid,
    pub client_no: i32,
    pub client_name: Option<String>,

    pub description: Option<String>,
    pub type_no: Option<i32>,
    pub type_desc: Option<String>,
    pub sub_type_no: Option<i32>,
    pub sub_type_desc: Option<String>,
    pub nature_no: Option<i32>,
    pub nature_desc: Option<String>,
    pub priority: Option<String>,
    pub status_code_no: Option<i32>,
    pub status_code_desc: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub completed_date: Option<DateTime<Utc>>,
    pub complexity: Option<i32>,
    pub budgeted_fees: Option<i32>,
    pub filing_year: Option<i32>,
    pub office_no: Option<i32>,
    pub office_name: Option<String>,
    pub dept_no: Option<i32>,
    pub dept_name: Option<String>,
    pub region_no: Option<i32>,
    pub region_name: Option<String>,
    pub business_unit_no: Option<i32>,
    pub business_unit_name: Option<String>,
    pub practice_unit_no: Option<i32>,
    pub practice_unit_name: Option<String>,
    pub managed_by_personnel_id: Option<Uuid>,
    pub managed_by_personnel_no: Option<i32>,
    pub managed_by_name: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub team: EngagementTeam,
    #[serde(default, deserialize_with = "null_as_default")]
    pub checklists: Vec<Checklist>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngagementTeam {
    #[serde(default, deserialize_with = "null_as_default")]
    pub members: Vec<EngagementTeamMember>,
}

impl EngagementTeam {
    /// Whether two members share a personnel id
    pub fn has_duplicate_members(&self) -> bool {
        let mut seen = std::collections::HashSet::with_capacity(self.members.len());
        self.members.iter().any(|m| !seen.insert(m.personnel_id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementTeamMember {
    pub personnel_id: Uuid,
    pub personnel_no: i32,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: Option<String>,
    pub display_initials: Option<String>,
    pub user_name: Option<String>,
    pub job_code: Option<String>,
    pub job_title: Option<String>,
    pub position_type: Option<String>,
    pub office_no: Option<i32>,
    pub office_location_no: Option<i32>,
    pub office_location_desc: Option<String>,
    pub office_city: Option<String>,
    pub office_province: Option<String>,
    pub base_hours_per_day: Option<f64>,
    pub manager_id: Option<Uuid>,
    pub manager_name: Option<String>,
    pub business_unit_no: Option<i32>,
    pub business_unit_name: Option<String>,
    pub region_no: Option<i32>,
    pub region_name: Option<String>,
    pub evp_region_no: Option<i32>,
    pub evp_group_name: Option<String>,
    pub primary_service_area_name: Option<String>,
    pub sub_service_area_name: Option<String>,
    pub classification_desc: Option<String>,
    pub role_no: Option<i32>,
    pub role_type: Option<String>,
    pub role_name: Option<String>,
}

/// Checklist of tasks attached to an engagement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checklist {
    pub id: Uuid,
    pub checklist_no: i64,
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub items: Vec<ChecklistItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistItem {
    pub item_no: i64,
    pub item_seq_no: u8,
    pub item_title: Option<String>,
    pub item_description: Option<String>,
    pub item_completed_date: Option<DateTime<Utc>>,
    pub item_completed_by_contact_id: Option<Uuid>,
    pub item_completed_by_contact_no: Option<i32>,
}

// ============ SUBSYSTEM OVERLAY ============

/// Field names of the overlay itself; extension attributes may not shadow them
pub const OVERLAY_FIELDS: [&str; 3] = ["id", "deleted", "lastUpdateDateTime"];

/// Data owned by one source system, including attributes nobody has modeled yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySubData {
    #[serde(default)]
    pub id: Uuid,
    #[serde(default)]
    pub deleted: bool,
    /// The overlay's own high-water mark
    pub last_update_date_time: DateTime<Utc>,
    #[serde(flatten)]
    pub extension_data: BTreeMap<String, Value>,
}

impl EntitySubData {
    pub fn new(value_date: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::nil(),
            deleted: false,
            last_update_date_time: value_date,
            extension_data: BTreeMap::new(),
        }
    }

    /// Apply an event to the overlay. `extension_data` of `None` keeps what is stored.
    /// Returns whether anything changed.
    pub fn update_elements(
        &mut self,
        id: Uuid,
        deleted: bool,
        extension_data: Option<&BTreeMap<String, Value>>,
        value_date: DateTime<Utc>,
    ) -> bool {
        if value_date < self.last_update_date_time {
            return false;
        }

        let unchanged = self.id == id
            && self.deleted == deleted
            && extension_data.map_or(true, |ext| *ext == self.extension_data);
        if unchanged {
            return false;
        }

        self.id = id;
        self.deleted = deleted;
        if let Some(ext) = extension_data {
            self.extension_data = ext.clone();
        }
        self.last_update_date_time = value_date;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_prime_equality_ignores_mark() {
        let now = Utc::now();
        let a = EngagementPrimeData::new(now);
        let b = EngagementPrimeData::new(now - Duration::days(3));
        assert_eq!(a, b);

        let mut c = a.clone();
        c.details.engagement_no = 7;
        assert_ne!(a, c);
    }

    #[test]
    fn test_duplicate_team_members() {
        let member = EngagementTeamMember {
            personnel_id: Uuid::new_v4(),
            ..Default::default()
        };
        let mut team = EngagementTeam {
            members: vec![member.clone()],
        };
        assert!(!team.has_duplicate_members());
        team.members.push(EngagementTeamMember {
            personnel_no: 2,
            ..member
        });
        assert!(team.has_duplicate_members());
    }

    #[test]
    fn test_overlay_respects_its_own_mark() {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let mut overlay = EntitySubData::new(now);

        assert!(!overlay.update_elements(id, false, None, now - Duration::seconds(1)));
        assert!(overlay.update_elements(id, false, None, now));
        assert_eq!(overlay.id, id);

        // same state again is not a change
        assert!(!overlay.update_elements(id, false, None, now + Duration::seconds(5)));
        assert_eq!(overlay.last_update_date_time, now);

        let ext = BTreeMap::from([("billingPartner".to_string(), json!("P-17"))]);
        assert!(overlay.update_elements(id, true, Some(&ext), now + Duration::seconds(5)));
        assert!(overlay.deleted);
        assert_eq!(overlay.extension_data["billingPartner"], "P-17");

        // a delete without a payload keeps the extension bag
        assert!(!overlay.update_elements(id, true, None, now + Duration::seconds(6)));
        assert_eq!(overlay.extension_data.len(), 1);
    }

    #[test]
    fn test_document_json_shape() {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let mut doc = CanonicalEngagement::new(id, Uuid::new_v4(), now, "mpm.engagement.v2");
        doc.mpm.id = id;
        doc.mpm
            .extension_data
            .insert("legacyCode".to_string(), json!("X1"));
        doc.update_document_metadata(now, "mpm.engagement.v2", Uuid::new_v4());

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["id"], json!(id));
        assert_eq!(json["schemaVersion"], 2);
        assert_eq!(json["documentVersion"], 1);
        assert_eq!(json["engagement"]["engagementNo"], 0);
        assert!(json["engagement"]["team"]["members"].is_array());
        assert_eq!(json["mpm"]["legacyCode"], "X1");

        let back: CanonicalEngagement = serde_json::from_value(json).unwrap();
        assert_eq!(back, doc);
    }
}
