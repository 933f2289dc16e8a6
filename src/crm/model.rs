//! Records returned by CRM queries

use crate::cache::EntityType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Prefix marking a foreign key whose name could not be found
pub const UNRESOLVED_PREFIX: &str = "unresolved:";

/// Sentinel for a reference that no longer resolves
pub fn unresolved(id: &Uuid) -> String {
    format!("{}{}", UNRESOLVED_PREFIX, id.hyphenated())
}

/// How a user or division name is turned into a record id
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Only an exact (case-insensitive) name match; more than one is an error
    Exact,
    /// Exact match first, then substring match; the first row wins
    #[default]
    FirstMatch,
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "exact" => Ok(MatchPolicy::Exact),
            "first_match" | "first" => Ok(MatchPolicy::FirstMatch),
            other => Err(format!(
                "unknown match policy '{}', expected 'exact' or 'first_match'",
                other
            )),
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchPolicy::Exact => f.write_str("exact"),
            MatchPolicy::FirstMatch => f.write_str("first_match"),
        }
    }
}

/// Entity set holding display names for one kind of reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupSource {
    pub entity_set: &'static str,
    pub id_field: &'static str,
    pub name_field: &'static str,
}

const USERS: LookupSource = LookupSource {
    entity_set: "systemusers",
    id_field: "systemuserid",
    name_field: "fullname",
};

const BUSINESS_UNITS: LookupSource = LookupSource {
    entity_set: "businessunits",
    id_field: "businessunitid",
    name_field: "name",
};

const ACCOUNTS: LookupSource = LookupSource {
    entity_set: "accounts",
    id_field: "accountid",
    name_field: "name",
};

const CONTACTS: LookupSource = LookupSource {
    entity_set: "contacts",
    id_field: "contactid",
    name_field: "fullname",
};

/// Sources tried in order; customers may be accounts or contacts
pub fn lookup_sources(entity_type: EntityType) -> &'static [LookupSource] {
    match entity_type {
        EntityType::Owner => &[USERS],
        EntityType::Division => &[BUSINESS_UNITS],
        EntityType::Customer => &[ACCOUNTS, CONTACTS],
    }
}

/// Open opportunity with foreign keys replaced by names
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Opportunity {
    pub id: Option<Uuid>,
    pub name: Option<String>,
    pub step_name: Option<String>,
    pub created_on: Option<DateTime<Utc>>,
    pub modified_on: Option<DateTime<Utc>>,
    pub estimated_value: Option<f64>,
    /// As returned by the Web API: `YYYY-MM-DD` for date-only columns, or a
    /// UTC timestamp when the column uses User Local behaviour
    pub estimated_close_date: Option<String>,
    pub owner_name: Option<String>,
    pub division_name: Option<String>,
    pub customer_name: Option<String>,
}

/// Opportunity row as returned by the Web API
#[derive(Debug, Deserialize)]
pub(crate) struct RawOpportunity {
    #[serde(default)]
    pub opportunityid: Option<Uuid>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub stepname: Option<String>,
    #[serde(default)]
    pub createdon: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modifiedon: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimatedvalue_base: Option<f64>,
    #[serde(default)]
    pub estimatedclosedate: Option<String>,
    #[serde(default, rename = "_ownerid_value")]
    pub owner_id: Option<Uuid>,
    #[serde(default, rename = "_customerid_value")]
    pub customer_id: Option<Uuid>,
}

/// Active user that can own opportunities
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub name: String,
    pub domain_name: Option<String>,
}

/// Active business unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DivisionRecord {
    pub id: Uuid,
    pub name: String,
    pub division_name: Option<String>,
}
