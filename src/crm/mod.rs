//! CRM query client
//!
//! Runs the fixed opportunity/user/division queries against the Web API and
//! swaps foreign-key GUIDs for display names. Names come from the
//! [`EntityCache`] first; everything it misses is fetched in one filtered
//! request per lookup source and written back to the cache.

pub mod model;

use crate::cache::{EntityCache, EntityType};
use crate::error::CrmError;
use crate::odata::{fetch_all_pages, filter, ODataTransport, QueryOptions};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

pub use model::{
    lookup_sources, unresolved, DivisionRecord, LookupSource, MatchPolicy, Opportunity,
    UserRecord, UNRESOLVED_PREFIX,
};
use model::RawOpportunity;

pub const DEFAULT_TOP: usize = 1000;

/// Keeps a single lookup URL well below the Web API length limit
pub const MAX_IDS_PER_LOOKUP: usize = 100;

const OPEN_STATE: &str = "statecode eq 0";
const ACTIVE: &str = "isdisabled eq false";

pub struct CrmClient {
    transport: Arc<dyn ODataTransport>,
    cache: Arc<EntityCache>,
    match_policy: MatchPolicy,
    division_field: String,
    max_page_count: usize,
}

impl CrmClient {
    pub fn new(transport: Arc<dyn ODataTransport>, cache: Arc<EntityCache>) -> Self {
        Self {
            transport,
            cache,
            match_policy: MatchPolicy::default(),
            division_field: crate::config::DEFAULT_DIVISION_FIELD.to_string(),
            max_page_count: crate::config::DEFAULT_MAX_PAGE_COUNT,
        }
    }

    pub fn with_match_policy(mut self, policy: MatchPolicy) -> Self {
        self.match_policy = policy;
        self
    }

    /// Opportunity column holding the division (business unit) reference
    pub fn with_division_field(mut self, field: impl Into<String>) -> Self {
        self.division_field = field.into();
        self
    }

    pub fn with_max_page_count(mut self, pages: usize) -> Self {
        self.max_page_count = pages.max(1);
        self
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    /// Open opportunities, newest first, optionally narrowed to one owner and/or division
    pub async fn get_open_opportunities(
        &self,
        owner: Option<&str>,
        division: Option<&str>,
        top: usize,
    ) -> Result<Vec<Opportunity>, CrmError> {
        if top == 0 {
            return Err(CrmError::InvalidArgument(
                "top must be a positive integer".to_string(),
            ));
        }

        let mut clauses = vec![OPEN_STATE.to_string()];

        if let Some(owner) = owner {
            let owner_id = self.resolve_name(EntityType::Owner, owner).await?;
            tracing::info!("Filtered by owner: '{}'", owner);
            clauses.push(filter::any_guid("_ownerid_value", [&owner_id]));
        }

        if let Some(division) = division {
            let division_id = self.resolve_name(EntityType::Division, division).await?;
            tracing::info!("Filtered by division: '{}'", division);
            clauses.push(filter::any_guid(&self.division_field, [&division_id]));
        }

        let options = QueryOptions {
            select: Some(
                [
                    "opportunityid",
                    "name",
                    "stepname",
                    "createdon",
                    "modifiedon",
                    "estimatedvalue_base",
                    "estimatedclosedate",
                    "_ownerid_value",
                    "_customerid_value",
                    self.division_field.as_str(),
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ),
            filter: Some(filter::and_all(&clauses)),
            top: Some(top),
            orderby: Some("createdon desc".to_string()),
        };

        let response = self
            .transport
            .fetch_page("opportunities", &options, None)
            .await?;

        let mut rows = Vec::with_capacity(response.value.len().min(top));
        for row in response.value.into_iter().take(top) {
            let division_id = guid_field(&row, &self.division_field);
            let raw: RawOpportunity = serde_json::from_value(row).map_err(|e| {
                CrmError::Parse(format!("Unexpected opportunity row: {}", e))
            })?;
            rows.push((raw, division_id));
        }

        let owners = self
            .resolve_ids(EntityType::Owner, rows.iter().filter_map(|(r, _)| r.owner_id))
            .await?;
        let divisions = self
            .resolve_ids(EntityType::Division, rows.iter().filter_map(|(_, d)| *d))
            .await?;
        let customers = self
            .resolve_ids(EntityType::Customer, rows.iter().filter_map(|(r, _)| r.customer_id))
            .await?;

        let opportunities = rows
            .into_iter()
            .map(|(raw, division_id)| Opportunity {
                id: raw.opportunityid,
                name: raw.name,
                step_name: raw.stepname,
                created_on: raw.createdon,
                modified_on: raw.modifiedon,
                estimated_value: raw.estimatedvalue_base,
                estimated_close_date: raw.estimatedclosedate,
                owner_name: raw.owner_id.map(|id| name_or_sentinel(&owners, &id)),
                division_name: division_id.map(|id| name_or_sentinel(&divisions, &id)),
                customer_name: raw.customer_id.map(|id| name_or_sentinel(&customers, &id)),
            })
            .collect::<Vec<_>>();

        tracing::info!("Returning {} open opportunities", opportunities.len());
        Ok(opportunities)
    }

    /// Active users; every id/name pair is cached as an owner name
    pub async fn get_users(&self) -> Result<Vec<UserRecord>, CrmError> {
        let options = QueryOptions {
            select: Some(vec![
                "systemuserid".to_string(),
                "fullname".to_string(),
                "domainname".to_string(),
            ]),
            filter: Some(ACTIVE.to_string()),
            orderby: Some("fullname".to_string()),
            ..Default::default()
        };

        let rows =
            fetch_all_pages(self.transport.as_ref(), "systemusers", &options, self.max_page_count)
                .await?;

        let users: Vec<UserRecord> = rows
            .iter()
            .filter_map(|row| {
                let id = guid_field(row, "systemuserid")?;
                Some(UserRecord {
                    id,
                    name: string_field(row, "fullname").unwrap_or_default(),
                    domain_name: string_field(row, "domainname"),
                })
            })
            .collect();

        self.warm(
            EntityType::Owner,
            users.iter().map(|u| (u.id, u.name.clone())),
        )
        .await;
        Ok(users)
    }

    /// Active business units; every id/name pair is cached as a division name
    pub async fn get_divisions(&self) -> Result<Vec<DivisionRecord>, CrmError> {
        let options = QueryOptions {
            select: Some(vec![
                "businessunitid".to_string(),
                "name".to_string(),
                "divisionname".to_string(),
            ]),
            filter: Some(ACTIVE.to_string()),
            orderby: Some("name".to_string()),
            ..Default::default()
        };

        let rows = fetch_all_pages(
            self.transport.as_ref(),
            "businessunits",
            &options,
            self.max_page_count,
        )
        .await?;

        let divisions: Vec<DivisionRecord> = rows
            .iter()
            .filter_map(|row| {
                let id = guid_field(row, "businessunitid")?;
                Some(DivisionRecord {
                    id,
                    name: string_field(row, "name").unwrap_or_default(),
                    division_name: string_field(row, "divisionname"),
                })
            })
            .collect();

        self.warm(
            EntityType::Division,
            divisions.iter().map(|d| (d.id, d.name.clone())),
        )
        .await;
        Ok(divisions)
    }

    /// Turn a user or division name into its record id
    pub async fn resolve_name(&self, entity_type: EntityType, name: &str) -> Result<Uuid, CrmError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CrmError::InvalidArgument(format!(
                "{} name must not be empty",
                entity_type
            )));
        }

        let source = match entity_type {
            EntityType::Owner | EntityType::Division => lookup_sources(entity_type)[0],
            EntityType::Customer => {
                return Err(CrmError::InvalidArgument(
                    "customer names cannot be used as a filter".to_string(),
                ))
            }
        };

        let cached = self.cache.find_by_name(entity_type, name).await;
        match (cached.as_slice(), self.match_policy) {
            ([id], _) => {
                tracing::debug!("Resolved {} '{}' from cache", entity_type, name);
                return Ok(*id);
            }
            ([first, ..], MatchPolicy::FirstMatch) => return Ok(*first),
            ([_, ..], MatchPolicy::Exact) => {
                return Err(CrmError::Ambiguous(format!(
                    "{} cached {} records are named '{}'",
                    cached.len(),
                    entity_type,
                    name
                )))
            }
            ([], _) => {}
        }

        let exact = self
            .lookup_by_filter(&source, active(filter::eq(source.name_field, name)), 2)
            .await?;

        let found = match self.match_policy {
            MatchPolicy::Exact => match exact.as_slice() {
                [one] => Some(one.clone()),
                [] => None,
                _ => {
                    return Err(CrmError::Ambiguous(format!(
                        "more than one {} is named '{}'",
                        entity_type, name
                    )))
                }
            },
            MatchPolicy::FirstMatch => match exact.into_iter().next() {
                Some(first) => Some(first),
                None => self
                    .lookup_by_filter(&source, active(filter::contains(source.name_field, name)), 1)
                    .await?
                    .into_iter()
                    .next(),
            },
        };

        let (id, display_name) = found.ok_or_else(|| {
            tracing::warn!("No {} found matching: '{}'", entity_type, name);
            CrmError::NotFound(format!("no {} matches '{}'", entity_type, name))
        })?;

        if display_name != name {
            tracing::info!("Matched {} '{}' to '{}'", entity_type, name, display_name);
        }
        self.warm(entity_type, [(id, display_name)]).await;
        Ok(id)
    }

    /// Names for `ids`, from the cache or one batched lookup for the misses.
    /// Ids absent from the result did not resolve.
    pub async fn resolve_ids<I>(
        &self,
        entity_type: EntityType,
        ids: I,
    ) -> Result<HashMap<Uuid, String>, CrmError>
    where
        I: IntoIterator<Item = Uuid>,
    {
        let wanted: BTreeSet<Uuid> = ids.into_iter().collect();
        if wanted.is_empty() {
            return Ok(HashMap::new());
        }

        let resolution = self.cache.bulk_resolve(entity_type, wanted).await;
        let mut names = resolution.hits;
        let mut remaining = resolution.misses;
        if remaining.is_empty() {
            return Ok(names);
        }

        let mut fetched: Vec<(Uuid, String)> = Vec::new();
        for source in lookup_sources(entity_type) {
            if remaining.is_empty() {
                break;
            }

            let ids: Vec<Uuid> = remaining.iter().copied().collect();
            for chunk in ids.chunks(MAX_IDS_PER_LOOKUP) {
                tracing::info!(
                    "Looking up {} {} names in {}",
                    chunk.len(),
                    entity_type,
                    source.entity_set
                );
                let found = self
                    .lookup_by_filter(source, filter::any_guid(source.id_field, chunk), chunk.len())
                    .await?;
                for (id, name) in found {
                    if remaining.remove(&id) {
                        fetched.push((id, name));
                    }
                }
            }
        }

        if !remaining.is_empty() {
            tracing::warn!(
                "{} {} reference(s) did not resolve",
                remaining.len(),
                entity_type
            );
        }

        names.extend(fetched.iter().cloned());
        self.warm(entity_type, fetched).await;
        Ok(names)
    }

    /// Query one lookup source and return `(id, name)` pairs
    async fn lookup_by_filter(
        &self,
        source: &LookupSource,
        filter_expr: String,
        top: usize,
    ) -> Result<Vec<(Uuid, String)>, CrmError> {
        let options = QueryOptions {
            select: Some(vec![source.id_field.to_string(), source.name_field.to_string()]),
            filter: Some(filter_expr),
            top: Some(top),
            ..Default::default()
        };

        let response = self
            .transport
            .fetch_page(source.entity_set, &options, None)
            .await?;

        Ok(response
            .value
            .iter()
            .filter_map(|row| {
                let id = guid_field(row, source.id_field)?;
                let name = string_field(row, source.name_field)?;
                Some((id, name))
            })
            .collect())
    }

    /// Store names in the cache; a failed write is logged, not surfaced
    async fn warm<I>(&self, entity_type: EntityType, names: I)
    where
        I: IntoIterator<Item = (Uuid, String)>,
    {
        let names: Vec<(Uuid, String)> = names
            .into_iter()
            .filter(|(_, name)| !name.trim().is_empty())
            .collect();

        if let Err(e) = self.cache.put_many(entity_type, names).await {
            tracing::warn!("Failed to persist {} names: {}", entity_type, e);
        }
    }
}

/// Restrict a name lookup to enabled records
fn active(clause: String) -> String {
    filter::and_all(&[clause, ACTIVE.to_string()])
}

fn name_or_sentinel(names: &HashMap<Uuid, String>, id: &Uuid) -> String {
    names.get(id).cloned().unwrap_or_else(|| unresolved(id))
}

fn guid_field(row: &Value, field: &str) -> Option<Uuid> {
    row.get(field)?.as_str().and_then(|s| Uuid::parse_str(s).ok())
}

fn string_field(row: &Value, field: &str) -> Option<String> {
    row.get(field)?.as_str().map(String::from)
}
