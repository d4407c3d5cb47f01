use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::GovernanceError;
use crate::security::sql_sanitize::MAX_LIMIT;
use crate::storage::{EventFilter, EventType, LedgerEvent, LedgerStore};

/// A single super validator's ballot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub voter: String,
    pub sv_party: Option<String>,
    pub accept: bool,
    pub reason_url: Option<String>,
    pub reason_body: Option<String>,
}

/// Governance proposal as recorded by a DsoRules VoteRequest contract.
/// Callers select events by template; parsing only checks the payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub contract_id: String,
    /// Contract id of the first version of this request
    pub tracking_cid: Option<String>,
    pub requester: String,
    pub action_tag: String,
    pub reason_url: Option<String>,
    pub reason_body: Option<String>,
    pub vote_before: DateTime<Utc>,
    pub votes: Vec<Vote>,
    pub created_at: DateTime<Utc>,
    pub archived: bool,
}

impl VoteRequest {
    pub fn from_event(event: &LedgerEvent) -> Result<Self, GovernanceError> {
        if event.event_type != EventType::Created {
            return Err(GovernanceError::NotAVoteRequest(event.event_id.clone()));
        }
        let payload = &event.payload;

        let requester = payload
            .get("requester")
            .and_then(Value::as_str)
            .ok_or(GovernanceError::MissingField("requester"))?
            .to_string();

        let action = payload
            .get("action")
            .ok_or(GovernanceError::MissingField("action"))?;
        let action_tag = innermost_tag(action).ok_or(GovernanceError::InvalidField {
            field: "action",
            reason: "no tag".to_string(),
        })?;

        let vote_before_raw = payload
            .get("voteBefore")
            .and_then(Value::as_str)
            .ok_or(GovernanceError::MissingField("voteBefore"))?;
        let vote_before = DateTime::parse_from_rfc3339(vote_before_raw)
            .map_err(|e| GovernanceError::InvalidField {
                field: "voteBefore",
                reason: e.to_string(),
            })?
            .with_timezone(&Utc);

        let (reason_url, reason_body) = reason_parts(payload.get("reason"));

        let votes = match payload.get("votes") {
            Some(v) => parse_votes(v)?,
            None => Vec::new(),
        };

        let tracking_cid = payload
            .get("trackingCid")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(Self {
            contract_id: event.contract_id.clone(),
            tracking_cid,
            requester,
            action_tag,
            reason_url,
            reason_body,
            vote_before,
            votes,
            created_at: event.record_time,
            archived: false,
        })
    }

    /// Identity shared by every version of the same proposal
    pub fn dedup_key(&self) -> &str {
        self.tracking_cid.as_deref().unwrap_or(&self.contract_id)
    }
}

/// Follow nested `{tag, value}` actions down to the most specific tag
fn innermost_tag(action: &Value) -> Option<String> {
    let mut tag = action.get("tag")?.as_str()?.to_string();
    let mut current = action.get("value");
    while let Some(Value::Object(fields)) = current {
        let nested = fields
            .values()
            .find(|v| v.get("tag").and_then(Value::as_str).is_some());
        match nested {
            Some(inner) => {
                if let Some(t) = inner.get("tag").and_then(Value::as_str) {
                    tag = t.to_string();
                }
                current = inner.get("value");
            }
            None => break,
        }
    }
    Some(tag)
}

fn reason_parts(reason: Option<&Value>) -> (Option<String>, Option<String>) {
    let text = |key: &str| {
        reason
            .and_then(|r| r.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    (text("url"), text("body"))
}

/// Votes arrive either as a JSON object keyed by voter or as a Daml map
/// encoded as `[[voter, ballot], ...]`.
fn parse_votes(raw: &Value) -> Result<Vec<Vote>, GovernanceError> {
    let entries: Vec<(String, &Value)> = match raw {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Value::Array(pairs) => pairs
            .iter()
            .map(|pair| match pair.as_array().map(Vec::as_slice) {
                Some([key, ballot]) => key
                    .as_str()
                    .map(|k| (k.to_string(), ballot))
                    .ok_or(GovernanceError::InvalidField {
                        field: "votes",
                        reason: "voter key is not a string".to_string(),
                    }),
                _ => Err(GovernanceError::InvalidField {
                    field: "votes",
                    reason: "expected [voter, ballot] pair".to_string(),
                }),
            })
            .collect::<Result<_, _>>()?,
        Value::Null => Vec::new(),
        _ => {
            return Err(GovernanceError::InvalidField {
                field: "votes",
                reason: "expected object or array".to_string(),
            })
        }
    };

    entries
        .into_iter()
        .map(|(voter, ballot)| {
            let accept = ballot
                .get("accept")
                .and_then(Value::as_bool)
                .ok_or(GovernanceError::MissingField("votes.accept"))?;
            let (reason_url, reason_body) = reason_parts(ballot.get("reason"));
            Ok(Vote {
                voter,
                sv_party: ballot.get("sv").and_then(Value::as_str).map(str::to_string),
                accept,
                reason_url,
                reason_body,
            })
        })
        .collect()
}

/// Collapse successive versions of a proposal into the newest one, newest first
pub fn dedup_vote_requests(requests: Vec<VoteRequest>) -> Vec<VoteRequest> {
    let mut latest: HashMap<String, VoteRequest> = HashMap::new();
    for request in requests {
        let key = request.dedup_key().to_string();
        match latest.get(&key) {
            Some(existing) if existing.created_at >= request.created_at => {}
            _ => {
                latest.insert(key, request);
            }
        }
    }
    let mut out: Vec<VoteRequest> = latest.into_values().collect();
    out.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.contract_id.cmp(&b.contract_id))
    });
    out
}

/// Load every VoteRequest version from the store, mark archived ones and dedup
pub fn load_vote_requests(
    store: &LedgerStore,
    template: &str,
) -> Result<Vec<VoteRequest>, GovernanceError> {
    let mut events = Vec::new();
    let mut offset = 0;
    loop {
        let filter = EventFilter {
            event_type: Some(EventType::Created),
            template_id: Some(template.to_string()),
            limit: MAX_LIMIT,
            offset,
            ..Default::default()
        };
        let page = store.query_events(&filter)?;
        let page_len = page.len() as i64;
        events.extend(page);
        if page_len < MAX_LIMIT {
            break;
        }
        offset += page_len;
    }

    let ids: Vec<String> = events.iter().map(|e| e.contract_id.clone()).collect();
    let archived: HashSet<String> = store.archived_among(&ids)?.into_iter().collect();

    let mut requests = Vec::with_capacity(events.len());
    for event in &events {
        match VoteRequest::from_event(event) {
            Ok(mut request) => {
                request.archived = archived.contains(&request.contract_id);
                requests.push(request);
            }
            Err(e) => warn!("Skipping VoteRequest event {}: {}", event.event_id, e),
        }
    }
    let deduped = dedup_vote_requests(requests);
    debug!("Loaded {} vote requests ({} versions)", deduped.len(), events.len());
    Ok(deduped)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub accepted: usize,
    pub rejected: usize,
    pub total: usize,
}

impl VoteTally {
    pub fn of(request: &VoteRequest) -> Self {
        let accepted = request.votes.iter().filter(|v| v.accept).count();
        Self {
            accepted,
            rejected: request.votes.len() - accepted,
            total: request.votes.len(),
        }
    }
}

/// Accepting votes needed out of `sv_count`: ceil(2n/3)
pub fn voting_threshold(sv_count: usize) -> usize {
    (2 * sv_count).div_ceil(3)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    InProgress,
    Accepted,
    Rejected,
    Expired,
    Closed,
}

impl ProposalStatus {
    pub fn evaluate(request: &VoteRequest, now: DateTime<Utc>, sv_count: usize) -> Self {
        if request.archived {
            return ProposalStatus::Closed;
        }
        let tally = VoteTally::of(request);
        let threshold = voting_threshold(sv_count);
        if tally.accepted >= threshold {
            ProposalStatus::Accepted
        } else if tally.rejected > sv_count.saturating_sub(threshold) {
            ProposalStatus::Rejected
        } else if request.vote_before < now {
            ProposalStatus::Expired
        } else {
            ProposalStatus::InProgress
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "in_progress" | "inprogress" | "active" => Some(ProposalStatus::InProgress),
            "accepted" => Some(ProposalStatus::Accepted),
            "rejected" => Some(ProposalStatus::Rejected),
            "expired" => Some(ProposalStatus::Expired),
            "closed" => Some(ProposalStatus::Closed),
            _ => None,
        }
    }
}

/// VoteRequest with its tally and derived status, as served by the API
#[derive(Debug, Clone, Serialize)]
pub struct VoteRequestView {
    #[serde(flatten)]
    pub request: VoteRequest,
    pub tally: VoteTally,
    pub status: ProposalStatus,
}

impl VoteRequestView {
    pub fn new(request: VoteRequest, now: DateTime<Utc>, sv_count: usize) -> Self {
        Self {
            tally: VoteTally::of(&request),
            status: ProposalStatus::evaluate(&request, now, sv_count),
            request,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GovernanceSummary {
    pub total: usize,
    pub in_progress: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub expired: usize,
    pub closed: usize,
    pub by_action: BTreeMap<String, usize>,
}

impl GovernanceSummary {
    pub fn from_requests(requests: &[VoteRequest], now: DateTime<Utc>, sv_count: usize) -> Self {
        let mut summary = GovernanceSummary::default();
        for request in requests {
            summary.total += 1;
            match ProposalStatus::evaluate(request, now, sv_count) {
                ProposalStatus::InProgress => summary.in_progress += 1,
                ProposalStatus::Accepted => summary.accepted += 1,
                ProposalStatus::Rejected => summary.rejected += 1,
                ProposalStatus::Expired => summary.expired += 1,
                ProposalStatus::Closed => summary.closed += 1,
            }
            *summary.by_action.entry(request.action_tag.clone()).or_insert(0) += 1;
        }
        summary
    }
}
