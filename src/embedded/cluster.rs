//! Member registry of the embedded store.
//!
//! The embedded store has no peers to talk to, but it reports membership the
//! way a cluster does so endpoint discovery works the same against both
//! backends.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::store::{Member, StoreError, StoreResult};

fn validate_url(kind: &str, url: &str) -> StoreResult<()> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    match rest {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(StoreError::InvalidArgument(format!("invalid {kind} URL: {url:?}"))),
    }
}

fn validate(member: &Member) -> StoreResult<()> {
    if member.name.is_empty() {
        return Err(StoreError::InvalidArgument("member name cannot be empty".into()));
    }
    if member.client_urls.is_empty() {
        return Err(StoreError::InvalidArgument(
            "at least one client URL is required".into(),
        ));
    }
    for url in &member.peer_urls {
        validate_url("peer", url)?;
    }
    for url in &member.client_urls {
        validate_url("client", url)?;
    }
    Ok(())
}

/// Strips the scheme and any trailing slash so `127.0.0.1:2379`,
/// `http://127.0.0.1:2379` and `http://127.0.0.1:2379/` compare equal.
pub(crate) fn endpoint_authority(endpoint: &str) -> &str {
    let trimmed = endpoint.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map_or(trimmed, |(_, rest)| rest);
    without_scheme.trim_end_matches('/')
}

#[derive(Debug, Default)]
pub struct MemberRegistry {
    members: RwLock<BTreeMap<u64, Member>>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(
        &self,
        name: impl Into<String>,
        peer_urls: Vec<String>,
        client_urls: Vec<String>,
        is_learner: bool,
    ) -> StoreResult<Member> {
        let member = Member {
            id: Uuid::new_v4().as_u64_pair().0,
            name: name.into(),
            peer_urls,
            client_urls,
            is_learner,
        };
        validate(&member)?;

        self.members.write().insert(member.id, member.clone());
        debug!(member_id = member.id, name = %member.name, is_learner, "member added");
        Ok(member)
    }

    pub fn remove_member(&self, id: u64) -> StoreResult<Member> {
        let removed = self
            .members
            .write()
            .remove(&id)
            .ok_or_else(|| StoreError::InvalidArgument(format!("member {id:x} not found")))?;
        debug!(member_id = id, "member removed");
        Ok(removed)
    }

    pub fn list_members(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }

    /// Returns true when `endpoint` is the client URL of some member.
    pub fn serves(&self, endpoint: &str) -> bool {
        let wanted = endpoint_authority(endpoint);
        !wanted.is_empty()
            && self.members.read().values().any(|member| {
                member
                    .client_urls
                    .iter()
                    .any(|url| endpoint_authority(url) == wanted)
            })
    }
}
