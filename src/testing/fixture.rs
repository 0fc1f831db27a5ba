use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use super::lock;
use crate::budget::Cost;
use crate::cursor::{FetchTarget, PageInfo};
use crate::entity::{EntityKind, FetchedEntity};
use crate::error::{FatalKind, FetchError};
use crate::fetch::{PageFetcher, ResultPage, MEMBERS_LEVEL, REPOSITORIES_LEVEL};
use crate::planner::FetchPlan;

/// One member and the repositories visible to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureMember {
    pub id: String,
    pub login: String,
    pub repositories: Vec<String>,
}

/// An organization held in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixtureTree {
    members: Vec<FixtureMember>,
    /// Direct permission keyed by (member id, repository id).
    permissions: BTreeMap<(String, String), String>,
}

impl FixtureTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a member. Repository ids may repeat across members.
    pub fn member(mut self, id: &str, login: &str, repositories: &[&str]) -> Self {
        self.members.push(FixtureMember {
            id: id.to_string(),
            login: login.to_string(),
            repositories: repositories.iter().map(|r| r.to_string()).collect(),
        });
        self
    }

    /// Give a member a direct permission on one of its repositories.
    pub fn permission(mut self, member: &str, repository: &str, permission: &str) -> Self {
        self.permissions.insert(
            (member.to_string(), repository.to_string()),
            permission.to_string(),
        );
        self
    }

    pub fn members(&self) -> &[FixtureMember] {
        &self.members
    }

    /// Distinct repository ids across all members, in first-seen order.
    pub fn repository_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for repository in self.members.iter().flat_map(|m| &m.repositories) {
            if !ids.contains(repository) {
                ids.push(repository.clone());
            }
        }
        ids
    }
}

/// A fetch the fixture received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub target: FetchTarget,
    pub after: Option<String>,
    pub page_size: u32,
}

/// [`PageFetcher`] over a [`FixtureTree`].
///
/// Cursors are `<level>:<offset>`. Costs are counted from the returned nodes,
/// plus one for the scoped member on repository pages. Scripted failures are
/// returned, in order, before any real page is served.
#[derive(Debug, Default)]
pub struct FixtureFetcher {
    tree: FixtureTree,
    failures: Mutex<VecDeque<FetchError>>,
    calls: Mutex<Vec<FetchCall>>,
}

impl FixtureFetcher {
    pub fn new(tree: FixtureTree) -> Self {
        Self {
            tree,
            ..Self::default()
        }
    }

    /// Fail the next fetches with these errors.
    pub fn with_failures(self, failures: Vec<FetchError>) -> Self {
        *lock(&self.failures) = failures.into();
        self
    }

    /// Queue one more failure.
    pub fn fail_next(&self, error: FetchError) {
        lock(&self.failures).push_back(error);
    }

    /// Every fetch received so far, including failed ones.
    pub fn calls(&self) -> Vec<FetchCall> {
        lock(&self.calls).clone()
    }

    pub fn tree(&self) -> &FixtureTree {
        &self.tree
    }

    fn page<T: Clone>(
        items: &[T],
        level: &str,
        plan: &FetchPlan,
    ) -> Result<(Vec<T>, PageInfo), FetchError> {
        let offset = match plan.after() {
            None => 0,
            Some(cursor) => cursor
                .strip_prefix(level)
                .and_then(|rest| rest.strip_prefix(':'))
                .and_then(|offset| offset.parse::<usize>().ok())
                .ok_or_else(|| {
                    FetchError::fatal(FatalKind::MalformedQuery, format!("bad cursor {cursor:?}"))
                })?,
        };
        let start = offset.min(items.len());
        let end = start.saturating_add(plan.page_size() as usize).min(items.len());
        let page = items[start..end].to_vec();

        let page_info = PageInfo {
            has_next_page: end < items.len(),
            end_cursor: (end > start || offset > 0).then(|| format!("{level}:{end}")),
        };
        Ok((page, page_info))
    }
}

#[async_trait]
impl PageFetcher for FixtureFetcher {
    fn outer_level(&self) -> &str {
        MEMBERS_LEVEL
    }

    fn inner_levels(&self) -> Vec<String> {
        vec![REPOSITORIES_LEVEL.to_string()]
    }

    async fn fetch(&self, plan: &FetchPlan) -> Result<ResultPage, FetchError> {
        lock(&self.calls).push(FetchCall {
            target: plan.target.clone(),
            after: plan.after().map(str::to_string),
            page_size: plan.page_size(),
        });
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }

        match &plan.target {
            FetchTarget::Outer => {
                let (members, page_info) = Self::page(&self.tree.members, MEMBERS_LEVEL, plan)?;
                let entities: Vec<FetchedEntity> = members
                    .into_iter()
                    .map(|m| FetchedEntity::new(EntityKind::Member, m.id, json!({ "login": m.login })))
                    .collect();
                let cost = Cost::single_request(entities.len() as u64);
                Ok(ResultPage::new(entities, page_info, cost))
            }
            FetchTarget::Inner { parent, level } => {
                if level != REPOSITORIES_LEVEL {
                    return Err(FetchError::fatal(
                        FatalKind::MalformedQuery,
                        format!("unknown level {level:?}"),
                    ));
                }
                let member = self
                    .tree
                    .members
                    .iter()
                    .find(|m| m.id == parent.as_str())
                    .ok_or_else(|| {
                        FetchError::fatal(FatalKind::NotFound, format!("node {parent} not found"))
                    })?;
                let (repositories, page_info) =
                    Self::page(&member.repositories, REPOSITORIES_LEVEL, plan)?;
                let entities: Vec<FetchedEntity> = repositories
                    .into_iter()
                    .map(|r| {
                        let permission = self.tree.permissions.get(&(member.id.clone(), r.clone()));
                        let payload = json!({ "name": r });
                        let entity = FetchedEntity::new(EntityKind::Repository, r, payload);
                        match permission {
                            Some(permission) => entity.with_edge(json!({ "permission": permission })),
                            None => entity,
                        }
                    })
                    .collect();
                let cost = Cost::single_request(1 + entities.len() as u64);
                Ok(ResultPage::new(entities, page_info, cost))
            }
        }
    }
}
