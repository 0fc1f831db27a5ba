//! GitHub organization traversal: members, then each member's repositories.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use graphql_client::QueryBody;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::transport::{GraphqlResponse, GraphqlTransport};
use super::{ensure_well_formed, PageFetcher, ResultPage};
use crate::budget::extract_or_count;
use crate::cursor::{FetchTarget, NodeId, PageInfo};
use crate::entity::{EntityKind, FetchedEntity};
use crate::error::{FatalKind, FetchError};
use crate::planner::FetchPlan;

/// Outer level name.
pub const MEMBERS_LEVEL: &str = "members";

/// Inner level name for member repositories.
pub const REPOSITORIES_LEVEL: &str = "repositories";

/// Nodes billed per repository: the repository and the member's collaborator edge.
pub const REPOSITORY_NODES_PER_CHILD: u64 = 2;

pub const MEMBERS_QUERY: &str = r#"
query OrganizationMembers($login: String!, $first: Int!, $after: String) {
  rateLimit { limit cost remaining resetAt nodeCount }
  organization(login: $login) {
    membersWithRole(first: $first, after: $after) {
      pageInfo { hasNextPage endCursor }
      edges {
        role
        node { id login }
      }
    }
  }
}
"#;

pub const REPOSITORIES_QUERY: &str = r#"
query MemberRepositories($id: ID!, $login: String!, $first: Int!, $after: String) {
  rateLimit { limit cost remaining resetAt nodeCount }
  node(id: $id) {
    ... on User {
      repositories(first: $first, after: $after, ownerAffiliations: [OWNER, COLLABORATOR, ORGANIZATION_MEMBER]) {
        pageInfo { hasNextPage endCursor }
        nodes {
          id name nameWithOwner visibility
          owner { login }
          collaborators(query: $login, first: 1, affiliation: ALL) {
            edges {
              permission
              node { login }
              permissionSources { permission source { __typename } }
            }
          }
        }
      }
    }
  }
}
"#;

/// Link data a level carries from the scoping parent to each child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEdge {
    /// The member's direct permission on a repository, read from the
    /// repository's `collaborators` selection narrowed to the member's login.
    CollaboratorPermission,
}

impl ChildEdge {
    /// Nested nodes a child's edge selection returned.
    fn nested_nodes(&self, node: &Value) -> u64 {
        match self {
            ChildEdge::CollaboratorPermission => node
                .pointer("/collaborators/edges")
                .and_then(Value::as_array)
                .map_or(0, |edges| edges.len() as u64),
        }
    }

    /// Remove the edge selection from `node` and turn it into link attributes.
    fn take(&self, node: &mut Value, parent: Option<&Value>) -> Option<Value> {
        match self {
            ChildEdge::CollaboratorPermission => {
                let selection = node.as_object_mut()?.remove("collaborators")?;
                let login = parent?.get("login")?.as_str()?;
                let connection: CollaboratorConnection = serde_json::from_value(selection).ok()?;
                let edge = connection.edges.into_iter().flatten().find(|edge| {
                    edge.node
                        .as_ref()
                        .is_some_and(|node| node.login.eq_ignore_ascii_case(login))
                })?;
                let repository = node.get("nameWithOwner").and_then(Value::as_str).unwrap_or_default();
                direct_permission(&edge, login, repository).map(|permission| json!({ "permission": permission }))
            }
        }
    }
}

/// A list paged under each member, scoped to the member's node id.
///
/// The query must take `$id: ID!`, `$first: Int!` and `$after: String`, and
/// the connection at `connection_path` must select `pageInfo` and `nodes { id }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerLevel {
    pub name: String,
    pub kind: EntityKind,
    pub operation_name: &'static str,
    pub query: &'static str,
    /// Keys from `data` down to the connection object.
    pub connection_path: Vec<String>,
    /// Nodes billed for each child, nested selections included.
    pub nodes_per_child: u64,
    /// Query variables filled from the parent's payload, as (variable, payload key).
    pub parent_variables: &'static [(&'static str, &'static str)],
    /// Drop children whose `owner.login` is not the traversed organization.
    pub organization_owned: bool,
    /// Fields the token may be denied without failing the page.
    pub optional_fields: &'static [&'static str],
    pub edge: Option<ChildEdge>,
}

impl InnerLevel {
    /// Organization repositories a member can reach, with the member's direct
    /// permission on each.
    pub fn repositories() -> Self {
        Self {
            name: REPOSITORIES_LEVEL.to_string(),
            kind: EntityKind::Repository,
            operation_name: "MemberRepositories",
            query: REPOSITORIES_QUERY,
            connection_path: vec!["node".to_string(), "repositories".to_string()],
            nodes_per_child: REPOSITORY_NODES_PER_CHILD,
            parent_variables: &[("login", "login")],
            organization_owned: true,
            optional_fields: &["collaborators"],
            edge: Some(ChildEdge::CollaboratorPermission),
        }
    }

    fn allows_denied(&self, path: &str) -> bool {
        path.split('.')
            .any(|segment| self.optional_fields.contains(&segment))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberConnection {
    page_info: PageInfo,
    #[serde(default)]
    edges: Vec<Option<MemberEdge>>,
}

#[derive(Debug, Deserialize)]
struct MemberEdge {
    #[serde(default)]
    role: Option<String>,
    node: Option<MemberNode>,
}

#[derive(Debug, Deserialize)]
struct MemberNode {
    id: String,
    login: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeConnection {
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct CollaboratorConnection {
    #[serde(default)]
    edges: Vec<Option<CollaboratorEdge>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollaboratorEdge {
    node: Option<LoginNode>,
    #[serde(default)]
    permission_sources: Vec<PermissionSource>,
}

impl CollaboratorEdge {
    fn granted_by(&self, typename: &str) -> BTreeSet<&str> {
        self.permission_sources
            .iter()
            .filter(|source| source.source.typename == typename)
            .map(|source| source.permission.as_str())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct LoginNode {
    login: String,
}

#[derive(Debug, Deserialize)]
struct PermissionSource {
    permission: String,
    source: SourceType,
}

#[derive(Debug, Deserialize)]
struct SourceType {
    #[serde(rename = "__typename")]
    typename: String,
}

/// Permission granted on the repository itself.
///
/// Admin inherited from owning the organization is not a repository grant.
/// When several repository grants exist the non-admin one wins.
fn direct_permission(edge: &CollaboratorEdge, login: &str, repository: &str) -> Option<String> {
    let repository_grants = edge.granted_by("Repository");
    let organization_grants = edge.granted_by("Organization");
    let admin_only = BTreeSet::from(["ADMIN"]);

    if repository_grants.is_empty()
        || (repository_grants == admin_only && organization_grants == admin_only)
    {
        return None;
    }
    if repository_grants.len() > 1 {
        warn!(member = %login, repository = %repository, "member has mixed repository roles");
    }
    repository_grants
        .iter()
        .find(|permission| repository_grants.len() == 1 || **permission != "ADMIN")
        .map(|permission| permission.to_string())
}

fn denied_error(level: &str, path: &str) -> FetchError {
    FetchError::fatal(
        FatalKind::Auth,
        format!("{level}: token may not read {path}"),
    )
}

/// [`PageFetcher`] for one GitHub organization.
#[derive(Debug, Clone)]
pub struct GithubPageFetcher {
    transport: Arc<dyn GraphqlTransport>,
    organization: String,
    inner_levels: Vec<InnerLevel>,
}

impl GithubPageFetcher {
    pub fn new(transport: Arc<dyn GraphqlTransport>, organization: impl Into<String>) -> Self {
        Self {
            transport,
            organization: organization.into(),
            inner_levels: vec![InnerLevel::repositories()],
        }
    }

    /// Replace the inner levels paged under each member.
    pub fn with_inner_levels(mut self, inner_levels: Vec<InnerLevel>) -> Self {
        self.inner_levels = inner_levels;
        self
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    async fn fetch_members(&self, plan: &FetchPlan) -> Result<ResultPage, FetchError> {
        let body = QueryBody {
            variables: json!({
                "login": self.organization,
                "first": plan.page_size(),
                "after": plan.after(),
            }),
            query: MEMBERS_QUERY,
            operation_name: "OrganizationMembers",
        };
        let GraphqlResponse {
            data,
            rate_limit,
            denied,
        } = self.transport.execute(body).await?;
        if let Some(path) = denied.first() {
            return Err(denied_error(MEMBERS_LEVEL, path));
        }

        let organization = data.get("organization").filter(|v| !v.is_null()).ok_or_else(|| {
            FetchError::fatal(
                FatalKind::NotFound,
                format!("organization {:?} not found", self.organization),
            )
        })?;
        let connection: MemberConnection = decode(organization.get("membersWithRole"), MEMBERS_LEVEL)?;
        ensure_well_formed(&connection.page_info, MEMBERS_LEVEL)?;

        let entities: Vec<FetchedEntity> = connection
            .edges
            .into_iter()
            .flatten()
            .filter_map(|edge| {
                let node = edge.node?;
                Some(FetchedEntity::new(
                    EntityKind::Member,
                    node.id,
                    json!({ "login": node.login, "role": edge.role }),
                ))
            })
            .collect();

        let parsed = extract_or_count(rate_limit.as_ref(), entities.len() as u64);
        debug!(
            organization = %self.organization,
            level = MEMBERS_LEVEL,
            nodes = parsed.cost.nodes,
            is_actual = parsed.is_actual,
            "fetched member page"
        );
        Ok(ResultPage::new(entities, connection.page_info, parsed.cost).with_rate_limit(rate_limit))
    }

    async fn fetch_inner(
        &self,
        parent: &NodeId,
        level: &InnerLevel,
        plan: &FetchPlan,
    ) -> Result<ResultPage, FetchError> {
        let mut variables = json!({
            "id": parent.as_str(),
            "first": plan.page_size(),
            "after": plan.after(),
        });
        for (variable, key) in level.parent_variables {
            let value = plan
                .parent_payload
                .as_ref()
                .and_then(|payload| payload.get(*key))
                .filter(|value| !value.is_null())
                .ok_or_else(|| {
                    FetchError::fatal(
                        FatalKind::MalformedQuery,
                        format!("{} needs {key:?} from the payload of {parent}", level.name),
                    )
                })?;
            variables[*variable] = value.clone();
        }

        let body = QueryBody {
            variables,
            query: level.query,
            operation_name: level.operation_name,
        };
        let GraphqlResponse {
            data,
            rate_limit,
            denied,
        } = self.transport.execute(body).await?;
        if let Some(path) = denied.iter().find(|path| !level.allows_denied(path)) {
            return Err(denied_error(&level.name, path));
        }

        let mut cursor = &data;
        for (depth, key) in level.connection_path.iter().enumerate() {
            cursor = match cursor.get(key) {
                Some(value) if !value.is_null() => value,
                // A null scoped node means the parent vanished since discovery.
                _ if depth == 0 => {
                    return Err(FetchError::fatal(
                        FatalKind::NotFound,
                        format!("node {parent} not found"),
                    ))
                }
                _ => {
                    return Err(FetchError::fatal(
                        FatalKind::MalformedResponse,
                        format!("{} response is missing {key:?}", level.name),
                    ))
                }
            };
        }
        let connection: NodeConnection = decode(Some(cursor), &level.name)?;
        ensure_well_formed(&connection.page_info, &level.name)?;

        let nodes: Vec<Value> = connection.nodes.into_iter().filter(|node| !node.is_null()).collect();
        let nested: u64 = nodes
            .iter()
            .map(|node| level.edge.map_or(0, |edge| edge.nested_nodes(node)))
            .sum();
        let returned = nodes.len() as u64;

        let mut entities = Vec::with_capacity(nodes.len());
        for mut node in nodes {
            let id = node
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    FetchError::fatal(
                        FatalKind::MalformedResponse,
                        format!("{} node without an id", level.name),
                    )
                })?;
            if level.organization_owned && !self.owns(&node) {
                debug!(level = %level.name, id = %id, "skipping node outside the organization");
                continue;
            }
            let edge = level
                .edge
                .and_then(|edge| edge.take(&mut node, plan.parent_payload.as_ref()));
            let entity = FetchedEntity::new(level.kind, id, node);
            entities.push(match edge {
                Some(edge) => entity.with_edge(edge),
                None => entity,
            });
        }

        // The scoped parent node is billed alongside every returned child,
        // kept or not.
        let parsed = extract_or_count(rate_limit.as_ref(), 1 + returned + nested);
        debug!(
            organization = %self.organization,
            level = %level.name,
            parent = %parent,
            returned,
            kept = entities.len(),
            nodes = parsed.cost.nodes,
            is_actual = parsed.is_actual,
            "fetched inner page"
        );
        Ok(ResultPage::new(entities, connection.page_info, parsed.cost).with_rate_limit(rate_limit))
    }

    fn owns(&self, node: &Value) -> bool {
        node.pointer("/owner/login")
            .and_then(Value::as_str)
            .is_some_and(|owner| owner.eq_ignore_ascii_case(&self.organization))
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Option<&Value>, level: &str) -> Result<T, FetchError> {
    let value = value.filter(|v| !v.is_null()).ok_or_else(|| {
        FetchError::fatal(
            FatalKind::MalformedResponse,
            format!("{level} connection missing from response"),
        )
    })?;
    serde_json::from_value(value.clone()).map_err(|e| {
        FetchError::fatal(
            FatalKind::MalformedResponse,
            format!("{level} connection has unexpected shape: {e}"),
        )
    })
}

#[async_trait]
impl PageFetcher for GithubPageFetcher {
    fn outer_level(&self) -> &str {
        MEMBERS_LEVEL
    }

    fn inner_levels(&self) -> Vec<String> {
        self.inner_levels.iter().map(|level| level.name.clone()).collect()
    }

    fn nodes_per_child(&self, level: &str) -> u64 {
        self.inner_levels
            .iter()
            .find(|candidate| candidate.name == level)
            .map_or(1, |candidate| candidate.nodes_per_child)
    }

    async fn fetch(&self, plan: &FetchPlan) -> Result<ResultPage, FetchError> {
        match &plan.target {
            FetchTarget::Outer => self.fetch_members(plan).await,
            FetchTarget::Inner { parent, level } => {
                let inner = self
                    .inner_levels
                    .iter()
                    .find(|candidate| &candidate.name == level)
                    .ok_or_else(|| {
                        FetchError::fatal(
                            FatalKind::MalformedQuery,
                            format!("no query registered for level {level:?}"),
                        )
                    })?;
                self.fetch_inner(parent, inner, plan).await
            }
        }
    }
}
