//! GraphQL-over-HTTP platform client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use ibots_core::api::{EntryQuery, Mutation, PlatformApi, PlatformConnector, RelationKind, UserQuery};
use ibots_core::{ApiError, ApiResult, Bid, Credentials, Entry, User, UserKind};

use super::graphql;

/// Page size for relation holder lookups.
const RELATION_PAGE: usize = 100;

/// Logs bots into a platform deployment over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    base_url: String,
    timeout: Duration,
}

impl HttpConnector {
    /// Creates a connector for `endpoint`.
    ///
    /// A bare host such as `api.example.org` is reached over HTTPS.
    pub fn new(endpoint: &str) -> Self {
        let endpoint = endpoint.trim_end_matches('/');
        let base_url = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("https://{endpoint}")
        };
        Self {
            base_url,
            timeout: Duration::from_secs(30),
        }
    }

    /// Creates with custom request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    user_id: Value,
}

#[async_trait]
impl PlatformConnector for HttpConnector {
    async fn connect(&self, credentials: &Credentials) -> ApiResult<Arc<dyn PlatformApi>> {
        // One cookie jar per session.
        let client = ClientBuilder::new()
            .timeout(self.timeout)
            .cookie_store(true)
            .build()
            .map_err(|e| ApiError::Rejected(format!("failed to create HTTP client: {e}")))?;

        let login_url = format!("{}/ibis/login-pass/", self.base_url);
        debug!(url = %login_url, username = %credentials.username, "Logging in");
        let response = client
            .post(&login_url)
            .form(&[
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ApiError::Transient(e.to_string()))?;
        check_status(response.status(), &credentials.username)?;

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Serialization(e.to_string()))?;
        let user_id = match login.user_id {
            Value::String(s) if !s.is_empty() => s,
            Value::Number(n) => n.to_string(),
            _ => {
                warn!(username = %credentials.username, "Failed to log in");
                return Err(ApiError::Unauthorized {
                    username: credentials.username.clone(),
                });
            }
        };

        let mut session = HttpSession {
            client,
            graphql_url: format!("{}/graphql/", self.base_url),
            username: credentials.username.clone(),
            identity: Bid::user(UserKind::Person, user_id.clone()),
        };

        // Bots are usually people; fall back to an organization lookup.
        let person = Bid::user(UserKind::Person, user_id.clone());
        if session.fetch_user(&person).await?.is_none() {
            let organization = Bid::user(UserKind::Nonprofit, user_id);
            if session.fetch_user(&organization).await?.is_some() {
                session.identity = organization;
            }
        }

        info!(url = %self.base_url, identity = %session.identity, "HTTP platform session opened");
        Ok(Arc::new(session))
    }
}

fn check_status(status: StatusCode, username: &str) -> ApiResult<()> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ApiError::Unauthorized {
            username: username.to_string(),
        });
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ApiError::Transient(format!("HTTP {}", status.as_u16())));
    }
    Err(ApiError::Rejected(format!("HTTP {}", status.as_u16())))
}

/// A logged-in GraphQL session.
pub struct HttpSession {
    client: Client,
    graphql_url: String,
    username: String,
    identity: Bid,
}

impl HttpSession {
    /// Executes one GraphQL document and returns its collapsed root field.
    async fn execute(&self, document: &str, variables: Value) -> ApiResult<Value> {
        let response = self
            .client
            .post(&self.graphql_url)
            .json(&json!({ "query": document, "variables": variables }))
            .send()
            .await
            .map_err(|e| ApiError::Transient(e.to_string()))?;
        check_status(response.status(), &self.username)?;

        let body: graphql::Response = response
            .json()
            .await
            .map_err(|e| ApiError::Serialization(e.to_string()))?;
        Ok(graphql::root(graphql::collapse(body.into_data()?)))
    }
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("graphql_url", &self.graphql_url)
            .field("identity", &self.identity)
            .finish()
    }
}

#[async_trait]
impl PlatformApi for HttpSession {
    fn identity(&self) -> &Bid {
        &self.identity
    }

    async fn fetch_entries(&self, query: &EntryQuery) -> ApiResult<Vec<Entry>> {
        let since = query
            .since
            .to_rfc3339()
            .ok_or_else(|| ApiError::Serialization(format!("cursor {} out of range", query.since)))?;

        // Each kind is its own connection. Any entry among the oldest `limit`
        // overall is among the oldest `limit` of its kind.
        let mut entries = Vec::new();
        for kind in query.candidate_kinds() {
            let (document, variables) = graphql::entry_list(kind, query, &since);
            let list = self.execute(&document, variables).await?;
            entries.extend(graphql::parse_entries(&list).into_iter().filter(|e| query.matches(e)));
        }

        entries.sort_by_key(|e| e.created);
        entries.truncate(query.limit);
        Ok(entries)
    }

    async fn fetch_entry(&self, bid: &Bid) -> ApiResult<Option<Entry>> {
        let Some(kind) = bid.kind().entry_kind() else {
            return Ok(None);
        };
        let node = self
            .execute(&graphql::entry_node(kind), json!({ "id": bid.id() }))
            .await?;
        if node.is_null() {
            return Ok(None);
        }
        graphql::parse_entry(&node).map(Some)
    }

    async fn fetch_users(&self, query: &UserQuery) -> ApiResult<Vec<User>> {
        let kinds = match query.kind {
            Some(kind) => vec![kind],
            None => vec![UserKind::Nonprofit, UserKind::Person],
        };

        let mut users = Vec::new();
        for kind in kinds {
            let list = self
                .execute(
                    &graphql::user_list(kind),
                    json!({ "first": query.limit, "search": query.search }),
                )
                .await?;
            users.extend(graphql::parse_users(&list));
        }
        if let Some(limit) = query.limit {
            users.truncate(limit);
        }
        Ok(users)
    }

    async fn fetch_user(&self, bid: &Bid) -> ApiResult<Option<User>> {
        let Some(kind) = bid.kind().user_kind() else {
            return Ok(None);
        };
        let node = self
            .execute(&graphql::user_node(kind), json!({ "id": bid.id() }))
            .await?;
        if node.is_null() {
            return Ok(None);
        }
        graphql::parse_user(&node).map(Some)
    }

    async fn mutate(&self, mutation: &Mutation) -> ApiResult<Bid> {
        let (document, variables) = graphql::mutation(self.identity.id(), mutation);
        let result = self.execute(&document, variables).await?;
        graphql::find_bid(&result).ok_or_else(|| {
            ApiError::Serialization(format!("{} response carries no id", mutation.kind()))
        })
    }

    async fn fetch_relation(&self, kind: RelationKind, target: &Bid) -> ApiResult<Vec<Bid>> {
        let mut holders = Vec::new();
        for user_kind in [UserKind::Nonprofit, UserKind::Person] {
            let list = self
                .execute(
                    &graphql::relation_holders(kind, user_kind),
                    json!({ "target": target.id(), "first": RELATION_PAGE }),
                )
                .await?;
            if let Some(items) = list.as_array() {
                holders.extend(items.iter().filter_map(|v| graphql::parse_bid(v).ok()));
            }
        }
        Ok(holders)
    }

    async fn set_relation(&self, kind: RelationKind, target: &Bid, active: bool) -> ApiResult<()> {
        self.execute(
            &graphql::relation_toggle(kind, active),
            json!({ "user": self.identity.id(), "target": target.id() }),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_host_uses_https() {
        assert_eq!(HttpConnector::new("api.example.org/").base_url(), "https://api.example.org");
        assert_eq!(
            HttpConnector::new("http://127.0.0.1:8000").base_url(),
            "http://127.0.0.1:8000"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            check_status(StatusCode::BAD_GATEWAY, "u"),
            Err(ApiError::Transient(_))
        ));
        assert!(matches!(
            check_status(StatusCode::TOO_MANY_REQUESTS, "u"),
            Err(ApiError::Transient(_))
        ));
        assert!(matches!(
            check_status(StatusCode::FORBIDDEN, "u"),
            Err(ApiError::Unauthorized { .. })
        ));
        assert!(matches!(
            check_status(StatusCode::BAD_REQUEST, "u"),
            Err(ApiError::Rejected(_))
        ));
        assert!(check_status(StatusCode::OK, "u").is_ok());
    }
}
