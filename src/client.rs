//! Members API Client
//!
//! Thin reqwest wrapper over the membership REST API. Maps HTTP failures
//! back onto the crate's error type so callers can tell a missing member
//! from a missing leader from a stalled cluster.

use std::time::Duration;

use reqwest::{Response, StatusCode, Url};

use crate::api::{ErrorResponse, HealthResponse, MembersResponse};
use crate::error::{Error, Result};
use crate::state::{Leader, Member};

/// Client for one node's membership API
#[derive(Clone)]
pub struct MembersClient {
    http: reqwest::Client,
    base: Url,
}

impl MembersClient {
    /// Create a client for the node at `endpoint` (e.g. `http://127.0.0.1:2379`)
    /// with routes under `prefix`
    pub fn new(endpoint: &str, prefix: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(&format!("{}{}", endpoint.trim_end_matches('/'), prefix))
            .map_err(|e| Error::Config(format!("invalid endpoint {}: {}", endpoint, e)))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base })
    }

    /// Endpoint the client talks to
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// List all members
    pub async fn list_members(&self) -> Result<Vec<Member>> {
        let response = self.send(self.http.get(self.url(&["members"])?), "list members").await?;
        let body: MembersResponse = response.json().await?;
        Ok(body.members)
    }

    /// Fetch one member by name
    pub async fn get_member(&self, name: &str) -> Result<Member> {
        let response = self.send(self.http.get(self.url(&["members", name])?), name).await?;
        Ok(response.json().await?)
    }

    /// Delete a member by name
    pub async fn delete_member(&self, name: &str) -> Result<()> {
        self.send(self.http.delete(self.url(&["members", name])?), name).await?;
        Ok(())
    }

    /// Current leader
    pub async fn leader(&self) -> Result<Leader> {
        let response = self.send(self.http.get(self.url(&["leader"])?), "get leader").await?;
        Ok(response.json().await?)
    }

    /// Node health
    pub async fn health(&self) -> Result<HealthResponse> {
        let response = self.send(self.http.get(self.url(&["health"])?), "health").await?;
        Ok(response.json().await?)
    }

    /// Send a request, turning error statuses into errors. `subject` names
    /// the member or operation involved.
    async fn send(&self, request: reqwest::RequestBuilder, subject: &str) -> Result<Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(subject.to_string())
            } else if e.is_connect() {
                Error::Network(format!("{}: {}", self.base, e))
            } else {
                Error::Http(e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.json::<ErrorResponse>().await.ok();
        Err(error_for(status, body, subject))
    }
}

/// Map a failed response onto an error
///
/// Domain errors come only from the server's error code, so a bare status
/// (wrong prefix, a proxy in the way) never reads as a missing member or
/// leader.
fn error_for(status: StatusCode, body: Option<ErrorResponse>, subject: &str) -> Error {
    let Some(body) = body else {
        return Error::Network(format!("API error {}", status));
    };

    match body.code.as_str() {
        "MEMBER_NOT_FOUND" => Error::MemberNotFound(subject.to_string()),
        "NO_LEADER" => Error::NoLeader,
        "TIMEOUT" => Error::Timeout(subject.to_string()),
        "DUPLICATE_MEMBER" => Error::DuplicateMember(subject.to_string()),
        "INVALID_MEMBER" => Error::InvalidMember(body.error),
        _ => Error::Network(format!("API error {}: {}", status, body.error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use crate::config::WolfMetaConfig;
    use crate::server::Server;
    use crate::store::ReplicatedStore;

    #[test]
    fn test_url_building() {
        let client = MembersClient::new("http://127.0.0.1:2379/", "/pd/api/v1", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url().as_str(), "http://127.0.0.1:2379/pd/api/v1");
        assert_eq!(
            client.url(&["members", "pd 1"]).unwrap().as_str(),
            "http://127.0.0.1:2379/pd/api/v1/members/pd%201"
        );
    }

    fn error_body(code: &str) -> Option<ErrorResponse> {
        Some(ErrorResponse {
            error: format!("{} happened", code),
            code: code.to_string(),
        })
    }

    #[test]
    fn test_errors_follow_server_code() {
        assert!(matches!(
            error_for(StatusCode::NOT_FOUND, error_body("MEMBER_NOT_FOUND"), "pd1"),
            Error::MemberNotFound(name) if name == "pd1"
        ));
        assert!(matches!(
            error_for(StatusCode::SERVICE_UNAVAILABLE, error_body("NO_LEADER"), "get leader"),
            Error::NoLeader
        ));
        assert!(matches!(
            error_for(StatusCode::GATEWAY_TIMEOUT, error_body("TIMEOUT"), "list members"),
            Error::Timeout(_)
        ));
        assert!(matches!(
            error_for(StatusCode::INTERNAL_SERVER_ERROR, error_body("INTERNAL"), "list members"),
            Error::Network(_)
        ));
    }

    #[test]
    fn test_bare_status_is_not_a_domain_error() {
        assert!(matches!(
            error_for(StatusCode::NOT_FOUND, None, "get leader"),
            Error::Network(_)
        ));
        assert!(matches!(
            error_for(StatusCode::SERVICE_UNAVAILABLE, None, "get leader"),
            Error::Network(_)
        ));
    }

    #[tokio::test]
    async fn test_wrong_prefix_is_not_member_not_found() {
        let dir = tempdir().unwrap();
        let store = ReplicatedStore::new();
        let config = WolfMetaConfig::test_cluster(1, dir.path()).unwrap().remove(0);
        let server = Server::new(config.clone(), store.connect("pd1"));
        server.start().await.unwrap();

        let endpoint = config.advertise_client_url();
        let wrong = MembersClient::new(&endpoint, "/pd/api/v2", Duration::from_secs(2)).unwrap();
        assert!(matches!(wrong.leader().await, Err(Error::Network(_))));

        let right = MembersClient::new(&endpoint, &config.api.prefix, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            right.get_member("nobody").await,
            Err(Error::MemberNotFound(name)) if name == "nobody"
        ));

        server.close().await;
    }

    #[test]
    fn test_invalid_endpoint() {
        let result = MembersClient::new("not a url", "/pd/api/v1", Duration::from_secs(1));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_node_is_network_error() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = MembersClient::new(
            &format!("http://127.0.0.1:{}", port),
            "/pd/api/v1",
            Duration::from_secs(1),
        )
        .unwrap();

        let err = client.list_members().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
