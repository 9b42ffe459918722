//! Remote supervisor client.
//!
//! Each supervisor host runs containers for the fleet. The manager talks
//! to it over JSON/HTTP at `http://<host>:<port>/containers/<id>`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fleetgrid_tasks::TaskError;
use http_body_util::{BodyExt, Full};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default supervisor RPC port.
pub const DEFAULT_SUPERVISOR_PORT: u16 = 1337;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("supervisor {host} unreachable: {reason}")]
    Transport { host: String, reason: String },

    #[error("supervisor {host} answered {status}: {body}")]
    Status {
        host: String,
        status: u16,
        body: String,
    },

    #[error("bad supervisor reply from {host}: {reason}")]
    Decode { host: String, reason: String },
}

impl From<SupervisorError> for TaskError {
    fn from(e: SupervisorError) -> Self {
        TaskError::Connection(e.to_string())
    }
}

/// A container as reported by its supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub status: String,
}

/// What a supervisor needs to start one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub app: String,
    pub sha: String,
    pub env: String,
    #[serde(default)]
    pub cpu_shares: u32,
    /// MiB.
    #[serde(default)]
    pub memory_limit: u32,
    /// Resolved env dependency values.
    #[serde(default)]
    pub deps: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct DeployReply {
    port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct MaintenanceBody {
    maintenance: bool,
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    status: String,
}

#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn get(&self, host: &str, id: &str) -> Result<Container, SupervisorError>;

    /// Toggle a container's maintenance flag; returns the supervisor status.
    async fn container_maintenance(
        &self,
        host: &str,
        id: &str,
        maintenance: bool,
    ) -> Result<String, SupervisorError>;

    /// Start a container and return the port it listens on.
    async fn deploy(
        &self,
        host: &str,
        id: &str,
        request: &DeployRequest,
    ) -> Result<u16, SupervisorError>;

    async fn teardown(&self, host: &str, id: &str) -> Result<(), SupervisorError>;
}

/// [`Supervisor`] over HTTP/1.
#[derive(Debug, Clone)]
pub struct HttpSupervisor {
    port: u16,
    timeout: Duration,
}

impl Default for HttpSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_SUPERVISOR_PORT)
    }
}

impl HttpSupervisor {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call<T: DeserializeOwned>(
        &self,
        host: &str,
        method: http::Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T, SupervisorError> {
        let bytes = tokio::time::timeout(self.timeout, self.send(host, method, path, body))
            .await
            .map_err(|_| SupervisorError::Transport {
                host: host.to_string(),
                reason: format!("timed out after {:?}", self.timeout),
            })??;
        serde_json::from_slice(&bytes).map_err(|e| SupervisorError::Decode {
            host: host.to_string(),
            reason: e.to_string(),
        })
    }

    async fn send(
        &self,
        host: &str,
        method: http::Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes, SupervisorError> {
        let address = format!("{host}:{}", self.port);
        let uri = format!("http://{address}{path}");
        let transport = |reason: String| SupervisorError::Transport {
            host: host.to_string(),
            reason,
        };

        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| transport(e.to_string()))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| transport(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header("host", &address)
            .header("content-type", "application/json")
            .header("user-agent", "fleetgrid-manager/0.1")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| transport(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| transport(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| transport(e.to_string()))?
            .to_bytes();
        debug!(%uri, %method, status = %status, "supervisor call");

        if !status.is_success() {
            return Err(SupervisorError::Status {
                host: host.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(bytes)
    }

    fn encode<T: Serialize>(host: &str, value: &T) -> Result<Vec<u8>, SupervisorError> {
        serde_json::to_vec(value).map_err(|e| SupervisorError::Decode {
            host: host.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Supervisor for HttpSupervisor {
    async fn get(&self, host: &str, id: &str) -> Result<Container, SupervisorError> {
        self.call(host, http::Method::GET, &format!("/containers/{id}"), None)
            .await
    }

    async fn container_maintenance(
        &self,
        host: &str,
        id: &str,
        maintenance: bool,
    ) -> Result<String, SupervisorError> {
        let body = Self::encode(host, &MaintenanceBody { maintenance })?;
        let reply: StatusReply = self
            .call(
                host,
                http::Method::POST,
                &format!("/containers/{id}/maintenance"),
                Some(body),
            )
            .await?;
        Ok(reply.status)
    }

    async fn deploy(
        &self,
        host: &str,
        id: &str,
        request: &DeployRequest,
    ) -> Result<u16, SupervisorError> {
        let body = Self::encode(host, request)?;
        let reply: DeployReply = self
            .call(host, http::Method::PUT, &format!("/containers/{id}"), Some(body))
            .await?;
        Ok(reply.port)
    }

    async fn teardown(&self, host: &str, id: &str) -> Result<(), SupervisorError> {
        let _: StatusReply = self
            .call(host, http::Method::DELETE, &format!("/containers/{id}"), None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::extract::Path;
    use axum::routing::{get, post};

    async fn serve_fake() -> u16 {
        let app = axum::Router::new()
            .route(
                "/containers/{id}",
                get(|Path(id): Path<String>| async move {
                    Json(Container {
                        id,
                        status: "running".into(),
                        port: Some(61000),
                        ..Container::default()
                    })
                })
                .put(|Json(req): Json<DeployRequest>| async move {
                    Json(serde_json::json!({ "port": 61000 + req.cpu_shares as u16 }))
                })
                .delete(|| async { Json(serde_json::json!({ "status": "OK" })) }),
            )
            .route(
                "/containers/{id}/maintenance",
                post(|Json(body): Json<MaintenanceBody>| async move {
                    let status = if body.maintenance { "MAINTENANCE" } else { "OK" };
                    Json(serde_json::json!({ "status": status }))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn http_supervisor_round_trips() {
        let port = serve_fake().await;
        let supervisor = HttpSupervisor::new(port);

        let container = supervisor.get("127.0.0.1", "web.abc.prod.1").await.unwrap();
        assert_eq!(container.id, "web.abc.prod.1");
        assert_eq!(container.port, Some(61000));

        let request = DeployRequest {
            app: "web".into(),
            sha: "abc".into(),
            env: "prod".into(),
            cpu_shares: 5,
            ..DeployRequest::default()
        };
        assert_eq!(
            supervisor.deploy("127.0.0.1", "web.abc.prod.1", &request).await.unwrap(),
            61005
        );
        assert_eq!(
            supervisor
                .container_maintenance("127.0.0.1", "web.abc.prod.1", true)
                .await
                .unwrap(),
            "MAINTENANCE"
        );
        supervisor.teardown("127.0.0.1", "web.abc.prod.1").await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_host_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = HttpSupervisor::new(port)
            .get("127.0.0.1", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Transport { .. }));
        assert_eq!(TaskError::from(err).kind(), "connection");
    }
}
