//! RemoteStore: HTTP/1 client for the coordination service.
//!
//! Every call is a JSON `POST` to `http://<address>/coord/<op>`. Transport
//! failures and timeouts surface as [`CoordError::Connection`]; error
//! replies carry a [`WireError`] that maps back onto the original kind.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{CoordError, CoordResult};
use crate::local::NodeKind;
use crate::wire::{self, *};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RemoteStore {
    address: String,
    timeout: Duration,
}

impl RemoteStore {
    /// `endpoint` is `host:port` or `http://host:port`.
    pub fn new(endpoint: &str) -> CoordResult<Self> {
        let address = endpoint
            .strip_prefix("http://")
            .unwrap_or(endpoint)
            .trim_end_matches('/');
        if address.is_empty() || address.contains('/') || !address.contains(':') {
            return Err(CoordError::Connection(format!(
                "unsupported coordination endpoint {endpoint:?}; expected http://host:port"
            )));
        }
        Ok(Self {
            address: address.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    // ── Node operations ────────────────────────────────────────────

    pub async fn get(&self, path: &str) -> CoordResult<Vec<u8>> {
        let reply: DataReply = self.call("get", &path_request(path)).await?;
        wire::decode(&reply.data)
    }

    pub async fn exists(&self, path: &str) -> CoordResult<bool> {
        let reply: ExistsReply = self.call("exists", &path_request(path)).await?;
        Ok(reply.exists)
    }

    pub async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        let reply: ChildrenReply = self.call("children", &path_request(path)).await?;
        Ok(reply.children)
    }

    pub async fn set(&self, path: &str, data: &[u8], create_if_absent: bool) -> CoordResult<()> {
        let req = SetRequest {
            path: path.to_string(),
            data: wire::encode(data),
            create_if_absent,
        };
        let _: Empty = self.call("set", &req).await?;
        Ok(())
    }

    pub async fn create(&self, path: &str, data: &[u8], kind: NodeKind) -> CoordResult<String> {
        let req = CreateRequest {
            path: path.to_string(),
            data: wire::encode(data),
            kind,
        };
        let reply: CreatedReply = self.call("create", &req).await?;
        Ok(reply.path)
    }

    pub async fn ensure_path(&self, path: &str) -> CoordResult<()> {
        let _: Empty = self.call("ensure", &path_request(path)).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> CoordResult<()> {
        let _: Empty = self.call("delete", &path_request(path)).await?;
        Ok(())
    }

    pub async fn recursive_delete(&self, path: &str) -> CoordResult<()> {
        let _: Empty = self.call("recursive-delete", &path_request(path)).await?;
        Ok(())
    }

    // ── Changes ────────────────────────────────────────────────────

    pub async fn zxid(&self) -> CoordResult<u64> {
        let reply: ZxidReply = self.call("zxid", &Empty {}).await?;
        Ok(reply.zxid)
    }

    /// Long-poll for a change to `path` after `since`, for at most `wait`.
    pub async fn wait(&self, path: &str, since: u64, wait: Duration) -> CoordResult<WaitReply> {
        let req = WaitRequest {
            path: path.to_string(),
            since,
            wait_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
        };
        self.call_within("wait", &req, wait + self.timeout).await
    }

    // ── Sessions ───────────────────────────────────────────────────

    pub async fn open_session(&self) -> CoordResult<SessionReply> {
        self.call("sessions/open", &Empty {}).await
    }

    pub async fn heartbeat(&self, session: u64) -> CoordResult<()> {
        let _: Empty = self
            .call("sessions/heartbeat", &SessionRequest { session })
            .await?;
        Ok(())
    }

    pub async fn close_session(&self, session: u64) -> CoordResult<()> {
        let _: Empty = self
            .call("sessions/close", &SessionRequest { session })
            .await?;
        Ok(())
    }

    // ── Transport ──────────────────────────────────────────────────

    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        op: &str,
        req: &Req,
    ) -> CoordResult<Resp> {
        self.call_within(op, req, self.timeout).await
    }

    async fn call_within<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        op: &str,
        req: &Req,
        timeout: Duration,
    ) -> CoordResult<Resp> {
        let body = serde_json::to_vec(req).map_err(|e| CoordError::Serialize(e.to_string()))?;
        let (status, bytes) = tokio::time::timeout(timeout, self.send(op, body))
            .await
            .map_err(|_| {
                CoordError::Connection(format!(
                    "{} /coord/{op} timed out after {timeout:?}",
                    self.address
                ))
            })??;
        if !status.is_success() {
            return Err(match serde_json::from_slice::<WireError>(&bytes) {
                Ok(wire) => wire.into(),
                Err(_) => CoordError::Connection(format!(
                    "{} /coord/{op} answered {status}: {}",
                    self.address,
                    String::from_utf8_lossy(&bytes)
                )),
            });
        }
        serde_json::from_slice(&bytes).map_err(|e| CoordError::Deserialize(e.to_string()))
    }

    async fn send(&self, op: &str, body: Vec<u8>) -> CoordResult<(http::StatusCode, Bytes)> {
        let uri = format!("http://{}/coord/{op}", self.address);
        let transport =
            |reason: String| CoordError::Connection(format!("{}: {reason}", self.address));

        let stream = tokio::net::TcpStream::connect(&self.address)
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
            .method(http::Method::POST)
            .uri(&uri)
            .header("host", &self.address)
            .header("content-type", "application/json")
            .header("user-agent", "fleetgrid-coord/0.1")
            .body(Full::new(Bytes::from(body)))
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
        debug!(op, %status, "coordination call");
        Ok((status, bytes))
    }
}

fn path_request(path: &str) -> PathRequest {
    PathRequest {
        path: path.to_string(),
    }
}
