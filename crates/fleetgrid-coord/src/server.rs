//! Coordination service: serves one [`LocalStore`] to every manager over
//! JSON/HTTP.
//!
//! Remote sessions are leases. A client opens one, heartbeats it, and
//! closes it on the way out; a session that misses heartbeats for longer
//! than the session timeout is reaped and its ephemeral nodes (locks and
//! liveness markers included) go with it.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/coord/get` | Node bytes |
//! | POST | `/coord/exists` | Node presence |
//! | POST | `/coord/children` | Sorted child names |
//! | POST | `/coord/set` | Replace, optionally create |
//! | POST | `/coord/create` | Atomic create-if-absent |
//! | POST | `/coord/ensure` | Create path if missing |
//! | POST | `/coord/delete` | Delete a leaf |
//! | POST | `/coord/recursive-delete` | Delete a subtree |
//! | POST | `/coord/zxid` | Current change id |
//! | POST | `/coord/wait` | Long-poll for a change after an id |
//! | POST | `/coord/sessions/open` | Open a session lease |
//! | POST | `/coord/sessions/heartbeat` | Renew a lease |
//! | POST | `/coord/sessions/close` | Close a session |

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{CoordError, CoordResult};
use crate::local::LocalStore;
use crate::path;
use crate::wire::{self, *};

/// Sessions without a heartbeat for this long are expired.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on one `/coord/wait` long-poll.
pub const MAX_WAIT: Duration = Duration::from_secs(30);

/// Session leases over a shared [`LocalStore`].
pub struct CoordService {
    store: LocalStore,
    leases: Mutex<HashMap<u64, Instant>>,
    session_timeout: Duration,
}

impl CoordService {
    pub fn new(store: LocalStore) -> Self {
        Self {
            store,
            leases: Mutex::new(HashMap::new()),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<u64, Instant>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open_session(&self) -> u64 {
        let id = self.store.open_session();
        self.leases().insert(id, Instant::now());
        info!(session = id, "remote session opened");
        id
    }

    /// Renew a lease. Fails once the session has been closed or reaped.
    pub fn heartbeat(&self, id: u64) -> CoordResult<()> {
        let mut leases = self.leases();
        match leases.get_mut(&id) {
            Some(seen) if self.store.session_alive(id) => {
                *seen = Instant::now();
                debug!(session = id, "heartbeat received");
                Ok(())
            }
            _ => {
                leases.remove(&id);
                warn!(session = id, "heartbeat for unknown session");
                Err(CoordError::SessionClosed(id))
            }
        }
    }

    pub fn close_session(&self, id: u64) {
        self.leases().remove(&id);
        self.store.expire_session(id);
        info!(session = id, "remote session closed");
    }

    /// Expire every lease older than the session timeout.
    pub fn reap_expired_sessions(&self) -> Vec<u64> {
        let expired: Vec<u64> = {
            let mut leases = self.leases();
            let expired: Vec<u64> = leases
                .iter()
                .filter(|(_, seen)| seen.elapsed() > self.session_timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                leases.remove(id);
            }
            expired
        };
        for id in &expired {
            self.store.expire_session(*id);
            warn!(session = id, "reaped expired session");
        }
        expired
    }
}

/// Reap expired sessions every `interval` until `shutdown` flips.
pub async fn run_reaper(
    service: Arc<CoordService>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(?interval, "session reaper starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                service.reap_expired_sessions();
            }
            _ = shutdown.changed() => {
                debug!("session reaper shutting down");
                break;
            }
        }
    }
}

/// Build the `/coord/*` routes over `service`.
pub fn routes(service: Arc<CoordService>) -> Router {
    Router::new()
        .route("/coord/get", post(get))
        .route("/coord/exists", post(exists))
        .route("/coord/children", post(children))
        .route("/coord/set", post(set))
        .route("/coord/create", post(create))
        .route("/coord/ensure", post(ensure))
        .route("/coord/delete", post(delete))
        .route("/coord/recursive-delete", post(recursive_delete))
        .route("/coord/zxid", post(zxid))
        .route("/coord/wait", post(wait))
        .route("/coord/sessions/open", post(open_session))
        .route("/coord/sessions/heartbeat", post(heartbeat))
        .route("/coord/sessions/close", post(close_session))
        .with_state(service)
}

// ── Handlers ───────────────────────────────────────────────────────

/// A [`CoordError`] rendered as an HTTP reply.
pub struct WireReply(CoordError);

impl From<CoordError> for WireReply {
    fn from(e: CoordError) -> Self {
        Self(e)
    }
}

impl IntoResponse for WireReply {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoordError::NotFound(_) => StatusCode::NOT_FOUND,
            CoordError::NodeExists(_) | CoordError::NotEmpty(_) => StatusCode::CONFLICT,
            CoordError::InvalidPath { .. } | CoordError::Deserialize(_) => StatusCode::BAD_REQUEST,
            CoordError::SessionClosed(_) => StatusCode::GONE,
            CoordError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoordError::LockTimeout(_) | CoordError::Serialize(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(WireError::from(self.0))).into_response()
    }
}

type Reply<T> = Result<Json<T>, WireReply>;

async fn get(State(svc): State<Arc<CoordService>>, Json(req): Json<PathRequest>) -> Reply<DataReply> {
    let data = svc.store.get(&req.path)?;
    Ok(Json(DataReply {
        data: wire::encode(&data),
    }))
}

async fn exists(
    State(svc): State<Arc<CoordService>>,
    Json(req): Json<PathRequest>,
) -> Reply<ExistsReply> {
    Ok(Json(ExistsReply {
        exists: svc.store.exists(&req.path)?,
    }))
}

async fn children(
    State(svc): State<Arc<CoordService>>,
    Json(req): Json<PathRequest>,
) -> Reply<ChildrenReply> {
    Ok(Json(ChildrenReply {
        children: svc.store.children(&req.path)?,
    }))
}

async fn set(State(svc): State<Arc<CoordService>>, Json(req): Json<SetRequest>) -> Reply<Empty> {
    let data = wire::decode(&req.data)?;
    svc.store.set(&req.path, &data, req.create_if_absent)?;
    Ok(Json(Empty {}))
}

async fn create(
    State(svc): State<Arc<CoordService>>,
    Json(req): Json<CreateRequest>,
) -> Reply<CreatedReply> {
    let data = wire::decode(&req.data)?;
    let path = svc.store.create(&req.path, &data, req.kind)?;
    Ok(Json(CreatedReply { path }))
}

async fn ensure(State(svc): State<Arc<CoordService>>, Json(req): Json<PathRequest>) -> Reply<Empty> {
    svc.store.ensure_path(&req.path)?;
    Ok(Json(Empty {}))
}

async fn delete(State(svc): State<Arc<CoordService>>, Json(req): Json<PathRequest>) -> Reply<Empty> {
    svc.store.delete(&req.path)?;
    Ok(Json(Empty {}))
}

async fn recursive_delete(
    State(svc): State<Arc<CoordService>>,
    Json(req): Json<PathRequest>,
) -> Reply<Empty> {
    svc.store.recursive_delete(&req.path)?;
    Ok(Json(Empty {}))
}

async fn zxid(State(svc): State<Arc<CoordService>>) -> Reply<ZxidReply> {
    Ok(Json(ZxidReply {
        zxid: svc.store.zxid(),
    }))
}

async fn wait(State(svc): State<Arc<CoordService>>, Json(req): Json<WaitRequest>) -> Reply<WaitReply> {
    path::validate(&req.path)?;
    let wait = Duration::from_millis(req.wait_ms).min(MAX_WAIT);
    let reply = match tokio::time::timeout(wait, svc.store.wait_change(&req.path, req.since)).await
    {
        Ok(zxid) => WaitReply { fired: true, zxid },
        Err(_) => WaitReply {
            fired: false,
            zxid: req.since,
        },
    };
    Ok(Json(reply))
}

async fn open_session(State(svc): State<Arc<CoordService>>) -> Reply<SessionReply> {
    let session = svc.open_session();
    Ok(Json(SessionReply {
        session,
        timeout_ms: u64::try_from(svc.session_timeout.as_millis()).unwrap_or(u64::MAX),
    }))
}

async fn heartbeat(
    State(svc): State<Arc<CoordService>>,
    Json(req): Json<SessionRequest>,
) -> Reply<Empty> {
    svc.heartbeat(req.session)?;
    Ok(Json(Empty {}))
}

async fn close_session(
    State(svc): State<Arc<CoordService>>,
    Json(req): Json<SessionRequest>,
) -> Reply<Empty> {
    svc.close_session(req.session);
    Ok(Json(Empty {}))
}

#[cfg(test)]
mod tests {
    use crate::local::NodeKind;

    use super::*;

    fn service(timeout: Duration) -> CoordService {
        CoordService::new(LocalStore::open_in_memory().unwrap()).with_session_timeout(timeout)
    }

    #[test]
    fn heartbeat_keeps_a_lease_alive() {
        let svc = service(Duration::from_secs(60));
        let id = svc.open_session();
        svc.heartbeat(id).unwrap();
        assert!(svc.reap_expired_sessions().is_empty());
        assert!(svc.store().session_alive(id));
    }

    #[test]
    fn silent_sessions_are_reaped_with_their_ephemerals() {
        let svc = service(Duration::from_millis(10));
        let id = svc.open_session();
        svc.store()
            .create("/live/m1", b"", NodeKind::Ephemeral(id))
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(svc.reap_expired_sessions(), vec![id]);
        assert!(!svc.store().exists("/live/m1").unwrap());
        assert!(matches!(
            svc.heartbeat(id).unwrap_err(),
            CoordError::SessionClosed(s) if s == id
        ));
    }

    #[test]
    fn closed_session_cannot_heartbeat() {
        let svc = service(Duration::from_secs(60));
        let id = svc.open_session();
        svc.close_session(id);
        assert!(svc.heartbeat(id).is_err());
    }
}
