//! HTTP surface.
//!
//! Every endpoint answers with a [`Reply`] envelope. Internal endpoints used
//! between members require the [`INNER_AUTH_HEADER`] token; administrative
//! endpoints accept either that token or an admin user. The acting user is
//! read from the [`USER_HEADER`] header set by the fronting gateway.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use raft_store::forward::{
    CLUSTER_PATH, ClusterCommand, ClusterOp, INNER_AUTH_HEADER, Reply, WRITE_PATH, WriteOp,
    WriteRequest,
};
use raft_store::{ClusterState, KvStore};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::codec::FlatMap;
use crate::connection::{ConnectionRegistry, SessionSettings, run_session};
use crate::diff::NamespaceDiff;
use crate::error::ConfigError;
use crate::instance::{InstanceService, Registration, ServiceInstance};
use crate::keys::NamespaceId;
use crate::namespace::{
    ConfigService, HistoryRecord, NamespaceContent, NamespaceSummary, ReleaseOutcome,
};
use crate::permission::{AccessControl, AppAccess, Role};
use crate::propagation::{ConfigChange, LISTEN_PATH, Propagator};

pub const USER_HEADER: &str = "x-user";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn KvStore>,
    pub configs: Arc<ConfigService>,
    pub instances: Arc<InstanceService>,
    pub registry: Arc<ConnectionRegistry>,
    pub propagator: Propagator,
    pub access: Arc<AccessControl>,
    pub inner_token: String,
    pub session: SessionSettings,
}

type ApiResult<T> = Result<Json<Reply<T>>, ConfigError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(Reply::ok(data)))
}

fn done() -> ApiResult<()> {
    Ok(Json(Reply::done()))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(|| async { "pong" }))
        .route(WRITE_PATH, post(store_write).get(store_get))
        .route("/api/store/scan", get(store_scan))
        .route(CLUSTER_PATH, post(cluster_change))
        .route("/api/raft/info", get(raft_info))
        .route(LISTEN_PATH, post(accept_change))
        .route("/api/cfg/:app/:group", get(list_namespaces))
        .route(
            "/api/cfg/:app/:group/:namespace",
            post(create_namespace)
                .get(namespace_content)
                .put(edit_namespace)
                .delete(remove_namespace),
        )
        .route("/api/cfg/:app/:group/:namespace/draft", delete(discard_draft))
        .route("/api/cfg/:app/:group/:namespace/release", post(release_namespace))
        .route("/api/cfg/:app/:group/:namespace/history", get(namespace_history))
        .route("/api/app/:app/access", get(get_access).put(put_access))
        .route("/api/client/config", post(client_config))
        .route("/api/svc/instances", post(service_instances))
        .route("/api/svc/register", post(register_instance))
        .route("/api/ws", get(subscribe))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn subject(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

fn has_inner_token(state: &AppState, headers: &HeaderMap) -> bool {
    !state.inner_token.is_empty()
        && headers
            .get(INNER_AUTH_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|token| token.eq_ignore_ascii_case(&state.inner_token))
}

fn require_inner(state: &AppState, headers: &HeaderMap) -> Result<(), ConfigError> {
    if has_inner_token(state, headers) {
        Ok(())
    } else {
        Err(ConfigError::Unauthorized)
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ConfigError> {
    if has_inner_token(state, headers) {
        return Ok(());
    }
    let user = subject(headers);
    if user.is_empty() {
        Err(ConfigError::Unauthorized)
    } else if state.access.is_admin(&user) {
        Ok(())
    } else {
        Err(ConfigError::Forbidden("admin".into()))
    }
}

fn require_role(
    state: &AppState,
    headers: &HeaderMap,
    role: Role,
    app_id: &str,
) -> Result<String, ConfigError> {
    let user = subject(headers);
    state.access.check(&user, role, app_id)?;
    Ok(user)
}

// Internal store and cluster endpoints.

async fn store_write(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<WriteRequest>,
) -> ApiResult<()> {
    require_inner(&state, &headers)?;
    match request.cmd {
        WriteOp::Set | WriteOp::Setex => {
            state
                .store
                .set(&request.key, &request.value, request.ttl())
                .await?
        }
        WriteOp::Del => state.store.delete(&request.key).await?,
    }
    done()
}

#[derive(Debug, Deserialize)]
struct KeyQuery {
    key: String,
}

async fn store_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
) -> ApiResult<String> {
    require_admin(&state, &headers)?;
    ok(state.store.get(&query.key)?)
}

#[derive(Debug, Deserialize)]
struct PrefixQuery {
    #[serde(default)]
    prefix: String,
}

async fn store_scan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PrefixQuery>,
) -> ApiResult<BTreeMap<String, String>> {
    require_admin(&state, &headers)?;
    ok(state.store.scan_prefix(&query.prefix)?)
}

async fn cluster_change(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(command): Json<ClusterCommand>,
) -> ApiResult<()> {
    require_inner(&state, &headers)?;
    info!(cmd = ?command.cmd, node = command.node_id, addr = %command.addr, "membership request");
    match command.cmd {
        ClusterOp::Join => state.store.join(command.node_id, &command.addr).await?,
        ClusterOp::Remove => state.store.remove(command.node_id, &command.addr).await?,
    }
    done()
}

async fn raft_info(State(state): State<AppState>) -> ApiResult<ClusterState> {
    ok(state.store.cluster_state())
}

async fn accept_change(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(change): Json<ConfigChange>,
) -> ApiResult<()> {
    require_inner(&state, &headers)?;
    state.propagator.accept_change(&change);
    done()
}

// Namespace administration.

async fn list_namespaces(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app, group)): Path<(String, String)>,
) -> ApiResult<Vec<NamespaceSummary>> {
    require_role(&state, &headers, Role::Viewer, &app)?;
    ok(state.configs.list(&app, &group)?)
}

async fn create_namespace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app, group, namespace)): Path<(String, String, String)>,
) -> ApiResult<()> {
    let id = NamespaceId::new(&app, &group, &namespace)?;
    require_role(&state, &headers, Role::Developer, &app)?;
    state.configs.create(&id).await?;
    done()
}

async fn namespace_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app, group, namespace)): Path<(String, String, String)>,
) -> ApiResult<NamespaceContent> {
    let id = NamespaceId::new(&app, &group, &namespace)?;
    require_role(&state, &headers, Role::Viewer, &app)?;
    ok(state.configs.content(&id)?)
}

#[derive(Debug, Deserialize)]
struct EditBody {
    content: String,
}

async fn edit_namespace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app, group, namespace)): Path<(String, String, String)>,
    Json(body): Json<EditBody>,
) -> ApiResult<()> {
    let id = NamespaceId::new(&app, &group, &namespace)?;
    require_role(&state, &headers, Role::Developer, &app)?;
    state.configs.edit(&id, &body.content).await?;
    done()
}

async fn remove_namespace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app, group, namespace)): Path<(String, String, String)>,
) -> ApiResult<()> {
    let id = NamespaceId::new(&app, &group, &namespace)?;
    require_role(&state, &headers, Role::Owner, &app)?;
    state.configs.remove(&id).await?;
    done()
}

async fn discard_draft(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app, group, namespace)): Path<(String, String, String)>,
) -> ApiResult<()> {
    let id = NamespaceId::new(&app, &group, &namespace)?;
    require_role(&state, &headers, Role::Developer, &app)?;
    state.configs.discard(&id).await?;
    done()
}

#[derive(Debug, Serialize)]
struct ReleaseReply {
    released: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    diff: Option<NamespaceDiff>,
}

async fn release_namespace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app, group, namespace)): Path<(String, String, String)>,
) -> ApiResult<ReleaseReply> {
    let id = NamespaceId::new(&app, &group, &namespace)?;
    let user = require_role(&state, &headers, Role::Owner, &app)?;
    let reply = match state.configs.release(&id, &user).await? {
        ReleaseOutcome::Released(diff) => ReleaseReply {
            released: true,
            diff: Some(diff),
        },
        ReleaseOutcome::Unchanged => ReleaseReply {
            released: false,
            diff: None,
        },
    };
    ok(reply)
}

async fn namespace_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app, group, namespace)): Path<(String, String, String)>,
) -> ApiResult<Vec<HistoryRecord>> {
    let id = NamespaceId::new(&app, &group, &namespace)?;
    require_role(&state, &headers, Role::Viewer, &app)?;
    ok(state.configs.history(&id)?)
}

async fn get_access(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(app): Path<String>,
) -> ApiResult<AppAccess> {
    require_role(&state, &headers, Role::Viewer, &app)?;
    ok(state.access.load(&app)?)
}

async fn put_access(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(app): Path<String>,
    Json(access): Json<AppAccess>,
) -> ApiResult<()> {
    require_admin(&state, &headers)?;
    state.access.save(&app, &access).await?;
    done()
}

// Client facing endpoints.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientConfigRequest {
    app_id: String,
    group: String,
    #[serde(default)]
    namespaces: Vec<String>,
}

async fn client_config(
    State(state): State<AppState>,
    Json(request): Json<ClientConfigRequest>,
) -> ApiResult<BTreeMap<String, FlatMap>> {
    ok(state
        .configs
        .client_config(&request.app_id, &request.group, &request.namespaces)?)
}

fn default_group() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstancesRequest {
    app_id: String,
    #[serde(default = "default_group")]
    group: String,
}

async fn service_instances(
    State(state): State<AppState>,
    Json(request): Json<InstancesRequest>,
) -> ApiResult<Vec<ServiceInstance>> {
    ok(state.instances.services(&request.app_id, &request.group)?)
}

async fn register_instance(
    State(state): State<AppState>,
    Json(registration): Json<Registration>,
) -> ApiResult<()> {
    state.instances.register(&registration).await?;
    done()
}

#[derive(Debug, Deserialize)]
struct SubscribeQuery {
    #[serde(default)]
    key: String,
}

async fn subscribe(
    State(state): State<AppState>,
    Query(query): Query<SubscribeQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ConfigError> {
    if query.key.is_empty() {
        return Err(ConfigError::Invalid("connection key".into()));
    }
    Ok(ws.on_upgrade(move |socket| async move {
        let (writer, reader) = socket.split();
        run_session(
            writer,
            reader,
            query.key,
            state.registry,
            state.instances,
            state.session,
        )
        .await;
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use raft_store::MemoryStore;
    use raft_store::forward::inner_token;
    use tokio::sync::watch;
    use tower::ServiceExt;

    use super::*;
    use crate::propagation::{PeerNotifier, PropagationSettings};

    struct NoPeers;

    #[async_trait::async_trait]
    impl PeerNotifier for NoPeers {
        async fn push(&self, _: &str, _: &ConfigChange) -> Result<(), raft_store::StoreError> {
            Ok(())
        }
    }

    fn state() -> (AppState, watch::Sender<bool>) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new(1, "127.0.0.1:9001"));
        let instances = Arc::new(InstanceService::new(store.clone()));
        let registry = Arc::new(ConnectionRegistry::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let propagator = Propagator::new(
            store.clone(),
            instances.clone(),
            registry.clone(),
            Arc::new(NoPeers),
            PropagationSettings::default(),
            stop_rx,
        );
        let state = AppState {
            configs: Arc::new(ConfigService::new(
                store.clone(),
                instances.clone(),
                propagator.clone(),
            )),
            access: Arc::new(AccessControl::new(store.clone(), vec!["root".into()])),
            store,
            instances,
            registry,
            propagator,
            inner_token: inner_token("secret"),
            session: SessionSettings::default(),
        };
        (state, stop_tx)
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> anyhow::Result<(StatusCode, serde_json::Value)> {
        let mut request = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => request.body(Body::empty())?,
        };
        let response = app.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        Ok((status, json))
    }

    #[tokio::test]
    async fn namespace_lifecycle_over_http() -> anyhow::Result<()> {
        let (state, _stop) = state();
        let app = router(state);
        let admin = [(USER_HEADER, "root")];
        let base = "/api/cfg/demo/group/app.props";

        let (status, reply) = call(&app, "POST", base, &admin, None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["code"], "0");

        let (status, reply) = call(&app, "POST", base, &admin, None).await?;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(reply["code"], "409");

        let body = serde_json::json!({ "content": "a=1\nb=2" });
        call(&app, "PUT", base, &admin, Some(body)).await?;
        let (_, reply) = call(&app, "GET", base, &admin, None).await?;
        assert_eq!(reply["data"]["diff"]["added"]["a"], "1");

        let (status, reply) = call(&app, "POST", &format!("{base}/release"), &admin, None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["data"]["released"], true);

        let (_, reply) = call(&app, "GET", &format!("{base}/history"), &admin, None).await?;
        assert_eq!(reply["data"].as_array().map(Vec::len), Some(1));
        assert_eq!(reply["data"][0]["modifiedBy"], "root");

        let (_, reply) = call(&app, "GET", "/api/cfg/demo/group", &admin, None).await?;
        assert_eq!(reply["data"][0]["namespace"], "app.props");
        Ok(())
    }

    #[tokio::test]
    async fn roles_gate_namespace_operations() -> anyhow::Result<()> {
        let (state, _stop) = state();
        let app = router(state);
        let base = "/api/cfg/demo/group/app.yaml";

        let (status, _) = call(&app, "POST", base, &[], None).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let grants = serde_json::json!({ "owners": ["alice"], "viewers": ["carol"] });
        let access = "/api/app/demo/access";
        let carol = [(USER_HEADER, "carol")];
        let (status, _) = call(&app, "PUT", access, &carol, Some(grants.clone())).await?;
        assert_eq!(status, StatusCode::FORBIDDEN);
        call(&app, "PUT", access, &[(USER_HEADER, "root")], Some(grants)).await?;

        let (status, _) = call(&app, "POST", base, &[(USER_HEADER, "carol")], None).await?;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&app, "POST", base, &[(USER_HEADER, "Alice")], None).await?;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "GET", base, &[(USER_HEADER, "carol")], None).await?;
        assert_eq!(status, StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn internal_endpoints_require_the_inner_token() -> anyhow::Result<()> {
        let (state, _stop) = state();
        let store = state.store.clone();
        let app = router(state);
        let write = serde_json::json!({ "cmd": "setex", "key": "k", "value": "v", "exp": 60000 });

        let (status, _) = call(&app, "POST", WRITE_PATH, &[], Some(write.clone())).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = inner_token("secret");
        let auth = [(INNER_AUTH_HEADER, token.as_str())];
        let (status, reply) = call(&app, "POST", WRITE_PATH, &auth, Some(write)).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["code"], "0");
        assert_eq!(store.get("k")?, "v");

        let expired = serde_json::json!({ "cmd": "setex", "key": "gone", "value": "v", "exp": 0 });
        let (status, _) = call(&app, "POST", WRITE_PATH, &auth, Some(expired)).await?;
        assert_eq!(status, StatusCode::OK);
        assert!(store.get("gone").is_err());

        let (_, reply) = call(&app, "GET", "/api/store/scan?prefix=k", &auth, None).await?;
        assert_eq!(reply["data"]["k"], "v");

        let join = serde_json::json!({ "cmd": "join", "nodeId": 2, "addr": "127.0.0.1:9002" });
        call(&app, "POST", CLUSTER_PATH, &auth, Some(join)).await?;
        let (_, reply) = call(&app, "GET", "/api/raft/info", &[], None).await?;
        assert_eq!(reply["data"]["peers"].as_array().map(Vec::len), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn clients_register_and_fetch_config() -> anyhow::Result<()> {
        let (state, _stop) = state();
        let app = router(state);
        let registration = serde_json::json!({
            "appId": "demo", "group": "default", "ip": "10.0.0.5", "port": 8080,
            "state": "UP", "meta": { "zone": "a" }
        });
        let (status, _) = call(&app, "POST", "/api/svc/register", &[], Some(registration)).await?;
        assert_eq!(status, StatusCode::OK);

        let query = serde_json::json!({ "appId": "demo" });
        let (_, reply) = call(&app, "POST", "/api/svc/instances", &[], Some(query)).await?;
        assert_eq!(reply["data"][0]["state"], "UP");
        assert_eq!(reply["data"][0]["meta"]["zone"], "a");

        let admin = [(USER_HEADER, "root")];
        let ns = "/api/cfg/demo/default/app.json";
        let content = serde_json::json!({ "content": "{\"x\":{\"y\":1}}" });
        call(&app, "POST", ns, &admin, None).await?;
        call(&app, "PUT", ns, &admin, Some(content)).await?;
        call(&app, "POST", &format!("{ns}/release"), &admin, None).await?;

        let request = serde_json::json!({
            "appId": "demo",
            "group": "default",
            "namespaces": ["app.json"]
        });
        let (_, reply) = call(&app, "POST", "/api/client/config", &[], Some(request)).await?;
        assert_eq!(reply["data"]["demo.default.app.json"]["x.y"], "1");
        Ok(())
    }
}
