//! A small etcd-v2-shaped key/value store for guests that need to
//! rendezvous (cluster discovery, locks in tests).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;

use super::{ServiceHandle, serve_http};
use crate::netns::NetNs;

/// Keys start with `/`; values carry the index of their last write.
#[derive(Debug, Default)]
pub struct KvStore {
    inner: RwLock<KvInner>,
}

#[derive(Debug, Default)]
struct KvInner {
    index: u64,
    entries: BTreeMap<String, (String, u64)>,
}

impl KvStore {
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner
            .read()
            .entries
            .get(&normalize(key))
            .map(|(v, _)| v.clone())
    }

    /// Store `value`, returning the previous value and the new index.
    pub fn set(&self, key: &str, value: String) -> (Option<String>, u64) {
        let mut inner = self.inner.write();
        inner.index += 1;
        let index = inner.index;
        let prev = inner.entries.insert(normalize(key), (value, index));
        (prev.map(|(v, _)| v), index)
    }

    pub fn delete(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.write();
        let removed = inner.entries.remove(&normalize(key));
        if removed.is_some() {
            inner.index += 1;
        }
        removed.map(|(v, _)| v)
    }
}

fn normalize(key: &str) -> String {
    format!("/{}", key.trim_matches('/'))
}

#[derive(Debug, Deserialize)]
struct SetParams {
    value: String,
}

pub(crate) fn router(store: Arc<KvStore>) -> Router {
    Router::new()
        .route("/v2/keys/{*key}", get(get_key).put(put_key).delete(delete_key))
        .with_state(store)
}

fn not_found(key: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "errorCode": 100, "message": "Key not found", "cause": normalize(key) })),
    )
        .into_response()
}

async fn get_key(State(store): State<Arc<KvStore>>, Path(key): Path<String>) -> Response {
    let inner = store.inner.read();
    match inner.entries.get(&normalize(&key)) {
        Some((value, index)) => Json(json!({
            "action": "get",
            "node": { "key": normalize(&key), "value": value, "modifiedIndex": index },
        }))
        .into_response(),
        None => not_found(&key),
    }
}

async fn put_key(
    State(store): State<Arc<KvStore>>,
    Path(key): Path<String>,
    Form(params): Form<SetParams>,
) -> Response {
    let (prev, index) = store.set(&key, params.value.clone());
    let node = json!({ "key": normalize(&key), "value": params.value, "modifiedIndex": index });
    match prev {
        Some(prev) => Json(json!({
            "action": "set",
            "node": node,
            "prevNode": { "key": normalize(&key), "value": prev },
        }))
        .into_response(),
        None => (StatusCode::CREATED, Json(json!({ "action": "set", "node": node }))).into_response(),
    }
}

async fn delete_key(State(store): State<Arc<KvStore>>, Path(key): Path<String>) -> Response {
    match store.delete(&key) {
        Some(prev) => Json(json!({
            "action": "delete",
            "node": { "key": normalize(&key) },
            "prevNode": { "key": normalize(&key), "value": prev },
        }))
        .into_response(),
        None => not_found(&key),
    }
}

/// Serve a fresh store on `addr` inside `ns`.
pub async fn start_kv(
    ns: &Arc<NetNs>,
    addr: SocketAddr,
) -> fleet::Result<(ServiceHandle, Arc<KvStore>)> {
    let store = Arc::new(KvStore::default());
    let handle = serve_http(ns, "kv", addr, router(Arc::clone(&store))).await?;
    Ok((handle, store))
}
