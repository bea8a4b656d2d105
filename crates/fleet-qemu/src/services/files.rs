use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::services::ServeDir;

use super::{ServiceHandle, serve_http};
use crate::netns::NetNs;

pub(crate) fn router(root: &Path) -> Router {
    Router::new().fallback_service(ServeDir::new(root))
}

/// Serve `root` read-only over HTTP on `addr` inside `ns`.
pub async fn start_file_server(
    ns: &Arc<NetNs>,
    addr: SocketAddr,
    root: &Path,
) -> fleet::Result<ServiceHandle> {
    serve_http(ns, "files", addr, router(root)).await
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn serves_files_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("payload.txt"), "hello guest").unwrap();
        let app = router(dir.path());

        let req = Request::builder().uri("/payload.txt").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello guest");

        let req = Request::builder().uri("/missing").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
