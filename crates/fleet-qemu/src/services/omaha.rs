//! Update-check responder.
//!
//! Guests are pointed here so their update client never reaches a real
//! update server mid-test. Every check is answered with "no update"; the
//! ping count lets tests assert that the client is alive.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use tracing::debug;

use super::{ServiceHandle, serve_http};
use crate::netns::NetNs;

pub const UPDATE_PATH: &str = "/v1/update/";

#[derive(Debug, Default)]
pub struct OmahaResponder {
    pings: AtomicU64,
}

impl OmahaResponder {
    pub fn ping_count(&self) -> u64 {
        self.pings.load(Ordering::Relaxed)
    }
}

fn attribute<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{name}=\"");
    let start = xml.find(&needle)? + needle.len();
    let rest = xml.get(start..)?;
    rest.find('"').and_then(|end| rest.get(..end))
}

fn noupdate_response(appid: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <response protocol=\"3.0\" server=\"fleet\">\
         <daystart elapsed_seconds=\"0\"></daystart>\
         <app appid=\"{appid}\" status=\"ok\">\
         <updatecheck status=\"noupdate\"></updatecheck>\
         <ping status=\"ok\"></ping>\
         </app></response>"
    )
}

async fn update_check(State(responder): State<Arc<OmahaResponder>>, body: String) -> impl IntoResponse {
    let count = responder.pings.fetch_add(1, Ordering::Relaxed) + 1;
    let appid = attribute(&body, "appid").unwrap_or_default();
    debug!(appid, count, "update check");
    ([(header::CONTENT_TYPE, "text/xml")], noupdate_response(appid))
}

pub(crate) fn router(responder: Arc<OmahaResponder>) -> Router {
    Router::new()
        .route(UPDATE_PATH, post(update_check))
        .with_state(responder)
}

/// Serve a fresh responder on `addr` inside `ns`.
pub async fn start_omaha(
    ns: &Arc<NetNs>,
    addr: SocketAddr,
) -> fleet::Result<(ServiceHandle, Arc<OmahaResponder>)> {
    let responder = Arc::new(OmahaResponder::default());
    let handle = serve_http(ns, "omaha", addr, router(Arc::clone(&responder))).await?;
    Ok((handle, responder))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;

    const REQUEST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<request protocol="3.0" version="update_engine-0.4.10">
 <app appid="{e96281a6-d1af-4bde-9a0a-97b76e56dc57}" version="3815.2.0" track="stable">
  <updatecheck></updatecheck>
 </app>
</request>"#;

    #[test]
    fn extracts_attribute() {
        assert_eq!(
            attribute(REQUEST, "appid"),
            Some("{e96281a6-d1af-4bde-9a0a-97b76e56dc57}")
        );
        assert_eq!(attribute(REQUEST, "missing"), None);
    }

    #[tokio::test]
    async fn answers_noupdate_and_counts() {
        let responder = Arc::new(OmahaResponder::default());
        let app = router(Arc::clone(&responder));
        for _ in 0..2 {
            let req = Request::builder()
                .method("POST")
                .uri(UPDATE_PATH)
                .body(Body::from(REQUEST))
                .unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            let text = String::from_utf8(bytes.to_vec()).unwrap();
            assert!(text.contains("<updatecheck status=\"noupdate\">"));
            assert!(text.contains("{e96281a6-d1af-4bde-9a0a-97b76e56dc57}"));
        }
        assert_eq!(responder.ping_count(), 2);
    }
}
