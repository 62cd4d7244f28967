//! `GET /log?seek=sec&follow=bool` — NDJSON stream from the in-process
//! record ring.

use axum::body::Body;
use axum::http::{header, HeaderValue, Method};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;

use kvmd_server::{ndjson_line, ApiMeta, ApiResult, EndpointMeta};
use kvmd_validators::{valid_bool, valid_log_seek};

use super::{Ctx, Params};

pub fn router(meta: &mut ApiMeta) -> Router<Ctx> {
    meta.register(Method::GET, "/log", EndpointMeta::default());
    Router::new().route("/log", get(log))
}

async fn log(axum::extract::State(state): axum::extract::State<Ctx>, Params(params): Params) -> ApiResult {
    let seek = match params.get("seek") {
        Some(raw) => valid_log_seek(raw)?,
        None => 0,
    };
    let follow = match params.get("follow") {
        Some(raw) => valid_bool(raw)?,
        None => false,
    };

    let backlog = state.logring.backlog(seek);
    let mut live = follow.then(|| state.logring.follow());

    let stream = async_stream::stream! {
        for record in backlog {
            yield Ok::<Bytes, std::io::Error>(Bytes::from(ndjson_line(true, &record)));
        }
        if let Some(live) = live.as_mut() {
            loop {
                match live.recv().await {
                    Ok(record) => {
                        yield Ok(Bytes::from(ndjson_line(true, &record)));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    };

    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    Ok(response)
}
