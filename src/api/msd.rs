//! Mass-storage API: state, params, connect, image streaming in both
//! directions (with optional compression on reads and NDJSON progress on
//! remote downloads), removal and reset.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use tokio_util::io::{ReaderStream, StreamReader};

use kvmd_core::ApiError;
use kvmd_server::{json_response, ndjson_error_line, ndjson_line, ApiMeta, ApiResult, EndpointMeta};
use kvmd_validators::{valid_bool, valid_msd_image_name, valid_url};

use super::{Ctx, Params};

pub fn router(meta: &mut ApiMeta) -> Router<Ctx> {
    for (method, path) in [
        (Method::GET, "/msd"),
        (Method::POST, "/msd/set_params"),
        (Method::POST, "/msd/set_connected"),
        (Method::GET, "/msd/read"),
        (Method::POST, "/msd/write"),
        (Method::POST, "/msd/write_remote"),
        (Method::POST, "/msd/remove"),
        (Method::POST, "/msd/reset"),
    ] {
        meta.register(method, path, EndpointMeta::default());
    }
    Router::new()
        .route("/msd", get(state))
        .route("/msd/set_params", post(set_params))
        .route("/msd/set_connected", post(set_connected))
        .route("/msd/read", get(read))
        .route("/msd/write", post(write))
        .route("/msd/write_remote", post(write_remote))
        .route("/msd/remove", post(remove))
        .route("/msd/reset", post(reset))
}

async fn state(State(state): State<Ctx>) -> ApiResult {
    Ok(json_response(&state.msd.get_state().await))
}

async fn set_params(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let name = match params.get("image") {
        Some(raw) if raw.trim().is_empty() => Some(String::new()),
        Some(raw) => Some(valid_msd_image_name(raw)?),
        None => None,
    };
    let cdrom = match params.get("cdrom") {
        Some(raw) => Some(valid_bool(raw)?),
        None => None,
    };
    let rw = match params.get("rw") {
        Some(raw) => Some(valid_bool(raw)?),
        None => None,
    };
    state.msd.set_params(name.as_deref(), cdrom, rw).await?;
    Ok(json_response(&json!({})))
}

async fn set_connected(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let connected = valid_bool(params.get("connected").map(String::as_str).unwrap_or(""))?;
    state.msd.set_connected(connected).await?;
    Ok(json_response(&json!({})))
}

async fn read(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let name = valid_msd_image_name(params.get("image").map(String::as_str).unwrap_or(""))?;
    let compress = params.get("compress").map(String::as_str).unwrap_or("");
    let (suffix, codec) = match compress {
        "" | "none" => ("", None),
        "lzma" => (".xz", Some(Codec::Xz)),
        "zstd" => (".zst", Some(Codec::Zstd)),
        other => {
            return Err(ApiError::Validator(format!("unknown compression mode {other:?}")).into())
        }
    };

    let mut reader = state.msd.read_image(&name).await?;
    let total_size = reader.total_size();

    let raw = async_stream::stream! {
        loop {
            match reader.read_chunk().await {
                Ok(Some(chunk)) => yield Ok::<Bytes, std::io::Error>(Bytes::from(chunk)),
                Ok(None) => return,
                Err(err) => {
                    yield Err(std::io::Error::other(err.to_string()));
                    return;
                }
            }
        }
    };

    let body = match codec {
        None => Body::from_stream(raw),
        Some(Codec::Xz) => {
            let encoder =
                async_compression::tokio::bufread::XzEncoder::new(StreamReader::new(raw));
            Body::from_stream(ReaderStream::new(encoder))
        }
        Some(Codec::Zstd) => {
            let encoder =
                async_compression::tokio::bufread::ZstdEncoder::new(StreamReader::new(raw));
            Body::from_stream(ReaderStream::new(encoder))
        }
    };

    let mut response = Response::new(body);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    let file_name = format!("{}{suffix}", name.rsplit('/').next().unwrap_or(&name));
    let disposition = format!("attachment; filename*=UTF-8''{}", urlencode(&file_name));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        response.headers_mut().insert(header::CONTENT_DISPOSITION, value);
    }
    if codec.is_none() {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(total_size));
    }
    Ok(response)
}

enum Codec {
    Xz,
    Zstd,
}

async fn write(State(state): State<Ctx>, Params(params): Params, request: Request) -> ApiResult {
    let name = prefixed_image_name(&params, params.get("image").map(String::as_str).unwrap_or(""))?;
    let size: u64 = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| ApiError::Validator("missing upload content length".to_owned()))?;
    let remove_incomplete = remove_incomplete_flag(&params)?;

    let mut writer = state
        .msd
        .write_image(&name, size, remove_incomplete.unwrap_or(false))
        .await?;
    let mut body = request.into_body().into_data_stream();
    while let Some(chunk) = body.next().await {
        let chunk =
            chunk.map_err(|err| ApiError::Internal(format!("upload stream error: {err}")))?;
        writer.write_chunk(&chunk).await?;
    }
    let written = writer.commit().await?;
    Ok(json_response(&write_info(&name, size, written)))
}

async fn write_remote(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let url = valid_url(params.get("url").map(String::as_str).unwrap_or(""))?;
    let insecure = match params.get("insecure") {
        Some(raw) => valid_bool(raw)?,
        None => false,
    };
    let remove_incomplete = remove_incomplete_flag(&params)?.unwrap_or(false);

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(insecure)
        .connect_timeout(std::time::Duration::from_secs(10))
        // Big images over slow uplinks: effectively unbounded.
        .read_timeout(std::time::Duration::from_secs(7 * 24 * 3600))
        .build()
        .map_err(|err| ApiError::Internal(format!("can't build HTTP client: {err}")))?;
    let remote = client
        .get(url.clone())
        .send()
        .await
        .map_err(|err| ApiError::Operation(format!("download failed: {err}")))?
        .error_for_status()
        .map_err(|err| ApiError::Operation(format!("download refused: {err}")))?;

    let name = match params.get("image").map(String::as_str).unwrap_or("").trim() {
        "" => url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or("image")
            .to_owned(),
        explicit => explicit.to_owned(),
    };
    let name = prefixed_image_name(&params, &name)?;
    let size = remote.content_length().unwrap_or(0);

    tracing::info!(url = %url, name, size, "downloading image to MSD");
    let mut writer = state.msd.write_image(&name, size, remove_incomplete).await?;

    let progress = async_stream::stream! {
        yield Ok::<Bytes, std::io::Error>(Bytes::from(ndjson_line(true, &write_info(&name, size, 0))));
        let mut stream = remote.bytes_stream();
        let mut written = 0;
        let mut last_report = std::time::Instant::now();
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    match writer.write_chunk(&chunk).await {
                        Ok(total) => written = total,
                        Err(err) => {
                            yield Ok(Bytes::from(ndjson_error_line(&err.into())));
                            return;
                        }
                    }
                    if last_report.elapsed().as_secs() >= 1 {
                        last_report = std::time::Instant::now();
                        yield Ok(Bytes::from(ndjson_line(true, &write_info(&name, size, written))));
                    }
                }
                Some(Err(err)) => {
                    let err = ApiError::Operation(format!("download failed: {err}"));
                    yield Ok(Bytes::from(ndjson_error_line(&err)));
                    return;
                }
                None => break,
            }
        }
        match writer.commit().await {
            Ok(total) => {
                yield Ok(Bytes::from(ndjson_line(true, &write_info(&name, size, total))));
            }
            Err(err) => {
                yield Ok(Bytes::from(ndjson_error_line(&err.into())));
            }
        }
    };

    let mut response = Response::new(Body::from_stream(progress));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    Ok(response)
}

async fn remove(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let name = valid_msd_image_name(params.get("image").map(String::as_str).unwrap_or(""))?;
    state.msd.remove(&name).await?;
    Ok(json_response(&json!({})))
}

async fn reset(State(state): State<Ctx>) -> ApiResult {
    state.msd.reset().await?;
    Ok(json_response(&json!({})))
}

fn prefixed_image_name(
    params: &std::collections::HashMap<String, String>,
    name: &str,
) -> Result<String, ApiError> {
    let prefix = params.get("prefix").map(String::as_str).unwrap_or("");
    Ok(valid_msd_image_name(&format!("{prefix}/{name}"))?)
}

fn remove_incomplete_flag(
    params: &std::collections::HashMap<String, String>,
) -> Result<Option<bool>, ApiError> {
    match params.get("remove_incomplete") {
        Some(raw) => Ok(Some(valid_bool(raw)?)),
        None => Ok(None),
    }
}

fn write_info(name: &str, size: u64, written: u64) -> serde_json::Value {
    json!({"image": {"name": name, "size": size, "written": written}})
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
