//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks DB connectivity and blob pool I/O

use crate::services::storage_service::StorageService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// `GET /healthz`
///
/// Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Runs `SELECT 1` against SQLite and a write/read/remove round trip on
/// every blob pool. HTTP 200 when all checks pass, 503 otherwise.
pub async fn readyz(State(service): State<StorageService>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let sqlite = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*service.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };
    checks.insert("sqlite".to_string(), sqlite);

    for pool in service.registry.pool_names() {
        checks.insert(format!("pool:{}", pool), probe_pool(&service, pool).await);
    }

    let overall_ok = checks.values().all(|c| c.ok);
    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn probe_pool(service: &StorageService, pool: &str) -> CheckStatus {
    let handle = match service.registry.open(pool) {
        Ok(handle) => handle,
        Err(e) => return CheckStatus::failed(e.to_string()),
    };
    let part = format!(".readyz-{}", Uuid::new_v4().simple());
    if let Err(e) = handle.write(&part, 0, b"readyz").await {
        return CheckStatus::failed(format!("could not write probe: {}", e));
    }
    let read = handle.read(&part, 0, 6).await;
    let removed = handle.remove(&part).await;
    match (read, removed) {
        (Ok(bytes), Ok(())) if &bytes[..] == b"readyz" => CheckStatus::ok(),
        (Ok(_), Err(e)) => CheckStatus::failed(format!("could not remove probe: {}", e)),
        (Ok(_), Ok(())) => CheckStatus::failed("probe content mismatch".into()),
        (Err(e), _) => CheckStatus::failed(format!("could not read probe: {}", e)),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: BTreeMap<String, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self { ok: true, error: None }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
