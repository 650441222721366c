use axum::extract::{Path, Query, State};
use axum::http::header::{LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

use super::{
    clear_other_defaults, data_access, enforce_view_invariants, find_active_by_slug,
    is_reserved_slug, sections, view_visibility, Access, Principal, Visibility, COLLECTION,
};
use crate::auth::{bearer_token, Owner};
use crate::errors::AppError;
use crate::share;
use crate::state::AppState;
use crate::store::{Filter, Record, StoreView};

pub const SHARE_COOKIE: &str = "me_share_token";
/// Header carrying a password-access token issued by the password check.
/// `Authorization: Bearer` is accepted too and preferred.
pub const PASSWORD_TOKEN_HEADER: &str = "x-password-token";
const PASSWORD_TOKEN_TTL_HOURS: i64 = 1;
const SHARE_COOKIE_DEFAULT_DAYS: i64 = 30;

#[derive(Debug, Deserialize)]
pub struct AccessQuery {
    /// Legacy share-token handoff kept for old links.
    pub token: Option<String>,
}

/// Resolves the caller's standing against one specific view. Strongest
/// credential wins; an invalid credential degrades to anonymous rather
/// than erroring.
async fn resolve_principal(
    state: &AppState,
    store: &StoreView,
    headers: &HeaderMap,
    jar: &CookieJar,
    query_token: Option<&str>,
    view: &Record,
) -> Principal {
    if let Some(token) = bearer_token(headers) {
        if state.vault.validate_owner_jwt(token).is_some() {
            return Principal::Owner;
        }
        if state.vault.validate_view_access_jwt(token).as_deref() == Some(view.id.as_str()) {
            return Principal::PasswordToken;
        }
    }

    if let Some(token) = headers.get(PASSWORD_TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        if state.vault.validate_view_access_jwt(token).as_deref() == Some(view.id.as_str()) {
            return Principal::PasswordToken;
        }
    }

    let share_token = jar
        .get(SHARE_COOKIE)
        .map(|c| c.value().to_string())
        .or_else(|| {
            headers
                .get("x-share-token")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .or_else(|| query_token.map(str::to_string));
    if let Some(raw) = share_token {
        if share::grants_access(store, &state.vault, &raw, &view.id).await {
            return Principal::ShareToken;
        }
    }

    Principal::Anonymous
}

/// GET /api/view/{slug}/access
///
/// Returns only the fields the public shell needs to decide what to render.
pub async fn access(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(slug): Path<String>,
    Query(query): Query<AccessQuery>,
) -> Result<Json<Value>, AppError> {
    let store = state.view_for(&headers);
    let Some(view) = find_active_by_slug(&store, &slug).await? else {
        return Err(AppError::view_not_found());
    };

    let visibility = view_visibility(&view);
    let query_token = query.token.as_deref().filter(|t| !t.is_empty());
    let principal = resolve_principal(&state, &store, &headers, &jar, query_token, &view).await;
    if data_access(visibility, principal) == Access::NotFound {
        return Err(AppError::view_not_found());
    }

    Ok(Json(json!({
        "id": view.id,
        "slug": view.get_str("slug"),
        "visibility": visibility.as_str(),
        "requires_password": visibility == Visibility::Password,
        "requires_token": visibility == Visibility::Unlisted,
    })))
}

/// GET /api/view/{slug}/data
pub async fn data(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(slug): Path<String>,
    Query(query): Query<AccessQuery>,
) -> Result<Json<Value>, AppError> {
    let store = state.view_for(&headers);
    let Some(view) = find_active_by_slug(&store, &slug).await? else {
        return Err(AppError::view_not_found());
    };

    let visibility = view_visibility(&view);
    let query_token = query.token.as_deref().filter(|t| !t.is_empty());
    let principal = resolve_principal(&state, &store, &headers, &jar, query_token, &view).await;
    match data_access(visibility, principal) {
        Access::NotFound => Err(AppError::view_not_found()),
        Access::PasswordPrompt => Ok(Json(json!({
            "id": view.id,
            "slug": view.get_str("slug"),
            "name": view.get_str("name"),
            "visibility": visibility.as_str(),
            "requires_password": true,
        }))),
        Access::Full => {
            let mut envelope = Map::new();
            envelope.insert("id".into(), Value::String(view.id.clone()));
            for field in ["slug", "name", "visibility"] {
                envelope.insert(field.into(), Value::String(view.get_str(field).into()));
            }
            for field in ["hero_headline", "hero_summary", "cta_text", "cta_url"] {
                let value = view.get_str(field);
                if !value.is_empty() {
                    envelope.insert(field.into(), Value::String(value.into()));
                }
            }

            let section_configs = sections::parse_sections(view.data.get("sections"));
            let assembled = sections::assemble(&store, &section_configs).await?;
            envelope.insert("sections".into(), Value::Array(assembled));

            super::bump_view_count(store, view.id.clone());
            Ok(Json(Value::Object(envelope)))
        }
    }
}

/// GET /api/default-view
pub async fn default_view(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let store = state.view_for(&headers);
    let candidate = match store
        .find_first(
            COLLECTION,
            Filter::new()
                .eq("is_default", true)
                .eq("is_active", true)
                .eq("visibility", "public"),
        )
        .await?
    {
        Some(view) => Some(view),
        None => {
            store
                .find_first(
                    COLLECTION,
                    Filter::new()
                        .eq("is_active", true)
                        .eq("visibility", "public")
                        .sort_asc("created"),
                )
                .await?
        }
    };

    match candidate {
        Some(view) => Ok(Json(json!({
            "fallback": false,
            "id": view.id,
            "slug": view.get_str("slug"),
            "name": view.get_str("name"),
        }))),
        None => Ok(Json(json!({"fallback": true}))),
    }
}

#[derive(Debug, Deserialize)]
pub struct PasswordCheckRequest {
    pub view_id: String,
    pub password: String,
}

/// POST /api/password/check
///
/// Always 200; a wrong password, unknown view, and non-password view all
/// produce the identical invalid body.
pub async fn password_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PasswordCheckRequest>,
) -> Result<Json<Value>, AppError> {
    let store = state.view_for(&headers);
    let invalid = json!({"valid": false, "error": "invalid password"});

    let Some(view) = store.get(COLLECTION, &req.view_id).await? else {
        return Ok(Json(invalid));
    };
    let hash = view.get_str("password_hash");
    if !view.get_bool("is_active")
        || view_visibility(&view) != Visibility::Password
        || hash.is_empty()
        || !state.vault.check_password(&req.password, hash)
    {
        return Ok(Json(invalid));
    }

    let (token, expires_at) = state
        .vault
        .issue_view_access_jwt(&view.id, chrono::Duration::hours(PASSWORD_TOKEN_TTL_HOURS))?;
    Ok(Json(json!({
        "valid": true,
        "token": token,
        "expires_at": expires_at,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PasswordSetRequest {
    pub view_id: String,
    pub password: String,
}

/// POST /api/password/set
pub async fn password_set(
    State(state): State<AppState>,
    _owner: Owner,
    headers: HeaderMap,
    Json(req): Json<PasswordSetRequest>,
) -> Result<Json<Value>, AppError> {
    let store = state.view_for(&headers);
    let Some(mut view) = store.get(COLLECTION, &req.view_id).await? else {
        return Err(AppError::NotFound("view not found".into()));
    };

    if req.password.is_empty() {
        if view_visibility(&view) == Visibility::Password {
            return Err(AppError::Validation(
                "password-protected views require a password".into(),
            ));
        }
        view.set("password_hash", "");
    } else {
        let hash = state.vault.hash_password(&req.password)?;
        view.set("password_hash", hash);
    }
    store.update(&view).await?;
    info!(view_id = %view.id, "View password updated");
    Ok(Json(json!({"ok": true})))
}

/// Hashes a plaintext `password` field into `password_hash` and drops the
/// plaintext before anything is persisted.
fn absorb_password(
    state: &AppState,
    data: &mut Map<String, Value>,
) -> Result<(), AppError> {
    if let Some(Value::String(password)) = data.remove("password") {
        if !password.is_empty() {
            let hash = state.vault.hash_password(&password)?;
            data.insert("password_hash".into(), Value::String(hash));
        }
    }
    Ok(())
}

fn serialize_view(view: &Record) -> Value {
    sections::serialize_record(view, None, &[])
}

/// POST /api/views
pub async fn create_view(
    State(state): State<AppState>,
    _owner: Owner,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let Value::Object(mut data) = body else {
        return Err(AppError::Validation("expected a JSON object".into()));
    };
    absorb_password(&state, &mut data)?;

    data.entry("visibility").or_insert_with(|| json!("public"));
    data.entry("is_active").or_insert_with(|| json!(true));
    data.entry("is_default").or_insert_with(|| json!(false));
    data.entry("sections").or_insert_with(|| json!([]));
    data.insert("view_count".into(), json!(0));

    enforce_view_invariants(&mut data)?;

    let store = state.view_for(&headers);
    if find_active_by_slug(&store, data.get("slug").and_then(Value::as_str).unwrap_or(""))
        .await?
        .is_some()
    {
        return Err(AppError::Validation("slug is already in use".into()));
    }

    let record = store.insert(COLLECTION, data).await?;
    if record.get_bool("is_default") {
        clear_other_defaults(&store, &record.id).await?;
    }
    info!(view_id = %record.id, slug = %record.get_str("slug"), "View created");
    Ok((StatusCode::CREATED, Json(serialize_view(&record))))
}

/// PATCH /api/views/{id}
pub async fn update_view(
    State(state): State<AppState>,
    _owner: Owner,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let Value::Object(mut patch) = body else {
        return Err(AppError::Validation("expected a JSON object".into()));
    };
    absorb_password(&state, &mut patch)?;

    let store = state.view_for(&headers);
    let Some(mut view) = store.get(COLLECTION, &id).await? else {
        return Err(AppError::NotFound("view not found".into()));
    };

    for (key, value) in patch {
        view.data.insert(key, value);
    }
    enforce_view_invariants(&mut view.data)?;

    store.update(&view).await?;
    if view.get_bool("is_default") {
        clear_other_defaults(&store, &view.id).await?;
    }
    info!(view_id = %view.id, "View updated");
    Ok(Json(serialize_view(&view)))
}

fn neutral_not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
}

fn redirect_with_cookie(
    slug: &str,
    raw_token: &str,
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
) -> Response {
    // The cookie lives as long as the token does, or 30 days for tokens
    // without an expiry.
    let max_age_s = expires_at
        .map(|t| (t - chrono::Utc::now()).num_seconds().max(0))
        .unwrap_or(SHARE_COOKIE_DEFAULT_DAYS * 24 * 3600);
    let cookie = Cookie::build((SHARE_COOKIE, raw_token.to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(max_age_s))
        .build();
    (
        StatusCode::FOUND,
        [
            (LOCATION, format!("/{slug}")),
            (SET_COOKIE, cookie.to_string()),
        ],
    )
        .into_response()
}

/// GET /s/{token}
///
/// Moves the raw token out of the URL and into an httpOnly cookie so it
/// never reaches browser history or Referer headers.
pub async fn share_handoff(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<Response, AppError> {
    let store = state.view_for(&headers);
    match share::validate(&store, &state.vault, &token).await? {
        Some(valid) => Ok(redirect_with_cookie(&valid.view_slug, &token, valid.expires_at)),
        None => Ok(neutral_not_found()),
    }
}

/// GET /v/{slug}, the legacy path shape.
pub async fn legacy_redirect(Path(slug): Path<String>) -> Response {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(LOCATION, format!("/{slug}"))],
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct SlugQuery {
    pub t: Option<String>,
}

/// GET /{slug}
///
/// Only the legacy `?t=` token handoff is served here; rendering belongs to
/// the frontend. Reserved slugs are refused before any lookup.
pub async fn slug_entry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(slug): Path<String>,
    Query(query): Query<SlugQuery>,
) -> Result<Response, AppError> {
    if is_reserved_slug(&slug) {
        return Ok(neutral_not_found());
    }

    if let Some(token) = query.t.filter(|t| !t.is_empty()) {
        let store = state.view_for(&headers);
        return match share::validate(&store, &state.vault, &token).await? {
            Some(valid) => Ok(redirect_with_cookie(&valid.view_slug, &token, valid.expires_at)),
            None => Ok(neutral_not_found()),
        };
    }

    Ok(neutral_not_found())
}
