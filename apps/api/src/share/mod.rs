//! Share-token issuance, validation, and revocation.
//!
//! Raw tokens are returned to the owner exactly once; only a keyed HMAC and
//! a short lookup prefix are persisted. Validation is deliberately non-leaky:
//! every failure mode produces the same response shape so callers cannot
//! probe which tokens exist.

pub mod handlers;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::errors::AppError;
use crate::store::{Filter, Record, StoreView};
use crate::vault::Vault;

pub const COLLECTION: &str = "share_tokens";
pub const TOKEN_BYTES: usize = 32;
pub const TOKEN_PREFIX_LEN: usize = 12;

pub struct IssuedToken {
    pub id: String,
    /// The raw token. Never persisted; shown to the owner exactly once.
    pub token: String,
    pub name: String,
}

pub struct ValidatedToken {
    pub view_id: String,
    pub view_slug: String,
    pub expires_at: Option<chrono::DateTime<Utc>>,
}

/// Creates a share token for an existing view and persists its HMAC.
pub async fn issue(
    store: &StoreView,
    vault: &Vault,
    view_id: &str,
    name: Option<String>,
    expires_at: Option<chrono::DateTime<Utc>>,
    max_uses: Option<i64>,
) -> Result<IssuedToken, AppError> {
    let view = store
        .get("views", view_id)
        .await?
        .ok_or_else(|| AppError::Validation("view does not exist".into()))?;

    let raw = vault.random_token(TOKEN_BYTES);
    let prefix: String = raw.chars().take(TOKEN_PREFIX_LEN).collect();
    let name = name.unwrap_or_else(|| format!("Share link for {}", view.get_str("slug")));

    let data = json!({
        "view_id": view.id,
        "token_hash": vault.hmac_token(&raw),
        "token_prefix": prefix,
        "name": name,
        "is_active": true,
        "use_count": 0,
        "max_uses": max_uses.unwrap_or(0),
        "expires_at": expires_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        "last_used_at": "",
    });
    let Value::Object(data) = data else {
        return Err(AppError::Internal(anyhow::anyhow!("token payload not an object")));
    };
    let record = store.insert(COLLECTION, data).await?;

    Ok(IssuedToken {
        id: record.id,
        token: raw,
        name,
    })
}

/// Validates a raw token. `Ok(None)` means "invalid" for any reason; the
/// caller must not expose which one.
pub async fn validate(
    store: &StoreView,
    vault: &Vault,
    raw: &str,
) -> Result<Option<ValidatedToken>, AppError> {
    if raw.is_empty() {
        return Ok(None);
    }

    // Tokens issued before the prefix column existed have no prefix; always
    // scan those rows too, since a legacy token may share a prefix with a
    // newer one.
    let prefix: String = raw.chars().take(TOKEN_PREFIX_LEN).collect();
    let filters = [
        Filter::new().eq("is_active", true).eq("token_prefix", prefix),
        Filter::new().eq("is_active", true).empty("token_prefix"),
    ];
    let mut matched = None;
    for filter in &filters {
        let candidates = store.list(COLLECTION, filter).await?;
        if let Some(record) = candidates
            .into_iter()
            .find(|r| vault.verify_token(raw, r.get_str("token_hash")))
        {
            matched = Some(record);
            break;
        }
    }
    let Some(mut record) = matched else {
        return Ok(None);
    };

    if let Some(expires_at) = record.get_datetime("expires_at") {
        if expires_at <= Utc::now() {
            return Ok(None);
        }
    }
    let max_uses = record.get_i64("max_uses");
    if max_uses > 0 && record.get_i64("use_count") >= max_uses {
        return Ok(None);
    }

    let Some(view) = store.get("views", record.get_str("view_id")).await? else {
        return Ok(None);
    };
    if !view.get_bool("is_active") {
        return Ok(None);
    }

    let expires_at = record.get_datetime("expires_at");
    record.set("use_count", record.get_i64("use_count") + 1);
    record.set_now("last_used_at");
    store.update(&record).await?;

    let view_slug = view.get_str("slug").to_string();
    Ok(Some(ValidatedToken {
        view_id: view.id,
        view_slug,
        expires_at,
    }))
}

/// Marks a token inactive. Tokens are never hard-deleted; the row keeps its
/// use history.
pub async fn revoke(store: &StoreView, token_id: &str) -> Result<(), AppError> {
    let Some(mut record) = store.get(COLLECTION, token_id).await? else {
        return Err(AppError::NotFound("share token not found".into()));
    };
    record.set("is_active", false);
    store.update(&record).await?;
    Ok(())
}

/// Checks whether a raw token from a cookie or header grants access to one
/// specific view. Read-only; does not consume a use.
pub async fn grants_access(store: &StoreView, vault: &Vault, raw: &str, view_id: &str) -> bool {
    if raw.is_empty() {
        return false;
    }
    let prefix: String = raw.chars().take(TOKEN_PREFIX_LEN).collect();
    let filters = [
        Filter::new().eq("is_active", true).eq("token_prefix", prefix),
        Filter::new().eq("is_active", true).empty("token_prefix"),
    ];
    for filter in filters {
        let candidates = match store.list(COLLECTION, &filter).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Share token lookup failed: {e}");
                return false;
            }
        };
        if let Some(record) = candidates
            .into_iter()
            .find(|r| vault.verify_token(raw, r.get_str("token_hash")))
        {
            return token_usable(&record) && record.get_str("view_id") == view_id;
        }
    }
    false
}

fn token_usable(record: &Record) -> bool {
    if let Some(expires_at) = record.get_datetime("expires_at") {
        if expires_at <= Utc::now() {
            return false;
        }
    }
    let max_uses = record.get_i64("max_uses");
    max_uses == 0 || record.get_i64("use_count") < max_uses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::Duration;
    use std::sync::Arc;

    async fn setup() -> (StoreView, Vault, String) {
        let store = StoreView::new(Arc::new(MemoryStore::new()), false);
        let vault = Vault::new("test-secret");
        let view = store
            .insert(
                "views",
                json!({"slug": "recruiter", "is_active": true})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await
            .unwrap();
        (store, vault, view.id)
    }

    #[tokio::test]
    async fn test_issue_persists_hmac_not_raw() {
        let (store, vault, view_id) = setup().await;
        let issued = issue(&store, &vault, &view_id, None, None, None).await.unwrap();
        assert_eq!(issued.token.len(), 43);

        let record = store.get(COLLECTION, &issued.id).await.unwrap().unwrap();
        assert_ne!(record.get_str("token_hash"), issued.token);
        assert_eq!(record.get_str("token_prefix"), &issued.token[..12]);
        assert!(record.get_bool("is_active"));
    }

    #[tokio::test]
    async fn test_validate_happy_path_counts_use() {
        let (store, vault, view_id) = setup().await;
        let issued = issue(&store, &vault, &view_id, None, None, None).await.unwrap();

        let result = validate(&store, &vault, &issued.token).await.unwrap().unwrap();
        assert_eq!(result.view_id, view_id);
        assert_eq!(result.view_slug, "recruiter");

        let record = store.get(COLLECTION, &issued.id).await.unwrap().unwrap();
        assert_eq!(record.get_i64("use_count"), 1);
        assert!(!record.get_str("last_used_at").is_empty());
    }

    #[tokio::test]
    async fn test_validate_rejects_unknown_revoked_expired_exhausted() {
        let (store, vault, view_id) = setup().await;

        assert!(validate(&store, &vault, "no-such-token-aaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
            .await
            .unwrap()
            .is_none());

        let revoked = issue(&store, &vault, &view_id, None, None, None).await.unwrap();
        revoke(&store, &revoked.id).await.unwrap();
        assert!(validate(&store, &vault, &revoked.token).await.unwrap().is_none());

        let expired = issue(
            &store,
            &vault,
            &view_id,
            None,
            Some(Utc::now() - Duration::hours(1)),
            None,
        )
        .await
        .unwrap();
        assert!(validate(&store, &vault, &expired.token).await.unwrap().is_none());

        let capped = issue(&store, &vault, &view_id, None, None, Some(1)).await.unwrap();
        assert!(validate(&store, &vault, &capped.token).await.unwrap().is_some());
        assert!(validate(&store, &vault, &capped.token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_validate_rejects_inactive_view() {
        let (store, vault, view_id) = setup().await;
        let issued = issue(&store, &vault, &view_id, None, None, None).await.unwrap();

        let mut view = store.get("views", &view_id).await.unwrap().unwrap();
        view.set("is_active", false);
        store.update(&view).await.unwrap();

        assert!(validate(&store, &vault, &issued.token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_legacy_token_without_prefix_validates() {
        let (store, vault, view_id) = setup().await;
        let raw = vault.random_token(TOKEN_BYTES);
        store
            .insert(
                COLLECTION,
                json!({
                    "view_id": view_id,
                    "token_hash": vault.hmac_token(&raw),
                    "name": "legacy",
                    "is_active": true,
                    "use_count": 0,
                    "max_uses": 0,
                })
                .as_object()
                .cloned()
                .unwrap(),
            )
            .await
            .unwrap();

        let result = validate(&store, &vault, &raw).await.unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn test_legacy_token_validates_despite_prefix_collision() {
        let (store, vault, view_id) = setup().await;
        let raw = vault.random_token(TOKEN_BYTES);
        // A newer token occupies the legacy token's prefix slot.
        store
            .insert(
                COLLECTION,
                json!({
                    "view_id": view_id,
                    "token_hash": vault.hmac_token("a-different-token"),
                    "token_prefix": &raw[..TOKEN_PREFIX_LEN],
                    "is_active": true,
                    "use_count": 0,
                    "max_uses": 0,
                })
                .as_object()
                .cloned()
                .unwrap(),
            )
            .await
            .unwrap();
        store
            .insert(
                COLLECTION,
                json!({
                    "view_id": view_id,
                    "token_hash": vault.hmac_token(&raw),
                    "name": "legacy",
                    "is_active": true,
                    "use_count": 0,
                    "max_uses": 0,
                })
                .as_object()
                .cloned()
                .unwrap(),
            )
            .await
            .unwrap();

        let result = validate(&store, &vault, &raw).await.unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn test_grants_access_is_view_scoped_and_read_only() {
        let (store, vault, view_id) = setup().await;
        let issued = issue(&store, &vault, &view_id, None, None, None).await.unwrap();

        assert!(grants_access(&store, &vault, &issued.token, &view_id).await);
        assert!(!grants_access(&store, &vault, &issued.token, "other-view").await);
        assert!(!grants_access(&store, &vault, "", &view_id).await);

        let record = store.get(COLLECTION, &issued.id).await.unwrap().unwrap();
        assert_eq!(record.get_i64("use_count"), 0);
    }

    #[tokio::test]
    async fn test_forged_suffixes_never_validate() {
        let (store, vault, view_id) = setup().await;
        let issued = issue(&store, &vault, &view_id, None, None, None).await.unwrap();
        let prefix = &issued.token[..TOKEN_PREFIX_LEN];

        for i in 0..100 {
            let forged = format!("{prefix}{:0>31}", i);
            assert!(validate(&store, &vault, &forged).await.unwrap().is_none());
        }
        assert!(validate(&store, &vault, &issued.token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_issue_rejects_missing_view() {
        let (store, vault, _) = setup().await;
        let err = issue(&store, &vault, "missing", None, None, None).await;
        assert!(err.is_err());
    }
}
