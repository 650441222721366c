//! View access gate: slug rules, the visibility matrix, and the
//! single-default invariant.
//!
//! Unauthorized access to any non-public view is reported as 404 with the
//! same body as an unknown slug. Status codes must never reveal that an
//! unlisted, password, or private view exists.

pub mod handlers;
pub mod sections;

use serde_json::Value;
use std::str::FromStr;
use tracing::warn;

use crate::errors::AppError;
use crate::store::{Filter, Record, StoreView};

pub const COLLECTION: &str = "views";

/// Path segments that would collide with system routes. Checked
/// case-insensitively both at the router and at every persistence write.
pub const RESERVED_SLUGS: &[&str] = &[
    "admin", "api", "s", "v", "_app", "_", "assets", "static", "favicon.ico",
    "robots.txt", "sitemap.xml", "health", "healthz", "ready", "login",
    "logout", "auth", "oauth", "callback", "home", "index", "default",
    "profile",
];

pub fn is_reserved_slug(slug: &str) -> bool {
    RESERVED_SLUGS
        .iter()
        .any(|r| r.eq_ignore_ascii_case(slug))
}

/// Slug pattern: leading alphanumeric, then up to 99 of [A-Za-z0-9_-].
pub fn validate_slug(slug: &str) -> Result<(), AppError> {
    let mut chars = slug.chars();
    let valid_shape = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            slug.len() <= 100
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        _ => false,
    };
    if !valid_shape {
        return Err(AppError::Validation(
            "slug must start with a letter or digit and contain only letters, digits, '_' or '-'".into(),
        ));
    }
    if is_reserved_slug(slug) {
        return Err(AppError::Validation(format!("slug '{slug}' is reserved")));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Unlisted,
    Password,
    Private,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Unlisted => "unlisted",
            Visibility::Password => "password",
            Visibility::Private => "private",
        }
    }
}

impl FromStr for Visibility {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, AppError> {
        match s {
            "public" => Ok(Visibility::Public),
            "unlisted" => Ok(Visibility::Unlisted),
            "password" => Ok(Visibility::Password),
            "private" => Ok(Visibility::Private),
            other => Err(AppError::Validation(format!("unknown visibility '{other}'"))),
        }
    }
}

/// Who is asking, already resolved against this specific view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    Anonymous,
    /// Carries a share token valid for this view.
    ShareToken,
    /// Carries a password-access token valid for this view.
    PasswordToken,
    Owner,
}

/// Outcome of the visibility matrix for one (visibility, principal) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Full,
    /// 200 with a password-prompt indicator instead of content.
    PasswordPrompt,
    /// Indistinguishable from an unknown slug.
    NotFound,
}

pub fn data_access(visibility: Visibility, principal: Principal) -> Access {
    match (visibility, principal) {
        (_, Principal::Owner) => Access::Full,
        (Visibility::Public, _) => Access::Full,
        (Visibility::Unlisted, Principal::ShareToken | Principal::PasswordToken) => Access::Full,
        (Visibility::Unlisted, Principal::Anonymous) => Access::NotFound,
        (Visibility::Password, Principal::PasswordToken) => Access::Full,
        (Visibility::Password, _) => Access::PasswordPrompt,
        (Visibility::Private, _) => Access::NotFound,
    }
}

pub fn view_visibility(view: &Record) -> Visibility {
    view.get_str("visibility").parse().unwrap_or(Visibility::Private)
}

pub async fn find_active_by_slug(
    store: &StoreView,
    slug: &str,
) -> Result<Option<Record>, AppError> {
    Ok(store
        .find_first(
            COLLECTION,
            Filter::new().eq("slug", slug).eq("is_active", true),
        )
        .await?)
}

/// Clears `is_default` on every view except `keep_id`. Called in the same
/// write path that sets the flag, so at most one view ever holds it.
pub async fn clear_other_defaults(store: &StoreView, keep_id: &str) -> Result<(), AppError> {
    let defaults = store
        .list(COLLECTION, &Filter::new().eq("is_default", true))
        .await?;
    for mut view in defaults {
        if view.id != keep_id {
            view.set("is_default", false);
            store.update(&view).await?;
        }
    }
    Ok(())
}

/// Validates the fields of a view create or update. `password` is the
/// optional plaintext from the request, already hashed by the caller.
pub fn enforce_view_invariants(data: &mut serde_json::Map<String, Value>) -> Result<(), AppError> {
    let slug = data.get("slug").and_then(Value::as_str).unwrap_or("");
    validate_slug(slug)?;

    let visibility: Visibility = data
        .get("visibility")
        .and_then(Value::as_str)
        .unwrap_or("public")
        .parse()?;
    data.insert("visibility".into(), Value::String(visibility.as_str().into()));

    if visibility == Visibility::Password
        && data
            .get("password_hash")
            .and_then(Value::as_str)
            .unwrap_or("")
            .is_empty()
    {
        return Err(AppError::Validation(
            "password-protected views require a password".into(),
        ));
    }

    if data.get("is_default").and_then(Value::as_bool).unwrap_or(false)
        && visibility != Visibility::Public
    {
        return Err(AppError::Validation(
            "only public views can be the default".into(),
        ));
    }
    Ok(())
}

/// Fire-and-forget analytics bump. A store failure here must never fail the
/// request that triggered it.
pub fn bump_view_count(store: StoreView, view_id: String) {
    tokio::spawn(async move {
        let result = async {
            let Some(mut view) = store.get(COLLECTION, &view_id).await? else {
                return Ok::<_, crate::store::StoreError>(());
            };
            view.set("view_count", view.get_i64("view_count") + 1);
            view.set_now("last_viewed_at");
            store.update(&view).await
        }
        .await;
        if let Err(e) = result {
            warn!(%view_id, "Failed to record view analytics: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_validation() {
        assert!(validate_slug("recruiter").is_ok());
        assert!(validate_slug("My-View_2").is_ok());
        assert!(validate_slug("9lives").is_ok());

        assert!(validate_slug("").is_err());
        assert!(validate_slug("-leading-dash").is_err());
        assert!(validate_slug("has space").is_err());
        assert!(validate_slug(&"a".repeat(101)).is_err());
        assert!(validate_slug(&"a".repeat(100)).is_ok());
    }

    #[test]
    fn test_reserved_slugs_are_case_insensitive() {
        assert!(validate_slug("admin").is_err());
        assert!(validate_slug("Admin").is_err());
        assert!(validate_slug("HEALTH").is_err());
        assert!(validate_slug("robots.txt").is_err());
        assert!(validate_slug("administrator").is_ok());
    }

    #[test]
    fn test_visibility_matrix() {
        use Access::*;
        use Principal::*;
        use Visibility::*;

        assert_eq!(data_access(Public, Anonymous), Full);
        assert_eq!(data_access(Public, ShareToken), Full);

        assert_eq!(data_access(Unlisted, Anonymous), NotFound);
        assert_eq!(data_access(Unlisted, ShareToken), Full);
        assert_eq!(data_access(Unlisted, PasswordToken), Full);
        assert_eq!(data_access(Unlisted, Owner), Full);

        assert_eq!(data_access(Password, Anonymous), PasswordPrompt);
        assert_eq!(data_access(Password, ShareToken), PasswordPrompt);
        assert_eq!(data_access(Password, PasswordToken), Full);
        assert_eq!(data_access(Password, Owner), Full);

        assert_eq!(data_access(Private, Anonymous), NotFound);
        assert_eq!(data_access(Private, ShareToken), NotFound);
        assert_eq!(data_access(Private, PasswordToken), NotFound);
        assert_eq!(data_access(Private, Owner), Full);
    }

    #[test]
    fn test_invariants_reject_password_view_without_hash() {
        let mut data = serde_json::json!({"slug": "locked", "visibility": "password"})
            .as_object()
            .cloned()
            .unwrap();
        assert!(enforce_view_invariants(&mut data).is_err());

        data.insert("password_hash".into(), Value::String("$2b$12$x".into()));
        assert!(enforce_view_invariants(&mut data).is_ok());
    }

    #[test]
    fn test_invariants_reject_non_public_default() {
        let mut data = serde_json::json!({
            "slug": "x", "visibility": "unlisted", "is_default": true
        })
        .as_object()
        .cloned()
        .unwrap();
        assert!(enforce_view_invariants(&mut data).is_err());

        data.insert("visibility".into(), Value::String("public".into()));
        assert!(enforce_view_invariants(&mut data).is_ok());
    }
}
