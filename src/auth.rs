//! Passwordless login bound to the caller's session id.
//!
//! A magic link is only valid in the session that requested it, only once,
//! and only until it expires. Tokens are stored as SHA-256 digests.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::app::{finalize_transaction, App};
use crate::entities::{login_session, magic_link, user};
use crate::error::AppError;
use crate::model::OAuthProvider;

pub const MAGIC_LINK_CALLBACK_PATH: &str = "/auth/magiclink/callback";
const DEFAULT_REDIRECT: &str = "/";

#[derive(Debug)]
pub struct IssuedMagicLink {
    pub email: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl IssuedMagicLink {
    pub fn callback_path(&self) -> String {
        format!("{MAGIC_LINK_CALLBACK_PATH}?token={}", self.token)
    }
}

#[derive(Debug)]
pub struct LoginOutcome {
    pub user: user::Model,
    pub redirect_to: String,
    pub created: bool,
}

impl App {
    /// Remembers where to send the user after the next successful login.
    pub async fn remember_return_to(&self, path: &str) -> Result<String, AppError> {
        let path = validate_return_to(path)?;
        let existing = self.login_session_with_conn(&self.db).await?;
        let now = Utc::now();
        match existing {
            Some(session) => {
                let mut active: login_session::ActiveModel = session.into();
                active.return_to = Set(Some(path.clone()));
                active.updated_at = Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = login_session::ActiveModel {
                    session_id: Set(self.session_id.clone()),
                    user_id: Set(None),
                    return_to: Set(Some(path.clone())),
                    updated_at: Set(now),
                    ..Default::default()
                };
                login_session::Entity::insert(active).exec(&self.db).await?;
            }
        }
        Ok(path)
    }

    pub async fn request_magic_link(&self, email: &str) -> Result<IssuedMagicLink, AppError> {
        let email = normalize_email(email)?;
        let token = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let expires_at = now.checked_add_signed(self.magic_link_ttl).ok_or_else(|| {
            AppError::InvalidInput("magic link ttl is out of range".to_string())
        })?;
        let active = magic_link::ActiveModel {
            token_hash: Set(hash_token(&token)),
            email: Set(email.clone()),
            session_id: Set(self.session_id.clone()),
            created_at: Set(now),
            expires_at: Set(expires_at),
            consumed_at: Set(None),
            ..Default::default()
        };
        magic_link::Entity::insert(active).exec(&self.db).await?;
        tracing::info!(email = %email, %expires_at, "magic link issued");
        Ok(IssuedMagicLink {
            email,
            token,
            expires_at,
        })
    }

    pub async fn consume_magic_link(&self, token: &str) -> Result<LoginOutcome, AppError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::InvalidInput("magic link token is empty".to_string()));
        }

        let txn = self.db.begin().await?;
        let result: Result<LoginOutcome, AppError> = async {
            let now = Utc::now();
            let link = magic_link::Entity::find()
                .filter(magic_link::Column::TokenHash.eq(hash_token(token)))
                .one(&txn)
                .await?;
            let Some(link) = link else {
                return Err(rejected("magic link is invalid"));
            };
            if link.consumed_at.is_some() {
                return Err(rejected("magic link has already been used"));
            }
            if link.session_id != self.session_id {
                return Err(rejected("magic link was requested in a different session"));
            }
            if link.expires_at <= now {
                return Err(rejected("magic link has expired"));
            }

            let email = link.email.clone();
            let mut active: magic_link::ActiveModel = link.into();
            active.consumed_at = Set(Some(now));
            active.update(&txn).await?;

            let (user, created) = find_or_create_user(&txn, &email).await?;
            let redirect_to = self.log_in_with_conn(&txn, &user).await?;
            Ok(LoginOutcome {
                user,
                redirect_to,
                created,
            })
        }
        .await;

        let outcome = finalize_transaction(txn, result).await?;
        tracing::info!(user_id = outcome.user.id, "logged in with magic link");
        Ok(outcome)
    }

    /// Completes a login whose identity was already verified by the provider.
    pub async fn login_with_oauth(
        &self,
        provider: OAuthProvider,
        email: &str,
    ) -> Result<LoginOutcome, AppError> {
        let email = normalize_email(email)?;
        let txn = self.db.begin().await?;
        let result: Result<LoginOutcome, AppError> = async {
            let (user, created) = find_or_create_user(&txn, &email).await?;
            let redirect_to = self.log_in_with_conn(&txn, &user).await?;
            Ok(LoginOutcome {
                user,
                redirect_to,
                created,
            })
        }
        .await;

        let outcome = finalize_transaction(txn, result).await?;
        tracing::info!(
            user_id = outcome.user.id,
            provider = provider.as_str(),
            "logged in with oauth"
        );
        Ok(outcome)
    }

    pub async fn current_user(&self) -> Result<Option<user::Model>, AppError> {
        self.current_user_with_conn(&self.db).await
    }

    /// Returns whether a user was logged in.
    pub async fn logout(&self) -> Result<bool, AppError> {
        let Some(session) = self.login_session_with_conn(&self.db).await? else {
            return Ok(false);
        };
        let was_logged_in = session.user_id.is_some();
        let mut active: login_session::ActiveModel = session.into();
        active.user_id = Set(None);
        active.updated_at = Set(Utc::now());
        active.update(&self.db).await?;
        Ok(was_logged_in)
    }

    pub(crate) async fn require_user_with_conn<C: ConnectionTrait>(
        &self,
        db: &C,
    ) -> Result<user::Model, AppError> {
        self.current_user_with_conn(db).await?.ok_or_else(|| {
            AppError::Unauthorized(format!("no user is logged in for session {}", self.session_id))
        })
    }

    async fn current_user_with_conn<C: ConnectionTrait>(
        &self,
        db: &C,
    ) -> Result<Option<user::Model>, AppError> {
        let Some(session) = self.login_session_with_conn(db).await? else {
            return Ok(None);
        };
        let Some(user_id) = session.user_id else {
            return Ok(None);
        };
        Ok(user::Entity::find_by_id(user_id).one(db).await?)
    }

    async fn login_session_with_conn<C: ConnectionTrait>(
        &self,
        db: &C,
    ) -> Result<Option<login_session::Model>, AppError> {
        Ok(login_session::Entity::find()
            .filter(login_session::Column::SessionId.eq(self.session_id.as_str()))
            .one(db)
            .await?)
    }

    /// Binds the session to `user` and returns the redirect target, clearing
    /// the remembered one.
    async fn log_in_with_conn<C: ConnectionTrait>(
        &self,
        db: &C,
        user: &user::Model,
    ) -> Result<String, AppError> {
        let now = Utc::now();
        match self.login_session_with_conn(db).await? {
            Some(session) => {
                let redirect_to = session
                    .return_to
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REDIRECT.to_string());
                let mut active: login_session::ActiveModel = session.into();
                active.user_id = Set(Some(user.id));
                active.return_to = Set(None);
                active.updated_at = Set(now);
                active.update(db).await?;
                Ok(redirect_to)
            }
            None => {
                let active = login_session::ActiveModel {
                    session_id: Set(self.session_id.clone()),
                    user_id: Set(Some(user.id)),
                    return_to: Set(None),
                    updated_at: Set(now),
                    ..Default::default()
                };
                login_session::Entity::insert(active).exec(db).await?;
                Ok(DEFAULT_REDIRECT.to_string())
            }
        }
    }
}

async fn find_or_create_user<C: ConnectionTrait>(
    db: &C,
    email: &str,
) -> Result<(user::Model, bool), AppError> {
    if let Some(existing) = user::Entity::find()
        .filter(user::Column::Email.eq(email))
        .one(db)
        .await?
    {
        return Ok((existing, false));
    }
    let now = Utc::now();
    let active = user::ActiveModel {
        email: Set(email.to_string()),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    let insert = user::Entity::insert(active).exec(db).await?;
    let created = user::Entity::find_by_id(insert.last_insert_id)
        .one(db)
        .await?
        .ok_or_else(|| AppError::NotFound("user not found after insert".to_string()))?;
    tracing::info!(user_id = created.id, "user created");
    Ok((created, true))
}

fn rejected(message: &str) -> AppError {
    tracing::warn!(reason = message, "magic link rejected");
    AppError::InvalidInput(message.to_string())
}

pub fn normalize_email(raw: &str) -> Result<String, AppError> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !valid {
        return Err(AppError::InvalidInput(format!(
            "invalid email address '{}'",
            raw.trim()
        )));
    }
    Ok(email)
}

/// Only local absolute paths are accepted so a login cannot redirect off-site.
pub fn validate_return_to(path: &str) -> Result<String, AppError> {
    let path = path.trim();
    if !path.starts_with('/') || path.starts_with("//") {
        return Err(AppError::InvalidInput(format!(
            "return path must be a local path starting with '/': '{path}'"
        )));
    }
    Ok(path.to_string())
}

fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tests::{open_app, setup_app, setup_app_in_session};
    use chrono::Duration;
    use tempfile::TempDir;

    #[test]
    fn normalize_email_lowercases_and_trims() {
        assert_eq!(
            normalize_email("  Foo@Bar.COM ").expect("email"),
            "foo@bar.com"
        );
        assert!(normalize_email("foo").is_err());
        assert!(normalize_email("@bar.com").is_err());
        assert!(normalize_email("foo@").is_err());
        assert!(normalize_email("fo o@bar.com").is_err());
    }

    #[test]
    fn return_to_must_be_local() {
        assert_eq!(validate_return_to("/journeys/3").expect("path"), "/journeys/3");
        assert!(validate_return_to("https://evil.example").is_err());
        assert!(validate_return_to("//evil.example").is_err());
    }

    #[test]
    fn token_hash_is_hex_sha256() {
        let hash = hash_token("abc");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn magic_link_logs_in_and_redirects_back() {
        let (_dir, app) = setup_app().await;
        app.remember_return_to("/journeys/1").await.expect("return to");
        let link = app
            .request_magic_link("Foo@Bar.com")
            .await
            .expect("request link");
        assert_eq!(link.email, "foo@bar.com");
        assert!(link.callback_path().starts_with("/auth/magiclink/callback?token="));

        let outcome = app.consume_magic_link(&link.token).await.expect("consume");
        assert!(outcome.created);
        assert_eq!(outcome.user.email, "foo@bar.com");
        assert_eq!(outcome.redirect_to, "/journeys/1");

        let current = app.current_user().await.expect("current").expect("user");
        assert_eq!(current.id, outcome.user.id);
    }

    #[tokio::test]
    async fn magic_link_without_return_path_redirects_home() {
        let (_dir, app) = setup_app().await;
        let link = app.request_magic_link("foo@bar.com").await.expect("link");
        let outcome = app.consume_magic_link(&link.token).await.expect("consume");
        assert_eq!(outcome.redirect_to, "/");
    }

    #[tokio::test]
    async fn magic_link_is_single_use() {
        let (_dir, app) = setup_app().await;
        let link = app.request_magic_link("foo@bar.com").await.expect("link");
        app.consume_magic_link(&link.token).await.expect("first use");
        let err = app.consume_magic_link(&link.token).await.err().expect("second use");
        assert!(err.to_string().contains("already been used"));
    }

    #[tokio::test]
    async fn magic_link_from_other_session_is_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let requester = open_app(&dir, "session-a").await;
        let other = open_app(&dir, "session-b").await;

        let link = requester
            .request_magic_link("foo@bar.com")
            .await
            .expect("link");
        let err = other.consume_magic_link(&link.token).await.err().expect("rejected");
        assert!(err.to_string().contains("different session"));
        assert!(other.current_user().await.expect("current").is_none());

        // The failed attempt does not burn the token.
        requester
            .consume_magic_link(&link.token)
            .await
            .expect("original session");
    }

    #[tokio::test]
    async fn expired_magic_link_is_rejected() {
        let (_dir, app) = setup_app().await;
        let link = app.request_magic_link("foo@bar.com").await.expect("link");
        magic_link::Entity::update_many()
            .col_expr(
                magic_link::Column::ExpiresAt,
                sea_orm::sea_query::Expr::value(Utc::now() - Duration::minutes(1)),
            )
            .exec(&app.db)
            .await
            .expect("expire");
        let err = app.consume_magic_link(&link.token).await.err().expect("expired");
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn unrepresentable_expiry_is_rejected() {
        let (_dir, app) = setup_app().await;
        let app = app.with_magic_link_ttl(Duration::minutes(1_000_000_000_000));
        let err = app.request_magic_link("foo@bar.com").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        let stored = magic_link::Entity::find().all(&app.db).await.expect("links");
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let (_dir, app) = setup_app().await;
        let err = app.consume_magic_link("nope").await.err().expect("unknown");
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn returning_user_is_matched_case_insensitively() {
        let (_dir, app) = setup_app_in_session("s1").await;
        let first = app
            .login_with_oauth(OAuthProvider::Google, "foo@bar.com")
            .await
            .expect("oauth");
        assert!(first.created);
        app.logout().await.expect("logout");

        let link = app.request_magic_link("FOO@bar.com").await.expect("link");
        let second = app.consume_magic_link(&link.token).await.expect("consume");
        assert!(!second.created);
        assert_eq!(first.user.id, second.user.id);
    }

    #[tokio::test]
    async fn logout_clears_current_user() {
        let (_dir, app) = setup_app().await;
        assert!(!app.logout().await.expect("logout without session"));
        app.login_with_oauth(OAuthProvider::Google, "foo@bar.com")
            .await
            .expect("oauth");
        assert!(app.logout().await.expect("logout"));
        assert!(app.current_user().await.expect("current").is_none());
        let err = app.require_user_with_conn(&app.db).await.err().expect("required");
        assert!(matches!(err, AppError::Unauthorized(_)));
    }
}
