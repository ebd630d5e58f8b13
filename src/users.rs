//! Admin users, credential hashes, recovery keys and auth tokens.
//!
//! | Bucket | Key | Value |
//! |--------|-----|-------|
//! | `__users` | lowercased email | [`User`] |
//! | `__credentialHashes` | `user_id:kind` | argon2id PHC string |
//! | `__recoveryKeys` | lowercased email | one-time recovery secret |
//!
//! Auth tokens are HS256 JWTs with `{sub: email, exp}` claims, signed with
//! the `client_secret` from the settings record, so rotating the secret
//! logs every session out.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::kv::{KvStore, Txn};
use crate::settings::ConfigCache;

pub const USERS_BUCKET: &str = "__users";
pub const CREDENTIALS_BUCKET: &str = "__credentialHashes";
pub const RECOVERY_BUCKET: &str = "__recoveryKeys";

/// Credential kind for login passwords.
pub const PASSWORD: &str = "password";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialHash {
    user_id: u64,
    kind: String,
    /// PHC string; carries the algorithm, parameters and salt.
    hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

/// User service. Cheap to clone.
#[derive(Clone)]
pub struct Users {
    kv: KvStore,
    config: ConfigCache,
}

impl Users {
    pub async fn open(kv: KvStore, config: ConfigCache) -> Result<Self> {
        kv.ensure_buckets(&[USERS_BUCKET, CREDENTIALS_BUCKET, RECOVERY_BUCKET])
            .await?;
        Ok(Self { kv, config })
    }

    // ============ Accounts ============

    pub async fn create_user(&self, email: &str) -> Result<User> {
        let email = normalize_email(email)?;
        let mut txn = self.kv.begin_write().await?;
        if txn.get(USERS_BUCKET, email.as_bytes()).await?.is_some() {
            return Err(EngineError::Conflict(format!("user {} already exists", email)));
        }
        let user = User {
            id: txn.next_sequence(USERS_BUCKET).await?,
            email,
        };
        put_user(&mut txn, &user).await?;
        txn.commit().await?;

        tracing::info!(user_id = user.id, "user created");
        Ok(user)
    }

    pub async fn get_user(&self, email: &str) -> Result<User> {
        let email = normalize_email(email)?;
        let mut txn = self.kv.begin_read().await?;
        get_user(&mut txn, &email).await
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let mut txn = self.kv.begin_read().await?;
        txn.entries(USERS_BUCKET)
            .await?
            .iter()
            .map(|(_, v)| serde_json::from_slice::<User>(v).map_err(Into::into))
            .collect()
    }

    /// Changes a user's email. Credentials stay attached to the id.
    pub async fn update_user(&self, email: &str, new_email: &str) -> Result<User> {
        let email = normalize_email(email)?;
        let new_email = normalize_email(new_email)?;
        let mut txn = self.kv.begin_write().await?;
        let mut user = get_user(&mut txn, &email).await?;
        if new_email != email {
            if txn.get(USERS_BUCKET, new_email.as_bytes()).await?.is_some() {
                return Err(EngineError::Conflict(format!(
                    "user {} already exists",
                    new_email
                )));
            }
            txn.delete(USERS_BUCKET, email.as_bytes()).await?;
            txn.delete(RECOVERY_BUCKET, email.as_bytes()).await?;
            user.email = new_email;
            put_user(&mut txn, &user).await?;
        }
        txn.commit().await?;
        Ok(user)
    }

    /// Removes the user with its credentials and recovery key.
    pub async fn delete_user(&self, email: &str) -> Result<()> {
        let email = normalize_email(email)?;
        let mut txn = self.kv.begin_write().await?;
        let user = get_user(&mut txn, &email).await?;

        let prefix = format!("{}:", user.id);
        for (key, _) in txn.entries(CREDENTIALS_BUCKET).await? {
            if key.starts_with(prefix.as_bytes()) {
                txn.delete(CREDENTIALS_BUCKET, &key).await?;
            }
        }
        txn.delete(RECOVERY_BUCKET, email.as_bytes()).await?;
        txn.delete(USERS_BUCKET, email.as_bytes()).await?;
        txn.commit().await?;

        tracing::info!(user_id = user.id, "user deleted");
        Ok(())
    }

    /// True once at least one user exists.
    pub async fn system_init_complete(&self) -> Result<bool> {
        let mut txn = self.kv.begin_read().await?;
        Ok(txn.count(USERS_BUCKET).await? > 0)
    }

    // ============ Credentials ============

    /// Stores a fresh argon2id hash of `secret`, replacing any earlier one.
    pub async fn set_credential(&self, user_id: u64, kind: &str, secret: &str) -> Result<()> {
        let record = CredentialHash {
            user_id,
            kind: kind.to_string(),
            hash: hash_secret(secret)?,
        };

        let mut txn = self.kv.begin_write().await?;
        txn.put(
            CREDENTIALS_BUCKET,
            credential_key(user_id, kind).as_bytes(),
            &serde_json::to_vec(&record)?,
        )
        .await?;
        txn.commit().await?;
        Ok(())
    }

    /// Checks `secret` against the stored hash. No stored hash is a mismatch.
    pub async fn verify_credential(&self, user_id: u64, kind: &str, secret: &str) -> Result<bool> {
        let mut txn = self.kv.begin_read().await?;
        let Some(bytes) = txn
            .get(CREDENTIALS_BUCKET, credential_key(user_id, kind).as_bytes())
            .await?
        else {
            return Ok(false);
        };
        let stored: CredentialHash = serde_json::from_slice(&bytes)?;
        let parsed = PasswordHash::new(&stored.hash).map_err(|e| {
            EngineError::Programming(format!(
                "credential {} is corrupt: {}",
                credential_key(user_id, kind),
                e
            ))
        })?;
        match Argon2::default().verify_password(secret.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(EngineError::Programming(format!("verify credential: {}", e))),
        }
    }

    /// Email/password check used by `cms user` and login.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<User> {
        let user = match self.get_user(email).await {
            Ok(user) => user,
            Err(e) if e.is_not_found() => {
                return Err(EngineError::Auth("invalid email or password".into()))
            }
            Err(e) => return Err(e),
        };
        if !self.verify_credential(user.id, PASSWORD, password).await? {
            return Err(EngineError::Auth("invalid email or password".into()));
        }
        Ok(user)
    }

    // ============ Recovery keys ============

    /// Generates and stores a recovery key for an existing user.
    pub async fn set_recovery_key(&self, email: &str) -> Result<String> {
        let email = normalize_email(email)?;
        let key = Uuid::new_v4().simple().to_string();
        let mut txn = self.kv.begin_write().await?;
        get_user(&mut txn, &email).await?;
        txn.put(RECOVERY_BUCKET, email.as_bytes(), key.as_bytes())
            .await?;
        txn.commit().await?;
        Ok(key)
    }

    pub async fn recovery_key(&self, email: &str) -> Result<Option<String>> {
        let email = normalize_email(email)?;
        let mut txn = self.kv.begin_read().await?;
        Ok(txn
            .get(RECOVERY_BUCKET, email.as_bytes())
            .await?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub async fn clear_recovery_key(&self, email: &str) -> Result<()> {
        let email = normalize_email(email)?;
        let mut txn = self.kv.begin_write().await?;
        txn.delete(RECOVERY_BUCKET, email.as_bytes()).await?;
        txn.commit().await?;
        Ok(())
    }

    // ============ Tokens ============

    /// Signed token naming `email`, valid for `ttl`.
    pub fn issue_token(&self, email: &str, ttl: Duration) -> Result<String> {
        let claims = Claims {
            sub: normalize_email(email)?,
            exp: (Utc::now() + ttl).timestamp(),
        };
        let key = EncodingKey::from_secret(self.secret()?.as_bytes());
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key)
            .map_err(|e| EngineError::Programming(format!("sign token: {}", e)))
    }

    /// Email carried by a valid, unexpired token.
    pub fn verify_token(&self, token: &str) -> Result<String> {
        let key = DecodingKey::from_secret(self.secret()?.as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        match jsonwebtoken::decode::<Claims>(token, &key, &validation) {
            Ok(data) => Ok(data.claims.sub),
            Err(e) if matches!(e.kind(), JwtErrorKind::ExpiredSignature) => {
                Err(EngineError::Auth("token expired".into()))
            }
            Err(_) => Err(EngineError::Auth("invalid token".into())),
        }
    }

    fn secret(&self) -> Result<String> {
        let secret = self.config.get_str("client_secret");
        if secret.is_empty() {
            return Err(EngineError::Programming("client_secret is not set".into()));
        }
        Ok(secret)
    }
}

fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(EngineError::InvalidInput(format!(
            "'{}' is not an email address",
            email
        ))),
    }
}

fn credential_key(user_id: u64, kind: &str) -> String {
    format!("{}:{}", user_id, kind)
}

async fn get_user(txn: &mut Txn, email: &str) -> Result<User> {
    match txn.get(USERS_BUCKET, email.as_bytes()).await? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        None => Err(EngineError::NotFound(format!("user {}", email))),
    }
}

async fn put_user(txn: &mut Txn, user: &User) -> Result<()> {
    txn.put(
        USERS_BUCKET,
        user.email.as_bytes(),
        &serde_json::to_vec(user)?,
    )
    .await?;
    Ok(())
}

fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| EngineError::Programming(format!("hash credential: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn users() -> (TempDir, Users) {
        let tmp = TempDir::new().unwrap();
        let kv = KvStore::open(&tmp.path().join("system.db")).await.unwrap();
        let config = ConfigCache::load(kv.clone()).await.unwrap();
        (tmp, Users::open(kv, config).await.unwrap())
    }

    #[tokio::test]
    async fn test_create_and_conflict() {
        let (_tmp, users) = users().await;
        assert!(!users.system_init_complete().await.unwrap());

        let user = users.create_user(" Admin@Example.com ").await.unwrap();
        assert_eq!(user.id, 1);
        assert_eq!(user.email, "admin@example.com");
        assert!(users.system_init_complete().await.unwrap());

        let err = users.create_user("admin@example.com").await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        assert!(users.create_user("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let (_tmp, users) = users().await;
        let a = users.create_user("a@example.com").await.unwrap();
        users.create_user("b@example.com").await.unwrap();
        users.set_credential(a.id, PASSWORD, "pw").await.unwrap();

        assert!(users.update_user("a@example.com", "b@example.com").await.is_err());
        let moved = users.update_user("a@example.com", "c@example.com").await.unwrap();
        assert_eq!(moved.id, a.id);
        assert!(users.get_user("a@example.com").await.unwrap_err().is_not_found());
        assert!(users.authenticate("c@example.com", "pw").await.is_ok());

        users.delete_user("c@example.com").await.unwrap();
        assert_eq!(users.list_users().await.unwrap().len(), 1);
        assert!(!users.verify_credential(a.id, PASSWORD, "pw").await.unwrap());
    }

    #[tokio::test]
    async fn test_credentials_verify() {
        let (_tmp, users) = users().await;
        let user = users.create_user("x@example.com").await.unwrap();
        users.set_credential(user.id, PASSWORD, "hunter2").await.unwrap();
        assert!(users.verify_credential(user.id, PASSWORD, "hunter2").await.unwrap());
        assert!(!users.verify_credential(user.id, PASSWORD, "hunter3").await.unwrap());
        assert!(!users.verify_credential(user.id, "totp", "hunter2").await.unwrap());

        let err = users.authenticate("x@example.com", "wrong").await.unwrap_err();
        assert!(matches!(err, EngineError::Auth(_)));
        let err = users.authenticate("ghost@example.com", "x").await.unwrap_err();
        assert!(matches!(err, EngineError::Auth(_)));
    }

    #[tokio::test]
    async fn test_recovery_keys() {
        let (_tmp, users) = users().await;
        users.create_user("r@example.com").await.unwrap();
        let key = users.set_recovery_key("r@example.com").await.unwrap();
        assert_eq!(users.recovery_key("R@example.com").await.unwrap(), Some(key));
        users.clear_recovery_key("r@example.com").await.unwrap();
        assert_eq!(users.recovery_key("r@example.com").await.unwrap(), None);
        assert!(users.set_recovery_key("ghost@example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_tokens() {
        let (_tmp, users) = users().await;
        let token = users.issue_token("t@example.com", Duration::hours(1)).unwrap();
        assert_eq!(users.verify_token(&token).unwrap(), "t@example.com");

        let mut tampered = token.clone();
        tampered.insert(0, 'x');
        assert!(users.verify_token(&tampered).is_err());

        let expired = users.issue_token("t@example.com", Duration::hours(-1)).unwrap();
        let err = users.verify_token(&expired).unwrap_err();
        assert!(matches!(err, EngineError::Auth(_)));

        // rotating the secret invalidates outstanding tokens
        users
            .config
            .put_config("client_secret", serde_json::Value::from("rotated"))
            .await
            .unwrap();
        assert!(users.verify_token(&token).is_err());
    }

    #[test]
    fn test_hash_is_salted_phc_string() {
        let a = hash_secret("pw").unwrap();
        let b = hash_secret("pw").unwrap();
        assert!(a.starts_with("$argon2id$"));
        assert_ne!(a, b);

        let parsed = PasswordHash::new(&a).unwrap();
        assert!(Argon2::default().verify_password(b"pw", &parsed).is_ok());
        assert!(Argon2::default().verify_password(b"px", &parsed).is_err());
    }

    #[tokio::test]
    async fn test_token_is_standard_jwt() {
        let (_tmp, users) = users().await;
        let token = users.issue_token("J@example.com", Duration::hours(1)).unwrap();
        assert_eq!(token.split('.').count(), 3);

        let secret = users.config.get_str("client_secret");
        let data = jsonwebtoken::decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .unwrap();
        assert_eq!(data.claims.sub, "j@example.com");
        assert!(data.claims.exp > Utc::now().timestamp());

        let expired = users.issue_token("j@example.com", Duration::hours(-1)).unwrap();
        match users.verify_token(&expired) {
            Err(EngineError::Auth(msg)) => assert_eq!(msg, "token expired"),
            other => panic!("expected expiry error, got {:?}", other.map(|_| ())),
        }
    }
}
