#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parley_domain::{ApiKeyInfo, Privileges, UserRecord, Username};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::records::RecordStore;
use crate::tokens::{AuthClaims, sign_token, verify_token};

/// Errors surfaced by the identity provider. Messages for credential and
/// session failures are deliberately vague so callers can forward them to
/// clients without leaking which part was wrong.
#[derive(Debug, Error)]
pub enum IdentityError {
	#[error("User not found or invalid password.")]
	BadCredentials,
	#[error("Session expired or invalid.")]
	BadSession,
	#[error("API key not found or disabled.")]
	BadApiKey,
	#[error("User account is disabled.")]
	Disabled,
	#[error("User not found: {0}")]
	UnknownUser(String),
	#[error("Nickname already in use: {0}")]
	NicknameTaken(String),
	#[error("identity backend error: {0}")]
	Backend(String),
}

impl IdentityError {
	fn backend(err: anyhow::Error) -> Self {
		Self::Backend(format!("{err:#}"))
	}
}

/// A successful authentication: the session token plus the user record.
#[derive(Debug, Clone)]
pub struct IdentitySession {
	pub session_id: String,
	pub username: Username,
	pub user: UserRecord,
}

/// Change notifications emitted after every durable user mutation. The
/// presence core subscribes to these to force-disconnect banned users and
/// fan out profile updates.
#[derive(Debug, Clone)]
pub enum UserChange {
	Updated { user: UserRecord, was_active: bool },
	Deleted { username: Username },
}

/// Partial profile update.
#[derive(Debug, Clone, Default)]
pub struct UserPatch {
	pub full_name: Option<String>,
	pub nickname: Option<String>,
	pub status: Option<(String, String)>,
}

/// The consumed identity interface.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
	async fn authenticate(&self, username: &str, password: &str) -> Result<IdentitySession, IdentityError>;

	async fn resume_session(&self, token: &str) -> Result<IdentitySession, IdentityError>;

	async fn validate_api_key(&self, key: &str) -> Result<IdentitySession, IdentityError>;

	/// Enable or disable an account; disabling is how a ban lands.
	async fn set_active(&self, username: &Username, active: bool) -> Result<UserRecord, IdentityError>;

	async fn update_user(&self, username: &Username, patch: UserPatch) -> Result<UserRecord, IdentityError>;

	async fn get_user(&self, username: &Username) -> Result<Option<UserRecord>, IdentityError>;

	async fn list_users(&self) -> Result<Vec<UserRecord>, IdentityError>;

	async fn list_api_keys(&self) -> Result<Vec<ApiKeyInfo>, IdentityError>;

	fn subscribe_changes(&self) -> broadcast::Receiver<UserChange>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredUser {
	#[serde(flatten)]
	user: UserRecord,
	password_hash: String,
	salt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredApiKey {
	id: String,
	key: String,
	title: String,
	#[serde(default = "default_true")]
	active: bool,
	#[serde(default)]
	created: i64,
}

fn default_true() -> bool {
	true
}

/// Record-store-backed identity provider.
pub struct Directory {
	store: Arc<dyn RecordStore>,
	secret: String,
	session_ttl_secs: u64,
	changes: broadcast::Sender<UserChange>,
}

fn now_secs() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn hash_password(salt: &str, password: &str) -> String {
	let digest = Sha256::digest(format!("{salt}{password}").as_bytes());
	digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Strip markup-significant characters from display names.
fn scrub_name(name: &str) -> String {
	name.chars().filter(|c| !matches!(c, '<' | '>' | '\'' | '"' | '&' | '\r' | '\n')).collect()
}

fn user_key(username: &Username) -> String {
	format!("users/{username}")
}

impl Directory {
	pub fn new(store: Arc<dyn RecordStore>, secret: impl Into<String>, session_ttl_secs: u64) -> Self {
		let (changes, _) = broadcast::channel(64);
		Self {
			store,
			secret: secret.into(),
			session_ttl_secs,
			changes,
		}
	}

	async fn load(&self, username: &Username) -> Result<Option<StoredUser>, IdentityError> {
		let raw = self.store.get(&user_key(username)).await.map_err(IdentityError::backend)?;
		match raw {
			Some(value) => serde_json::from_value(value)
				.map(Some)
				.map_err(|e| IdentityError::Backend(e.to_string())),
			None => Ok(None),
		}
	}

	async fn save(&self, stored: &StoredUser) -> Result<(), IdentityError> {
		let value = serde_json::to_value(stored).map_err(|e| IdentityError::Backend(e.to_string()))?;
		self.store
			.put(&user_key(&stored.user.username), value)
			.await
			.map_err(IdentityError::backend)
	}

	fn notify(&self, change: UserChange) {
		// nobody listening is fine (tests, early startup)
		let _ = self.changes.send(change);
	}

	fn issue_session(&self, user: UserRecord) -> Result<IdentitySession, IdentityError> {
		let claims = AuthClaims {
			sub: user.username.as_str().to_string(),
			exp: now_secs() + self.session_ttl_secs,
			sid: uuid::Uuid::new_v4().to_string(),
		};
		let token = sign_token(&claims, &self.secret).map_err(IdentityError::backend)?;
		Ok(IdentitySession {
			session_id: token,
			username: user.username.clone(),
			user,
		})
	}

	/// Provision a new account. Used by startup bootstrap and tests; the
	/// full user-administration surface lives outside this subsystem.
	pub async fn create_user(
		&self,
		username: &str,
		password: &str,
		full_name: &str,
		privileges: Privileges,
	) -> Result<UserRecord, IdentityError> {
		let username = Username::normalize(username).map_err(|_| IdentityError::BadCredentials)?;
		if self.load(&username).await?.is_some() {
			return Err(IdentityError::Backend(format!("user already exists: {username}")));
		}

		let now = now_secs() as i64;
		let salt = uuid::Uuid::new_v4().to_string();
		let stored = StoredUser {
			user: UserRecord {
				username: username.clone(),
				full_name: scrub_name(full_name),
				nickname: username.as_str().to_string(),
				status: String::new(),
				status_hint: String::new(),
				active: true,
				privileges,
				created: now,
				modified: now,
			},
			password_hash: hash_password(&salt, password),
			salt,
		};

		self.save(&stored).await?;
		self.store
			.list_push("global/users", serde_json::Value::String(username.as_str().to_string()))
			.await
			.map_err(IdentityError::backend)?;

		debug!(username = %username, "created user");
		self.notify(UserChange::Updated {
			user: stored.user.clone(),
			was_active: true,
		});
		Ok(stored.user)
	}

	pub async fn delete_user(&self, username: &Username) -> Result<(), IdentityError> {
		self.store.delete(&user_key(username)).await.map_err(IdentityError::backend)?;
		self.notify(UserChange::Deleted {
			username: username.clone(),
		});
		Ok(())
	}

	pub async fn create_api_key(&self, id: &str, key: &str, title: &str) -> Result<(), IdentityError> {
		let stored = StoredApiKey {
			id: id.to_string(),
			key: key.to_string(),
			title: title.to_string(),
			active: true,
			created: now_secs() as i64,
		};
		let value = serde_json::to_value(&stored).map_err(|e| IdentityError::Backend(e.to_string()))?;
		self.store
			.list_push("global/api_keys", value)
			.await
			.map_err(IdentityError::backend)?;
		Ok(())
	}

	async fn stored_api_keys(&self) -> Result<Vec<StoredApiKey>, IdentityError> {
		let raw = self
			.store
			.list_recent("global/api_keys", 0)
			.await
			.map_err(IdentityError::backend)?;
		let mut keys = Vec::with_capacity(raw.len());
		for value in raw {
			match serde_json::from_value::<StoredApiKey>(value) {
				Ok(k) => keys.push(k),
				Err(e) => warn!(error = %e, "skipping malformed api key record"),
			}
		}
		Ok(keys)
	}
}

#[async_trait]
impl IdentityProvider for Directory {
	async fn authenticate(&self, username: &str, password: &str) -> Result<IdentitySession, IdentityError> {
		let username = Username::normalize(username).map_err(|_| IdentityError::BadCredentials)?;
		let stored = self.load(&username).await?.ok_or(IdentityError::BadCredentials)?;

		if hash_password(&stored.salt, password) != stored.password_hash {
			return Err(IdentityError::BadCredentials);
		}
		if !stored.user.active {
			return Err(IdentityError::Disabled);
		}

		self.issue_session(stored.user)
	}

	async fn resume_session(&self, token: &str) -> Result<IdentitySession, IdentityError> {
		let claims = verify_token(token, &self.secret).map_err(|_| IdentityError::BadSession)?;
		let username = Username::normalize(&claims.sub).map_err(|_| IdentityError::BadSession)?;
		let stored = self.load(&username).await?.ok_or(IdentityError::BadSession)?;

		if !stored.user.active {
			return Err(IdentityError::Disabled);
		}

		Ok(IdentitySession {
			session_id: token.to_string(),
			username,
			user: stored.user,
		})
	}

	async fn validate_api_key(&self, key: &str) -> Result<IdentitySession, IdentityError> {
		let keys = self.stored_api_keys().await?;
		let found = keys.into_iter().find(|k| k.key == key).ok_or(IdentityError::BadApiKey)?;
		if !found.active {
			return Err(IdentityError::BadApiKey);
		}

		// synthetic actor: the key id doubles as the username
		let username = Username::normalize(&found.id).map_err(|_| IdentityError::BadApiKey)?;
		let now = now_secs() as i64;
		let user = UserRecord {
			username: username.clone(),
			full_name: found.title.clone(),
			nickname: found.title,
			status: String::new(),
			status_hint: String::new(),
			active: true,
			privileges: Privileges::default(),
			created: found.created,
			modified: now,
		};

		self.issue_session(user)
	}

	async fn set_active(&self, username: &Username, active: bool) -> Result<UserRecord, IdentityError> {
		let mut stored = self
			.load(username)
			.await?
			.ok_or_else(|| IdentityError::UnknownUser(username.to_string()))?;

		let was_active = stored.user.active;
		stored.user.active = active;
		stored.user.modified = now_secs() as i64;
		self.save(&stored).await?;

		self.notify(UserChange::Updated {
			user: stored.user.clone(),
			was_active,
		});
		Ok(stored.user)
	}

	async fn update_user(&self, username: &Username, patch: UserPatch) -> Result<UserRecord, IdentityError> {
		let mut stored = self
			.load(username)
			.await?
			.ok_or_else(|| IdentityError::UnknownUser(username.to_string()))?;

		if let Some(nickname) = &patch.nickname {
			let nickname = scrub_name(nickname);
			let wanted = nickname.trim().to_lowercase();
			for other in self.list_users().await? {
				if other.username != *username && other.nickname.trim().to_lowercase() == wanted {
					return Err(IdentityError::NicknameTaken(nickname));
				}
			}
			stored.user.nickname = nickname;
		}
		if let Some(full_name) = &patch.full_name {
			stored.user.full_name = scrub_name(full_name);
		}
		if let Some((status, hint)) = &patch.status {
			stored.user.status = status.clone();
			stored.user.status_hint = hint.clone();
		}
		stored.user.modified = now_secs() as i64;
		self.save(&stored).await?;

		let was_active = stored.user.active;
		self.notify(UserChange::Updated {
			user: stored.user.clone(),
			was_active,
		});
		Ok(stored.user)
	}

	async fn get_user(&self, username: &Username) -> Result<Option<UserRecord>, IdentityError> {
		Ok(self.load(username).await?.map(|s| s.user))
	}

	async fn list_users(&self) -> Result<Vec<UserRecord>, IdentityError> {
		let names = self
			.store
			.list_recent("global/users", 0)
			.await
			.map_err(IdentityError::backend)?;

		let mut users = Vec::with_capacity(names.len());
		for name in names {
			let Some(name) = name.as_str().map(str::to_string) else {
				continue;
			};
			let Ok(username) = Username::normalize(&name) else {
				continue;
			};
			if let Some(stored) = self.load(&username).await? {
				users.push(stored.user);
			}
		}
		Ok(users)
	}

	async fn list_api_keys(&self) -> Result<Vec<ApiKeyInfo>, IdentityError> {
		Ok(self
			.stored_api_keys()
			.await?
			.into_iter()
			.map(|k| ApiKeyInfo {
				id: k.id,
				title: k.title,
				active: k.active,
				created: k.created,
			})
			.collect())
	}

	fn subscribe_changes(&self) -> broadcast::Receiver<UserChange> {
		self.changes.subscribe()
	}
}
