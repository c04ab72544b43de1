//! Identity, tokens, and role-based access control.
//!
//! Bearer tokens are opaque, DB-backed, and revocable: each request resolves
//! the token to a user and loads that user's roles. Passwords are stored as
//! PBKDF2-HMAC-SHA256 with a per-user random salt and verified in constant
//! time.
//!
//! Right-to-erasure lives here too: erasing a user cascades to owned rows,
//! de-identifies retained analytics rows, and leaves a tombstone that
//! answers `Gone`.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::audit::{self, ActorContext};
use crate::error::Error;
use crate::store::{Store, fmt_ts};

type HmacSha256 = Hmac<Sha256>;

/// PBKDF2 iteration count for password hashes.
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt length in bytes.
const SALT_LEN: usize = 16;

/// Bearer token length in bytes (hex-encoded on the wire).
const TOKEN_LEN: usize = 32;

/// The closed set of roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Citizen,
    Caregiver,
    Asha,
    Clinician,
    DistrictOfficer,
    StateOfficer,
    NationalAdmin,
}

impl Role {
    /// Every role, in privilege order.
    pub const ALL: [Self; 7] = [
        Self::Citizen,
        Self::Caregiver,
        Self::Asha,
        Self::Clinician,
        Self::DistrictOfficer,
        Self::StateOfficer,
        Self::NationalAdmin,
    ];

    /// Stable string form (matches the wire and the `user_roles` table).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Citizen => "citizen",
            Self::Caregiver => "caregiver",
            Self::Asha => "asha",
            Self::Clinician => "clinician",
            Self::DistrictOfficer => "district_officer",
            Self::StateOfficer => "state_officer",
            Self::NationalAdmin => "national_admin",
        }
    }

    /// Parses the stable string form.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for anything outside the closed set.
    pub fn parse(s: &str) -> Result<Self, Error> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown role: {s}")))
    }

    /// Officer roles may read cross-user data on dashboard surfaces.
    #[must_use]
    pub const fn is_officer(self) -> bool {
        matches!(
            self,
            Self::DistrictOfficer | Self::StateOfficer | Self::NationalAdmin
        )
    }
}

/// A registered user.
#[derive(Debug, Clone)]
pub struct User {
    /// Immutable identifier.
    pub id: String,
    /// Phone number or alias used to sign in.
    pub username: String,
    /// Active flag; inactive users cannot authenticate.
    pub is_active: bool,
    /// Creation timestamp (canonical RFC 3339).
    pub created_at: String,
}

/// The resolved caller of a request: user id plus loaded roles.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    /// The authenticated user id.
    pub user_id: String,
    /// Roles held by the user.
    pub roles: Vec<Role>,
}

impl AuthedUser {
    /// Whether the caller holds the given role.
    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Whether the caller holds any officer role.
    #[must_use]
    pub fn is_officer(&self) -> bool {
        self.roles.iter().any(|role| role.is_officer())
    }

    /// Requires one of the listed roles.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` when none of the roles is held.
    pub fn require_any(&self, allowed: &[Role]) -> Result<(), Error> {
        if allowed.iter().any(|role| self.has_role(*role)) {
            Ok(())
        } else {
            Err(Error::Forbidden)
        }
    }
}

/// PBKDF2-HMAC-SHA256 with a 32-byte output (single block).
fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut mac =
        HmacSha256::new_from_slice(password).expect("HMAC accepts keys of any length");
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut block = mac.finalize().into_bytes();
    let mut out = block;

    for _ in 1..iterations {
        let mut mac =
            HmacSha256::new_from_slice(password).expect("HMAC accepts keys of any length");
        mac.update(&block);
        block = mac.finalize().into_bytes();
        for (acc, byte) in out.iter_mut().zip(block.iter()) {
            *acc ^= byte;
        }
    }

    out.into()
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Identity and access-control operations.
#[derive(Debug, Clone)]
pub struct IdentityService {
    store: Store,
}

impl IdentityService {
    /// Creates the service over the shared store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Registers a user and returns the user plus a fresh bearer token.
    ///
    /// New users get the `citizen` role.
    ///
    /// # Errors
    ///
    /// `Validation` for a weak password or empty alias, `Conflict` when the
    /// alias is taken.
    pub fn register(
        &self,
        actor: &ActorContext,
        username: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<(User, String), Error> {
        if username.trim().is_empty() {
            return Err(Error::Validation("username must not be empty".into()));
        }
        if password.len() < 8 {
            return Err(Error::Validation(
                "password must be at least 8 characters".into(),
            ));
        }

        let user_id = Uuid::new_v4().to_string();
        let salt = random_bytes::<SALT_LEN>();
        let hash = pbkdf2_sha256(password.as_bytes(), &salt, PBKDF2_ITERATIONS);
        let token = hex::encode(random_bytes::<TOKEN_LEN>());
        let created_at = fmt_ts(now);

        self.store.with_tx(|tx| {
            let taken: Option<String> = tx
                .query_row(
                    "SELECT id FROM users WHERE username = ?1",
                    params![username],
                    |row| row.get(0),
                )
                .optional()?;
            if taken.is_some() {
                return Err(Error::Conflict(format!("username {username} is taken")));
            }

            tx.execute(
                "INSERT INTO users (id, username, password_hash, password_salt, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user_id,
                    username,
                    hex::encode(hash),
                    hex::encode(salt),
                    created_at
                ],
            )?;
            tx.execute(
                "INSERT INTO user_roles (user_id, role) VALUES (?1, ?2)",
                params![user_id, Role::Citizen.as_str()],
            )?;
            tx.execute(
                "INSERT INTO auth_tokens (token, user_id, created_at) VALUES (?1, ?2, ?3)",
                params![token, user_id, created_at],
            )?;

            audit::append(
                tx,
                &ActorContext {
                    actor_id: Some(user_id.clone()),
                    ..actor.clone()
                },
                "auth.register",
                "user",
                Some(&user_id),
                &serde_json::json!({ "username_present": true }),
                now,
            )?;
            Ok(())
        })?;

        Ok((
            User {
                id: user_id,
                username: username.to_string(),
                is_active: true,
                created_at,
            },
            token,
        ))
    }

    /// Authenticates an alias/password pair and mints a token.
    ///
    /// # Errors
    ///
    /// `Unauthorized` for a bad pair, `Gone` for an erased user.
    pub fn login(
        &self,
        actor: &ActorContext,
        username: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<String, Error> {
        let row: Option<(String, String, String, bool, bool)> = self.store.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, password_hash, password_salt, is_active, erased
                     FROM users WHERE username = ?1",
                    params![username],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    },
                )
                .optional()?)
        })?;

        let Some((user_id, stored_hash, stored_salt, is_active, erased)) = row else {
            return Err(Error::Unauthorized);
        };
        if erased {
            return Err(Error::Gone);
        }
        if !is_active {
            return Err(Error::Unauthorized);
        }

        let salt =
            hex::decode(stored_salt).map_err(|_| Error::Transient("corrupt salt".into()))?;
        let expected =
            hex::decode(stored_hash).map_err(|_| Error::Transient("corrupt hash".into()))?;
        let candidate = pbkdf2_sha256(password.as_bytes(), &salt, PBKDF2_ITERATIONS);
        if !bool::from(candidate.ct_eq(&expected)) {
            return Err(Error::Unauthorized);
        }

        let token = hex::encode(random_bytes::<TOKEN_LEN>());
        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO auth_tokens (token, user_id, created_at) VALUES (?1, ?2, ?3)",
                params![token, user_id, fmt_ts(now)],
            )?;
            audit::append(
                tx,
                &ActorContext {
                    actor_id: Some(user_id.clone()),
                    ..actor.clone()
                },
                "auth.login",
                "user",
                Some(&user_id),
                &serde_json::json!({}),
                now,
            )?;
            Ok(())
        })?;

        Ok(token)
    }

    /// Resolves a bearer token to the calling user and their roles.
    ///
    /// # Errors
    ///
    /// `Unauthorized` for unknown, revoked, or inactive credentials; `Gone`
    /// for erased users.
    pub fn resolve_token(&self, token: &str) -> Result<AuthedUser, Error> {
        self.store.with_conn(|conn| {
            let row: Option<(String, Option<String>, bool, bool)> = conn
                .query_row(
                    "SELECT u.id, t.revoked_at, u.is_active, u.erased
                     FROM auth_tokens t JOIN users u ON u.id = t.user_id
                     WHERE t.token = ?1",
                    params![token],
                    |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    },
                )
                .optional()?;

            let Some((user_id, revoked_at, is_active, erased)) = row else {
                return Err(Error::Unauthorized);
            };
            if erased {
                return Err(Error::Gone);
            }
            if revoked_at.is_some() || !is_active {
                return Err(Error::Unauthorized);
            }

            let mut stmt =
                conn.prepare("SELECT role FROM user_roles WHERE user_id = ?1")?;
            let roles = stmt
                .query_map(params![user_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?
                .iter()
                .filter_map(|name| Role::parse(name).ok())
                .collect();

            Ok(AuthedUser { user_id, roles })
        })
    }

    /// Revokes a bearer token. Revocation takes effect on the next resolve.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn revoke_token(&self, token: &str, now: DateTime<Utc>) -> Result<(), Error> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE auth_tokens SET revoked_at = ?1 WHERE token = ?2 AND revoked_at IS NULL",
                params![fmt_ts(now), token],
            )?;
            Ok(())
        })
    }

    /// Grants a role to a user (admin operation, audited).
    ///
    /// # Errors
    ///
    /// `NotFound` if the user does not exist.
    pub fn grant_role(
        &self,
        actor: &ActorContext,
        user_id: &str,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.store.with_tx(|tx| {
            let exists: Option<String> = tx
                .query_row(
                    "SELECT id FROM users WHERE id = ?1 AND erased = 0",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(Error::NotFound("user"));
            }
            tx.execute(
                "INSERT OR IGNORE INTO user_roles (user_id, role) VALUES (?1, ?2)",
                params![user_id, role.as_str()],
            )?;
            audit::append(
                tx,
                actor,
                "role.grant",
                "user",
                Some(user_id),
                &serde_json::json!({ "role": role.as_str() }),
                now,
            )?;
            Ok(())
        })
    }

    /// Erases a user: owned rows are deleted, complaints and analytics rows
    /// are de-identified and retained, and a tombstone remains so the id
    /// answers `Gone`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the user never existed, `Gone` if already erased.
    pub fn erase_user(
        &self,
        actor: &ActorContext,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.store.with_tx(|tx| {
            let erased: Option<bool> = tx
                .query_row(
                    "SELECT erased FROM users WHERE id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            match erased {
                None => return Err(Error::NotFound("user")),
                Some(true) => return Err(Error::Gone),
                Some(false) => {},
            }

            for table in [
                "profiles",
                "consents",
                "sync_events",
                "vitals_log",
                "mood_log",
                "water_log",
            ] {
                tx.execute(
                    &format!("DELETE FROM {table} WHERE user_id = ?1"),
                    params![user_id],
                )?;
            }
            tx.execute(
                "DELETE FROM triage_sessions WHERE owner_id = ?1",
                params![user_id],
            )?;
            // Prescriptions reference tele requests; drop them first.
            tx.execute(
                "DELETE FROM prescriptions WHERE tele_request_id IN
                     (SELECT id FROM tele_requests WHERE citizen_id = ?1)",
                params![user_id],
            )?;
            tx.execute(
                "DELETE FROM tele_requests WHERE citizen_id = ?1",
                params![user_id],
            )?;
            tx.execute(
                "DELETE FROM auth_tokens WHERE user_id = ?1",
                params![user_id],
            )?;
            tx.execute(
                "DELETE FROM user_roles WHERE user_id = ?1",
                params![user_id],
            )?;

            // User-addressed notifications are owned rows too; pending ones
            // have no deliverable addressee after erasure.
            tx.execute(
                "DELETE FROM outbound_messages WHERE user_id = ?1",
                params![user_id],
            )?;

            // Complaints survive as anonymous records; analytics rows are
            // already de-identified, only the audit link is dropped.
            tx.execute(
                "UPDATE complaints SET submitter_id = NULL, anonymous = 1
                 WHERE submitter_id = ?1",
                params![user_id],
            )?;
            tx.execute(
                "UPDATE analytics_events SET user_id = NULL WHERE user_id = ?1",
                params![user_id],
            )?;

            tx.execute(
                "UPDATE users SET erased = 1, is_active = 0,
                        username = 'erased:' || id,
                        password_hash = '', password_salt = ''
                 WHERE id = ?1",
                params![user_id],
            )?;

            audit::append(
                tx,
                actor,
                "user.erase",
                "user",
                Some(user_id),
                &serde_json::json!({}),
                now,
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> IdentityService {
        IdentityService::new(Store::in_memory().unwrap())
    }

    #[test]
    fn role_round_trip() {
        for role in Role::ALL {
            assert_eq!(Role::parse(role.as_str()).unwrap(), role);
        }
        assert!(Role::parse("superuser").is_err());
    }

    #[test]
    fn officer_roles() {
        assert!(Role::DistrictOfficer.is_officer());
        assert!(Role::NationalAdmin.is_officer());
        assert!(!Role::Clinician.is_officer());
    }

    #[test]
    fn register_login_resolve() {
        let identity = service();
        let now = Utc::now();
        let (user, token) = identity
            .register(&ActorContext::system(), "9876543210", "s3cret-pass", now)
            .unwrap();

        let authed = identity.resolve_token(&token).unwrap();
        assert_eq!(authed.user_id, user.id);
        assert!(authed.has_role(Role::Citizen));

        let token2 = identity
            .login(&ActorContext::system(), "9876543210", "s3cret-pass", now)
            .unwrap();
        assert_ne!(token, token2);

        assert!(matches!(
            identity.login(&ActorContext::system(), "9876543210", "wrong-pass", now),
            Err(Error::Unauthorized)
        ));
    }

    #[test]
    fn duplicate_username_conflicts() {
        let identity = service();
        let now = Utc::now();
        identity
            .register(&ActorContext::system(), "alias-1", "password1", now)
            .unwrap();
        assert!(matches!(
            identity.register(&ActorContext::system(), "alias-1", "password2", now),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn revoked_token_is_rejected() {
        let identity = service();
        let now = Utc::now();
        let (_, token) = identity
            .register(&ActorContext::system(), "alias-2", "password1", now)
            .unwrap();
        identity.revoke_token(&token, now).unwrap();
        assert!(matches!(
            identity.resolve_token(&token),
            Err(Error::Unauthorized)
        ));
    }

    #[test]
    fn require_any_enforces_rbac() {
        let caller = AuthedUser {
            user_id: "u-1".into(),
            roles: vec![Role::Clinician],
        };
        assert!(caller.require_any(&[Role::Clinician]).is_ok());
        assert!(matches!(
            caller.require_any(&[Role::NationalAdmin]),
            Err(Error::Forbidden)
        ));
    }

    #[test]
    fn erased_user_answers_gone() {
        let identity = service();
        let now = Utc::now();
        let (user, token) = identity
            .register(&ActorContext::system(), "alias-3", "password1", now)
            .unwrap();

        identity
            .erase_user(&ActorContext::system(), &user.id, now)
            .unwrap();

        assert!(matches!(identity.resolve_token(&token), Err(Error::Gone)));
        assert!(matches!(
            identity.login(&ActorContext::system(), "alias-3", "password1", now),
            Err(Error::Unauthorized),
        ));
        assert!(matches!(
            identity.erase_user(&ActorContext::system(), &user.id, now),
            Err(Error::Gone)
        ));
    }

    #[test]
    fn erasure_removes_queued_messages() {
        let store = Store::in_memory().unwrap();
        let identity = IdentityService::new(store.clone());
        let now = Utc::now();
        let (user, _token) = identity
            .register(&ActorContext::system(), "alias-4", "password1", now)
            .unwrap();
        store
            .with_tx(|tx| {
                crate::outbox::enqueue(tx, Some(&user.id), "sms", "appointment reminder", now)
            })
            .unwrap();

        identity
            .erase_user(&ActorContext::system(), &user.id, now)
            .unwrap();

        let remaining: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM outbound_messages WHERE user_id = ?1",
                    params![user.id],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn pbkdf2_is_deterministic_and_salted() {
        let a = pbkdf2_sha256(b"password", b"salt-one", 1_000);
        let b = pbkdf2_sha256(b"password", b"salt-one", 1_000);
        let c = pbkdf2_sha256(b"password", b"salt-two", 1_000);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
