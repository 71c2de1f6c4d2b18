// 🔐 Auth - profiles, password hashing, sessions
//
// Profile id is the user identity used as owner_id everywhere else.
// Sessions are opaque random tokens with an expiry; sign-out deletes them.

use crate::db::{new_id, now_db_time, opt_time_column, time_column, to_db_time};
use crate::error::{not_found_on_empty, AppError, AppResult};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use pbkdf2::pbkdf2_hmac;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

pub const MIN_PASSWORD_LEN: usize = 6;

// ============================================================================
// ROLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Accountant,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Accountant => "accountant",
            Role::Client => "client",
        }
    }

    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "accountant" => Some(Role::Accountant),
            "client" => Some(Role::Client),
            _ => None,
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Client
    }
}

// ============================================================================
// PROFILE & SESSION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub id: String,
    pub email: String,
    pub full_name: String,
    pub company_name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    /// Name shown in the UI: full name, else the local part of the email
    pub fn display_name(&self) -> &str {
        if !self.full_name.is_empty() {
            return &self.full_name;
        }
        self.email.split('@').next().unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub profile: Profile,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn user_id(&self) -> &str {
        &self.profile.id
    }

    pub fn role(&self) -> Role {
        self.profile.role
    }

    pub fn is_accountant(&self) -> bool {
        self.profile.role == Role::Accountant
    }

    pub fn require_role(&self, role: Role) -> AppResult<()> {
        if self.profile.role != role {
            return Err(AppError::Forbidden(format!(
                "requires role {}",
                role.as_str()
            )));
        }
        Ok(())
    }

    /// Row-level check: the caller must own the row
    pub fn require_owner(&self, owner_id: &str) -> AppResult<()> {
        if owner_id != self.profile.id {
            return Err(AppError::Forbidden("not the owner".to_string()));
        }
        Ok(())
    }
}

/// Optional sign-up attributes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignUpMetadata {
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct AuthSettings {
    pub password_iterations: u32,
    pub session_ttl: Duration,
}

impl AuthSettings {
    pub fn from_config(config: &crate::config::AuthConfig) -> Self {
        AuthSettings {
            password_iterations: config.password_iterations,
            session_ttl: Duration::hours(config.session_ttl_hours),
        }
    }
}

// ============================================================================
// PASSWORD HASHING
// ============================================================================

/// `pbkdf2-sha256${iterations}${salt_b64}${key_b64}`
pub fn hash_password(password: &str, iterations: u32) -> String {
    let salt = *uuid::Uuid::new_v4().as_bytes();
    let key = derive_key(password, &salt, iterations);
    format!(
        "pbkdf2-sha256${}${}${}",
        iterations,
        B64.encode(salt),
        B64.encode(key)
    )
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split('$').collect();
    if parts.len() != 4 || parts[0] != "pbkdf2-sha256" {
        return false;
    }
    let iterations: u32 = match parts[1].parse() {
        Ok(n) if n > 0 => n,
        _ => return false,
    };
    let (salt, expected) = match (B64.decode(parts[2]), B64.decode(parts[3])) {
        (Ok(s), Ok(k)) => (s, k),
        _ => return false,
    };
    let key = derive_key(password, &salt, iterations);
    key[..].ct_eq(&expected[..]).into()
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    key
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_credentials(email: &str, password: &str) -> AppResult<()> {
    let mut errors = Vec::new();
    let at = email.find('@');
    if !matches!(at, Some(i) if i > 0 && i < email.len() - 1) {
        errors.push("A valid email address is required".to_string());
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        errors.push(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        ));
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::validation(errors))
    }
}

// ============================================================================
// OPERATIONS
// ============================================================================

const PROFILE_COLUMNS: &str = "id, email, full_name, company_name, role, created_at, updated_at";

pub(crate) fn profile_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Profile> {
    let role: String = row.get(4)?;
    Ok(Profile {
        id: row.get(0)?,
        email: row.get(1)?,
        full_name: row.get(2)?,
        company_name: row.get(3)?,
        role: Role::parse(&role).unwrap_or_default(),
        created_at: time_column(row, 5)?,
        updated_at: time_column(row, 6)?,
    })
}

/// Create a profile and start a session for it
pub fn sign_up(
    conn: &Connection,
    settings: &AuthSettings,
    email: &str,
    password: &str,
    metadata: &SignUpMetadata,
) -> AppResult<Session> {
    let email = normalize_email(email);
    validate_credentials(&email, password)?;

    let exists: Option<String> = conn
        .query_row("SELECT id FROM profiles WHERE email = ?1", [&email], |row| {
            row.get(0)
        })
        .optional()?;
    if exists.is_some() {
        return Err(AppError::Validation("User already registered".to_string()));
    }

    let id = new_id();
    let now = now_db_time();
    let role = metadata.role.unwrap_or_default();
    conn.execute(
        "INSERT INTO profiles (id, email, full_name, company_name, role, password_hash, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            id,
            email,
            metadata.full_name.clone().unwrap_or_default(),
            metadata.company_name.clone().unwrap_or_default(),
            role.as_str(),
            hash_password(password, settings.password_iterations),
            now,
        ],
    )?;

    log::info!("Signed up {} as {}", email, role.as_str());
    create_session(conn, settings, &id)
}

pub fn sign_in(
    conn: &Connection,
    settings: &AuthSettings,
    email: &str,
    password: &str,
) -> AppResult<Session> {
    let email = normalize_email(email);
    let found: Option<(String, String)> = conn
        .query_row(
            "SELECT id, password_hash FROM profiles WHERE email = ?1",
            [&email],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match found {
        Some((id, hash)) if verify_password(password, &hash) => {
            log::info!("Signed in {}", email);
            create_session(conn, settings, &id)
        }
        _ => {
            log::warn!("Failed sign-in for {}", email);
            Err(AppError::Validation("Invalid login credentials".to_string()))
        }
    }
}

pub fn sign_out(conn: &Connection, token: &str) -> AppResult<()> {
    conn.execute("DELETE FROM sessions WHERE token = ?1", [token])?;
    Ok(())
}

fn create_session(conn: &Connection, settings: &AuthSettings, user_id: &str) -> AppResult<Session> {
    let token = format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    );
    let now = Utc::now();
    let expires_at = now + settings.session_ttl;

    conn.execute(
        "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
        params![token, user_id, to_db_time(now), to_db_time(expires_at)],
    )?;

    let profile = get_profile(conn, user_id)?;
    Ok(Session {
        token,
        profile,
        expires_at,
    })
}

/// Resolve a bearer token to a live session
pub fn session_from_token(conn: &Connection, token: &str) -> AppResult<Session> {
    let found = conn
        .query_row(
            "SELECT user_id, expires_at FROM sessions WHERE token = ?1",
            [token],
            |row| Ok((row.get::<_, String>(0)?, opt_time_column(row, 1)?)),
        )
        .optional()?;

    let (user_id, expires_at) = match found {
        Some((user_id, Some(expires_at))) => (user_id, expires_at),
        _ => return Err(AppError::Unauthorized),
    };

    if expires_at <= Utc::now() {
        sign_out(conn, token)?;
        return Err(AppError::Unauthorized);
    }

    let profile = get_profile(conn, &user_id)?;
    Ok(Session {
        token: token.to_string(),
        profile,
        expires_at,
    })
}

pub fn get_profile(conn: &Connection, user_id: &str) -> AppResult<Profile> {
    conn.query_row(
        &format!("SELECT {} FROM profiles WHERE id = ?1", PROFILE_COLUMNS),
        [user_id],
        profile_from_row,
    )
    .map_err(|e| not_found_on_empty(e, &format!("profile {}", user_id)))
}

pub fn find_profile_by_email(conn: &Connection, email: &str) -> AppResult<Option<Profile>> {
    let profile = conn
        .query_row(
            &format!("SELECT {} FROM profiles WHERE email = ?1", PROFILE_COLUMNS),
            [normalize_email(email)],
            profile_from_row,
        )
        .optional()?;
    Ok(profile)
}

pub fn update_profile(
    conn: &Connection,
    session: &Session,
    updates: &ProfileUpdate,
) -> AppResult<Profile> {
    let current = get_profile(conn, session.user_id())?;
    let full_name = updates.full_name.clone().unwrap_or(current.full_name);
    let company_name = updates.company_name.clone().unwrap_or(current.company_name);

    conn.execute(
        "UPDATE profiles SET full_name = ?1, company_name = ?2, updated_at = ?3 WHERE id = ?4",
        params![full_name, company_name, now_db_time(), session.user_id()],
    )?;

    get_profile(conn, session.user_id())
}

pub fn update_password(
    conn: &Connection,
    settings: &AuthSettings,
    session: &Session,
    new_password: &str,
) -> AppResult<()> {
    if new_password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    conn.execute(
        "UPDATE profiles SET password_hash = ?1, updated_at = ?2 WHERE id = ?3",
        params![
            hash_password(new_password, settings.password_iterations),
            now_db_time(),
            session.user_id()
        ],
    )?;
    // Other sessions of this user are no longer trusted
    conn.execute(
        "DELETE FROM sessions WHERE user_id = ?1 AND token != ?2",
        params![session.user_id(), session.token],
    )?;

    log::info!("Password updated for {}", session.profile.email);
    Ok(())
}
