// 🤝 Client Relationships - accountant ↔ client links via invitation tokens
//
// Lifecycle:
//   invite  → pending (token, expires_at = now + 7 days)
//   accept  → active  (token cleared, single use)
//   resend  → pending (new token, expiry pushed out again)
// Expiry is never stored as a status; it is computed when the token is read.

use crate::auth::{find_profile_by_email, profile_from_row, Profile, Role, Session};
use crate::db::{new_id, opt_time_column, time_column, to_db_time};
use crate::error::{not_found_on_empty, AppError, AppResult, InvitationError};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

pub const INVITE_TTL_DAYS: i64 = 7;

// ============================================================================
// RELATIONSHIP STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipStatus {
    Pending,
    Active,
    Inactive,
}

impl RelationshipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipStatus::Pending => "pending",
            RelationshipStatus::Active => "active",
            RelationshipStatus::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<RelationshipStatus> {
        match value {
            "pending" => Some(RelationshipStatus::Pending),
            "active" => Some(RelationshipStatus::Active),
            "inactive" => Some(RelationshipStatus::Inactive),
            _ => None,
        }
    }
}

// ============================================================================
// RELATIONSHIP
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRelationship {
    pub id: String,
    pub accountant_id: String,
    pub client_id: Option<String>,
    pub invited_email: String,
    pub status: RelationshipStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite_token: Option<String>,
    pub invited_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
}

impl ClientRelationship {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Relationship with the referenced profile expanded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipWithProfile {
    #[serde(flatten)]
    pub relationship: ClientRelationship,
    /// The client for listings, the accountant for invitation lookups
    pub profile: Option<Profile>,
}

const RELATIONSHIP_COLUMNS: &str = "cr.id, cr.accountant_id, cr.client_id, cr.invited_email, \
     cr.status, cr.invite_token, cr.invited_at, cr.expires_at, cr.accepted_at";

const JOINED_PROFILE_COLUMNS: &str =
    "p.id, p.email, p.full_name, p.company_name, p.role, p.created_at, p.updated_at";

fn relationship_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClientRelationship> {
    let status: String = row.get(4)?;
    Ok(ClientRelationship {
        id: row.get(0)?,
        accountant_id: row.get(1)?,
        client_id: row.get(2)?,
        invited_email: row.get(3)?,
        status: RelationshipStatus::parse(&status).unwrap_or(RelationshipStatus::Inactive),
        invite_token: row.get(5)?,
        invited_at: time_column(row, 6)?,
        expires_at: time_column(row, 7)?,
        accepted_at: opt_time_column(row, 8)?,
    })
}

/// Relationship columns followed by LEFT JOINed profile columns
fn relationship_with_profile_from_row(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<RelationshipWithProfile> {
    let relationship = relationship_from_row(row)?;
    let profile_id: Option<String> = row.get(9)?;
    let profile = match profile_id {
        Some(_) => Some(profile_from_offset(row, 9)?),
        None => None,
    };
    Ok(RelationshipWithProfile {
        relationship,
        profile,
    })
}

fn profile_from_offset(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Profile> {
    let role: String = row.get(offset + 4)?;
    Ok(Profile {
        id: row.get(offset)?,
        email: row.get(offset + 1)?,
        full_name: row.get(offset + 2)?,
        company_name: row.get(offset + 3)?,
        role: Role::parse(&role).unwrap_or_default(),
        created_at: time_column(row, offset + 5)?,
        updated_at: time_column(row, offset + 6)?,
    })
}

/// High-entropy single-use token: hyphenated uuid followed by a simple uuid
pub fn generate_invite_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4(),
        uuid::Uuid::new_v4().simple()
    )
}

fn load_relationship(conn: &Connection, id: &str) -> AppResult<ClientRelationship> {
    conn.query_row(
        &format!(
            "SELECT {} FROM client_relationships cr WHERE cr.id = ?1",
            RELATIONSHIP_COLUMNS
        ),
        [id],
        relationship_from_row,
    )
    .map_err(|e| not_found_on_empty(e, &format!("client relationship {}", id)))
}

fn owned_relationship(
    conn: &Connection,
    session: &Session,
    id: &str,
) -> AppResult<ClientRelationship> {
    session.require_role(Role::Accountant)?;
    let relationship = load_relationship(conn, id)?;
    session.require_owner(&relationship.accountant_id)?;
    Ok(relationship)
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// All relationships of the calling accountant, newest invitation first
pub fn list_clients(conn: &Connection, session: &Session) -> AppResult<Vec<RelationshipWithProfile>> {
    session.require_role(Role::Accountant)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {}, {} FROM client_relationships cr
         LEFT JOIN profiles p ON p.id = cr.client_id
         WHERE cr.accountant_id = ?1
         ORDER BY cr.invited_at DESC",
        RELATIONSHIP_COLUMNS, JOINED_PROFILE_COLUMNS
    ))?;
    let clients = stmt
        .query_map([session.user_id()], relationship_with_profile_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(clients)
}

/// Create a pending relationship; the token is returned to the caller
pub fn invite_client(
    conn: &Connection,
    session: &Session,
    client_email: &str,
) -> AppResult<ClientRelationship> {
    session.require_role(Role::Accountant)?;

    let email = client_email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(AppError::Validation(
            "A valid client email address is required".to_string(),
        ));
    }

    let existing = find_profile_by_email(conn, &email)?;
    if existing.as_ref().map(|p| p.id.as_str()) == Some(session.user_id()) {
        return Err(AppError::Validation("You cannot invite yourself".to_string()));
    }

    let id = new_id();
    let token = generate_invite_token();
    let now = Utc::now();

    conn.execute(
        "INSERT INTO client_relationships
            (id, accountant_id, client_id, invited_email, status, invite_token, invited_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7)",
        params![
            id,
            session.user_id(),
            existing.map(|p| p.id),
            email,
            token,
            to_db_time(now),
            to_db_time(now + Duration::days(INVITE_TTL_DAYS)),
        ],
    )?;

    log::info!("Invited {} (relationship {})", email, id);
    load_relationship(conn, &id)
}

/// Look up an invitation by token, with the inviting accountant expanded.
/// Expired or already-used invitations are refused.
pub fn get_invitation(conn: &Connection, token: &str) -> AppResult<RelationshipWithProfile> {
    get_invitation_at(conn, token, Utc::now())
}

pub fn get_invitation_at(
    conn: &Connection,
    token: &str,
    now: DateTime<Utc>,
) -> AppResult<RelationshipWithProfile> {
    let found = conn
        .query_row(
            &format!(
                "SELECT {}, {} FROM client_relationships cr
                 LEFT JOIN profiles p ON p.id = cr.accountant_id
                 WHERE cr.invite_token = ?1",
                RELATIONSHIP_COLUMNS, JOINED_PROFILE_COLUMNS
            ),
            [token],
            relationship_with_profile_from_row,
        )
        .optional()?;

    let invitation = found.ok_or(InvitationError::NotFound)?;

    if invitation.relationship.is_expired_at(now) {
        return Err(InvitationError::Expired.into());
    }
    if invitation.relationship.status != RelationshipStatus::Pending {
        return Err(InvitationError::AlreadyUsed.into());
    }

    Ok(invitation)
}

/// Accept a pending invitation as the signed-in user.
/// The update is conditional on the row still being pending, so of two
/// concurrent accepts only one changes a row.
pub fn accept_invitation(
    conn: &Connection,
    session: &Session,
    token: &str,
) -> AppResult<ClientRelationship> {
    let now_text = to_db_time(Utc::now());

    let found: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, status, expires_at FROM client_relationships WHERE invite_token = ?1",
            [token],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let (id, status, expires_at) = found.ok_or(InvitationError::NotFound)?;
    if expires_at < now_text {
        return Err(InvitationError::Expired.into());
    }
    if status != RelationshipStatus::Pending.as_str() {
        return Err(InvitationError::AlreadyUsed.into());
    }

    let updated = conn.execute(
        "UPDATE client_relationships
         SET client_id = ?1, status = 'active', accepted_at = ?2, invite_token = NULL
         WHERE id = ?3 AND status = 'pending' AND invite_token = ?4",
        params![session.user_id(), now_text, id, token],
    )?;
    if updated == 0 {
        return Err(InvitationError::AlreadyUsed.into());
    }

    log::info!("Invitation {} accepted by {}", id, session.user_id());
    load_relationship(conn, &id)
}

/// New token and a fresh 7-day window; only pending relationships qualify
pub fn resend_invitation(
    conn: &Connection,
    session: &Session,
    relationship_id: &str,
) -> AppResult<ClientRelationship> {
    owned_relationship(conn, session, relationship_id)?;

    let token = generate_invite_token();
    let now = Utc::now();
    let updated = conn.execute(
        "UPDATE client_relationships
         SET invite_token = ?1, invited_at = ?2, expires_at = ?3
         WHERE id = ?4 AND status = 'pending'",
        params![
            token,
            to_db_time(now),
            to_db_time(now + Duration::days(INVITE_TTL_DAYS)),
            relationship_id
        ],
    )?;
    if updated == 0 {
        return Err(InvitationError::AlreadyUsed.into());
    }

    log::info!("Invitation {} re-sent", relationship_id);
    load_relationship(conn, relationship_id)
}

pub fn update_relationship_status(
    conn: &Connection,
    session: &Session,
    relationship_id: &str,
    status: RelationshipStatus,
) -> AppResult<ClientRelationship> {
    owned_relationship(conn, session, relationship_id)?;

    conn.execute(
        "UPDATE client_relationships SET status = ?1 WHERE id = ?2",
        params![status.as_str(), relationship_id],
    )?;
    load_relationship(conn, relationship_id)
}

pub fn remove_client(conn: &Connection, session: &Session, relationship_id: &str) -> AppResult<()> {
    owned_relationship(conn, session, relationship_id)?;

    conn.execute(
        "DELETE FROM client_relationships WHERE id = ?1",
        [relationship_id],
    )?;
    log::info!("Removed client relationship {}", relationship_id);
    Ok(())
}
