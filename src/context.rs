// 🧭 App Context - connection, object store, config and the current session
//
// Replaces ambient singletons: every caller holds one context and passes
// its parts into the domain functions. The session is set by sign-in and
// cleared by sign-out.

use crate::auth::{self, AuthSettings, Session, SignUpMetadata};
use crate::config::Config;
use crate::db::setup_database;
use crate::error::{AppError, AppResult};
use crate::storage::{LocalObjectStore, ObjectStore};
use rusqlite::Connection;
use std::path::Path;

pub struct AppContext {
    conn: Connection,
    store: LocalObjectStore,
    config: Config,
    auth: AuthSettings,
    session: Option<Session>,
}

/// Open (and create if needed) the database at `path`, schema included
pub fn open_database(path: impl AsRef<Path>) -> AppResult<Connection> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    setup_database(&conn)?;
    log::debug!("Opened database {}", path.display());
    Ok(conn)
}

/// Object store rooted at the configured directory
pub fn open_store(config: &Config) -> AppResult<LocalObjectStore> {
    std::fs::create_dir_all(&config.storage.root)?;
    Ok(LocalObjectStore::new(
        &config.storage.root,
        &config.server.public_url,
        &config.storage.signing_secret,
    ))
}

impl AppContext {
    pub fn open(config: Config) -> AppResult<Self> {
        let conn = open_database(&config.database.path)?;
        let store = open_store(&config)?;
        Ok(Self::with_parts(conn, store, config))
    }

    pub fn with_parts(conn: Connection, store: LocalObjectStore, config: Config) -> Self {
        let auth = AuthSettings::from_config(&config.auth);
        AppContext {
            conn,
            store,
            config,
            auth,
            session: None,
        }
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn store(&self) -> &dyn ObjectStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn auth_settings(&self) -> &AuthSettings {
        &self.auth
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn require_session(&self) -> AppResult<&Session> {
        self.session.as_ref().ok_or(AppError::Unauthorized)
    }

    /// Mutable connection alongside the store and session, for operations
    /// that open a transaction
    pub fn split_mut(&mut self) -> AppResult<(&mut Connection, &dyn ObjectStore, &Session)> {
        let session = self.session.as_ref().ok_or(AppError::Unauthorized)?;
        Ok((&mut self.conn, &self.store, session))
    }

    // ========================================================================
    // SESSION LIFECYCLE
    // ========================================================================

    pub fn sign_up(
        &mut self,
        email: &str,
        password: &str,
        metadata: &SignUpMetadata,
    ) -> AppResult<&Session> {
        let session = auth::sign_up(&self.conn, &self.auth, email, password, metadata)?;
        Ok(&*self.session.insert(session))
    }

    pub fn sign_in(&mut self, email: &str, password: &str) -> AppResult<&Session> {
        let session = auth::sign_in(&self.conn, &self.auth, email, password)?;
        Ok(&*self.session.insert(session))
    }

    /// Resume a session from a stored token
    pub fn resume(&mut self, token: &str) -> AppResult<&Session> {
        let session = auth::session_from_token(&self.conn, token)?;
        Ok(&*self.session.insert(session))
    }

    pub fn sign_out(&mut self) -> AppResult<()> {
        if let Some(session) = self.session.take() {
            auth::sign_out(&self.conn, &session.token)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::clients::{accept_invitation, invite_client};
    use crate::files::upload_file;
    use crate::merge::create_merge_job;

    fn context(dir: &Path) -> AppContext {
        let mut config = Config::default();
        config.database.path = dir.join("db").join("ledger.db");
        config.storage.root = dir.join("objects");
        config.auth.password_iterations = 1_000;
        AppContext::open(config).unwrap()
    }

    fn metadata(role: Role) -> SignUpMetadata {
        SignUpMetadata {
            role: Some(role),
            full_name: None,
            company_name: None,
        }
    }

    #[test]
    fn test_session_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        assert!(matches!(ctx.require_session(), Err(AppError::Unauthorized)));

        let token = ctx
            .sign_up("acc@example.com", "password123", &metadata(Role::Accountant))
            .unwrap()
            .token
            .clone();
        assert!(ctx.require_session().unwrap().is_accountant());

        ctx.sign_out().unwrap();
        assert!(ctx.session().is_none());
        assert!(ctx.resume(&token).is_err());

        ctx.sign_in("acc@example.com", "password123").unwrap();
        assert_eq!(ctx.require_session().unwrap().profile.email, "acc@example.com");
    }

    #[test]
    fn test_end_to_end_through_context() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());

        ctx.sign_up("client@example.com", "password123", &metadata(Role::Client))
            .unwrap();
        ctx.sign_out().unwrap();

        ctx.sign_up("acc@example.com", "password123", &metadata(Role::Accountant))
            .unwrap();
        let session = ctx.require_session().unwrap();
        let invite = invite_client(ctx.conn(), session, "client@example.com").unwrap();
        let a = upload_file(ctx.conn(), ctx.store(), session, "a.csv", b"a").unwrap();
        let b = upload_file(ctx.conn(), ctx.store(), session, "b.csv", b"b").unwrap();

        let (conn, _store, session) = ctx.split_mut().unwrap();
        let job = create_merge_job(conn, session, None, &[a.id, b.id]).unwrap();
        assert_eq!(job.files.len(), 2);

        ctx.sign_out().unwrap();
        ctx.sign_in("client@example.com", "password123").unwrap();
        let token = invite.invite_token.unwrap();
        let accepted = accept_invitation(ctx.conn(), ctx.require_session().unwrap(), &token).unwrap();
        assert_eq!(accepted.status, crate::clients::RelationshipStatus::Active);
    }
}
