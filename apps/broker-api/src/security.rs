//! Principals, security constraints and the login manager the router calls
//! before dispatching to a destination.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::session::Session;
use crate::settings::{ConstraintSettings, SecuritySettings};

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(name: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            name: name.into(),
            roles,
        }
    }
}

/// Access rule attached to a destination. An empty role list only requires authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityConstraint {
    pub id: String,
    pub roles: Vec<String>,
}

impl From<&ConstraintSettings> for SecurityConstraint {
    fn from(settings: &ConstraintSettings) -> Self {
        Self {
            id: settings.id.clone(),
            roles: settings.roles.clone(),
        }
    }
}

/// Authentication provider contract.
pub trait Authenticator: Send + Sync {
    /// Verify credentials, returning the principal on success.
    fn authenticate(&self, username: &str, password: &str) -> Option<Principal>;

    /// Whether `principal` holds any of `roles`.
    fn has_any_role(&self, principal: &Principal, roles: &[String]) -> bool {
        roles.iter().any(|r| principal.roles.contains(r))
    }
}

/// Authenticator backed by the users listed in the broker settings.
pub struct StaticAuthenticator {
    users: HashMap<String, (String, Vec<String>)>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self {
            users: HashMap::new(),
        }
    }

    pub fn from_settings(settings: &SecuritySettings) -> Self {
        let mut auth = Self::new();
        for user in &settings.users {
            auth.add_user(&user.username, &user.password, user.roles.clone());
        }
        auth
    }

    pub fn add_user(&mut self, username: &str, password: &str, roles: Vec<String>) {
        self.users
            .insert(username.to_string(), (password.to_string(), roles));
    }
}

impl Default for StaticAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, username: &str, password: &str) -> Option<Principal> {
        let (expected, roles) = self.users.get(username)?;
        (expected == password).then(|| Principal::new(username, roles.clone()))
    }
}

/// Decode base64 `user:password` credentials.
pub fn decode_credentials(encoded: &str) -> Result<(String, String), BrokerError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| BrokerError::invalid_credentials("credentials are not valid base64"))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| BrokerError::invalid_credentials("credentials are not valid utf-8"))?;
    let (user, password) = text
        .split_once(':')
        .ok_or_else(|| BrokerError::invalid_credentials("credentials must be 'user:password'"))?;
    Ok((user.to_string(), password.to_string()))
}

pub fn encode_credentials(username: &str, password: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"))
}

/// Performs logins and authorization checks on behalf of the router.
pub struct LoginManager {
    authenticator: Option<Arc<dyn Authenticator>>,
    constraints: HashMap<String, SecurityConstraint>,
    started: AtomicBool,
}

impl LoginManager {
    pub fn new(authenticator: Option<Arc<dyn Authenticator>>) -> Self {
        Self {
            authenticator,
            constraints: HashMap::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn from_settings(settings: &SecuritySettings) -> Self {
        let auth: Arc<dyn Authenticator> = Arc::new(StaticAuthenticator::from_settings(settings));
        let mut mgr = Self::new(Some(auth));
        for c in &settings.constraints {
            mgr.add_constraint(SecurityConstraint::from(c));
        }
        mgr
    }

    pub fn add_constraint(&mut self, constraint: SecurityConstraint) {
        self.constraints.insert(constraint.id.clone(), constraint);
    }

    pub fn constraint(&self, id: &str) -> Option<&SecurityConstraint> {
        self.constraints.get(id)
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Authenticate base64 `user:password` credentials.
    pub fn login(&self, encoded: &str) -> Result<Principal, BrokerError> {
        let authenticator = self
            .authenticator
            .as_ref()
            .ok_or_else(|| BrokerError::not_authenticated("no authenticator is configured"))?;
        let (username, password) = decode_credentials(encoded)?;
        authenticator
            .authenticate(&username, &password)
            .ok_or_else(|| BrokerError::invalid_credentials("invalid username or password"))
    }

    /// Authenticate and attach the principal to `session`.
    pub fn login_session(&self, session: &Session, encoded: &str) -> Result<Principal, BrokerError> {
        let principal = self.login(encoded)?;
        session.set_principal(Some(principal.clone()))?;
        tracing::info!(session_id = %session.id(), principal = %principal.name, "login succeeded");
        Ok(principal)
    }

    /// Drop the principal from `session`. Logging out twice is not an error.
    pub fn logout(&self, session: &Session) -> Result<(), BrokerError> {
        if let Some(principal) = session.principal() {
            tracing::info!(session_id = %session.id(), principal = %principal.name, "logout");
        }
        session.set_principal(None)
    }

    /// Whether `principal` may access a destination guarded by `constraint`.
    pub fn check_constraint(
        &self,
        principal: Option<&Principal>,
        constraint: Option<&str>,
    ) -> Result<(), BrokerError> {
        let Some(constraint_id) = constraint else {
            return Ok(());
        };
        let constraint = self.constraints.get(constraint_id).ok_or_else(|| {
            BrokerError::configuration(format!("unknown security constraint '{constraint_id}'"))
        })?;
        let principal = principal.ok_or_else(|| {
            BrokerError::not_authenticated(format!(
                "login required for security constraint '{}'",
                constraint.id
            ))
        })?;
        if constraint.roles.is_empty() || self.check_roles(principal, &constraint.roles) {
            Ok(())
        } else {
            Err(BrokerError::access_denied(format!(
                "'{}' is not in a role permitted by '{}'",
                principal.name, constraint.id
            )))
        }
    }

    pub fn check_roles(&self, principal: &Principal, roles: &[String]) -> bool {
        match &self.authenticator {
            Some(auth) => auth.has_any_role(principal, roles),
            None => roles.iter().any(|r| principal.roles.contains(r)),
        }
    }
}
