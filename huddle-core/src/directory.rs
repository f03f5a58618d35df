//! Chat directory contract
//!
//! The call core only asks the surrounding chat client who the local user is
//! and who their friends are. `InMemoryDirectory` is a small store with the
//! stock test account, usable by the CLI and the signaling simulator.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

/// Directory errors
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// Email is not of the form `local@domain.tld`
    #[error("Invalid email: {0}")]
    InvalidEmail(String),

    /// A friend with this email already exists
    #[error("Friend already added: {0}")]
    DuplicateEmail(String),

    /// Cannot befriend yourself
    #[error("Cannot add yourself as a friend")]
    SelfFriend,

    /// No friend with this id
    #[error("Friend not found: {0}")]
    NotFound(Uuid),

    /// Reading or writing the store failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Store contents are malformed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Presence shown next to a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    /// Online
    Online,
    /// Offline
    Offline,
}

/// The signed-in user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// User id
    pub id: Uuid,
    /// Display name
    pub username: String,
    /// Login email
    pub email: String,
    /// Presence
    pub presence: Presence,
    /// Account creation time
    pub created_at: DateTime<Utc>,
}

/// A friend of the signed-in user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Friend {
    /// Friend id
    pub id: Uuid,
    /// Display name
    pub username: String,
    /// Email
    pub email: String,
    /// Presence
    pub presence: Presence,
    /// Blocked by the user
    #[serde(default)]
    pub blocked: bool,
    /// When the friend was added
    pub added_at: DateTime<Utc>,
}

impl Friend {
    /// Friend named after the local part of their email
    pub fn from_email(email: &str) -> Self {
        let username = email.split('@').next().unwrap_or(email).to_string();
        Self::new(username, email)
    }

    /// Friend with an explicit display name
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            email: email.into(),
            presence: Presence::Online,
            blocked: false,
            added_at: Utc::now(),
        }
    }
}

/// What the call core needs from the chat client
pub trait Directory: Send + Sync {
    /// The signed-in user, if any
    fn current_user(&self) -> Option<UserProfile>;

    /// Friends in display order
    fn list_friends(&self) -> Vec<Friend>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DirectoryData {
    user: Option<UserProfile>,
    #[serde(default)]
    friends: Vec<Friend>,
}

/// Directory kept in memory, optionally persisted as JSON
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    data: RwLock<DirectoryData>,
}

impl InMemoryDirectory {
    /// Empty directory with nobody signed in
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock test account `TestUser` with friends Alex and Maria
    #[must_use]
    pub fn seeded() -> Self {
        let user = UserProfile {
            id: Uuid::new_v4(),
            username: "TestUser".to_string(),
            email: "test@test.com".to_string(),
            presence: Presence::Online,
            created_at: Utc::now(),
        };
        Self {
            data: RwLock::new(DirectoryData {
                user: Some(user),
                friends: vec![
                    Friend::new("Alex", "alex@test.com"),
                    Friend::new("Maria", "maria@test.com"),
                ],
            }),
        }
    }

    /// Load a directory saved with [`InMemoryDirectory::save`]
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        let raw = std::fs::read_to_string(path)?;
        let data: DirectoryData = serde_json::from_str(&raw)?;
        tracing::debug!(path = %path.display(), friends = data.friends.len(), "Directory loaded");
        Ok(Self {
            data: RwLock::new(data),
        })
    }

    /// Write the directory as pretty JSON
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn save(&self, path: &Path) -> Result<(), DirectoryError> {
        let json = serde_json::to_string_pretty(&*self.data.read())?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Replace the signed-in user
    pub fn set_current_user(&self, user: Option<UserProfile>) {
        self.data.write().user = user;
    }

    /// Add a friend by email
    ///
    /// # Errors
    ///
    /// Returns error if the email is malformed, already present, or the
    /// user's own
    pub fn add_friend(&self, email: &str) -> Result<Friend, DirectoryError> {
        let email = email.trim();
        if !is_valid_email(email) {
            return Err(DirectoryError::InvalidEmail(email.to_string()));
        }

        let mut data = self.data.write();
        if data.friends.iter().any(|f| f.email == email) {
            return Err(DirectoryError::DuplicateEmail(email.to_string()));
        }
        if data.user.as_ref().is_some_and(|u| u.email == email) {
            return Err(DirectoryError::SelfFriend);
        }

        let friend = Friend::from_email(email);
        data.friends.push(friend.clone());
        tracing::info!(friend = %friend.username, "Friend added");
        Ok(friend)
    }

    /// Remove a friend by id
    ///
    /// # Errors
    ///
    /// Returns error if no such friend exists
    pub fn remove_friend(&self, id: Uuid) -> Result<Friend, DirectoryError> {
        let mut data = self.data.write();
        let pos = data
            .friends
            .iter()
            .position(|f| f.id == id)
            .ok_or(DirectoryError::NotFound(id))?;
        Ok(data.friends.remove(pos))
    }

    /// Block or unblock a friend
    ///
    /// # Errors
    ///
    /// Returns error if no such friend exists
    pub fn set_blocked(&self, id: Uuid, blocked: bool) -> Result<(), DirectoryError> {
        let mut data = self.data.write();
        let friend = data
            .friends
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or(DirectoryError::NotFound(id))?;
        friend.blocked = blocked;
        tracing::info!(friend = %friend.username, blocked, "Friend block state changed");
        Ok(())
    }
}

impl Directory for InMemoryDirectory {
    fn current_user(&self) -> Option<UserProfile> {
        self.data.read().user.clone()
    }

    fn list_friends(&self) -> Vec<Friend> {
        self.data.read().friends.clone()
    }
}

fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain
                    .split_once('.')
                    .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
        }
        None => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_seeded_directory() {
        let dir = InMemoryDirectory::seeded();
        let user = dir.current_user().unwrap();
        assert_eq!(user.username, "TestUser");
        assert_eq!(user.email, "test@test.com");

        let names: Vec<_> = dir.list_friends().into_iter().map(|f| f.username).collect();
        assert_eq!(names, vec!["Alex".to_string(), "Maria".to_string()]);
    }

    #[test]
    fn test_add_friend_rules() {
        let dir = InMemoryDirectory::seeded();
        let friend = dir.add_friend("  sam@example.org ").unwrap();
        assert_eq!(friend.username, "sam");

        assert!(matches!(
            dir.add_friend("sam@example.org"),
            Err(DirectoryError::DuplicateEmail(_))
        ));
        assert!(matches!(
            dir.add_friend("test@test.com"),
            Err(DirectoryError::SelfFriend)
        ));
        assert!(matches!(
            dir.add_friend("not-an-email"),
            Err(DirectoryError::InvalidEmail(_))
        ));
        assert_eq!(dir.list_friends().len(), 3);
    }

    #[test]
    fn test_remove_friend() {
        let dir = InMemoryDirectory::seeded();
        let alex = dir.list_friends().remove(0);
        dir.remove_friend(alex.id).unwrap();
        assert!(matches!(
            dir.remove_friend(alex.id),
            Err(DirectoryError::NotFound(_))
        ));
        assert_eq!(dir.list_friends().len(), 1);
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("directory.json");

        let dir = InMemoryDirectory::seeded();
        dir.add_friend("sam@example.org").unwrap();
        dir.save(&path).unwrap();

        let loaded = InMemoryDirectory::load(&path).unwrap();
        assert_eq!(loaded.current_user(), dir.current_user());
        assert_eq!(loaded.list_friends(), dir.list_friends());
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("a@b.c"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("@b.c"));
        assert!(!is_valid_email("a b@c.d"));
        assert!(!is_valid_email("a@@b.c"));
    }
}
