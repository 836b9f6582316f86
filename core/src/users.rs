/// User profiles supplied by the identity provider
use crate::backend::{get_json, put_json, Backend};
use crate::error::Result;
use crate::schema::{self, keys, User};
use std::sync::Arc;

#[derive(Clone)]
pub struct UserDirectory {
    backend: Arc<dyn Backend>,
}

impl UserDirectory {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn put_user(&self, user: &User) -> Result<()> {
        schema::validate_id("user", &user.id)?;
        put_json(self.backend.as_ref(), &keys::user(&user.id), user)
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        schema::validate_id("user", user_id)?;
        get_json(self.backend.as_ref(), &keys::user(user_id))
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut out = Vec::new();
        for (_, raw) in self.backend.scan(keys::USERS_PREFIX, None, None)? {
            out.push(serde_json::from_slice::<User>(&raw)?);
        }
        Ok(out)
    }

    /// Everyone but `user_id`: the people one can start a chat with
    pub fn list_users_except(&self, user_id: &str) -> Result<Vec<User>> {
        Ok(self
            .list_users()?
            .into_iter()
            .filter(|u| u.id != user_id)
            .collect())
    }

    /// `list_users_except`, narrowed to names containing `query`
    /// (case-insensitive). An empty query matches everyone.
    pub fn search_users(&self, user_id: &str, query: &str) -> Result<Vec<User>> {
        let needle = query.trim().to_lowercase();
        Ok(self
            .list_users_except(user_id)?
            .into_iter()
            .filter(|u| needle.is_empty() || u.name.to_lowercase().contains(&needle))
            .collect())
    }
}
