use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Cleartext password check against the single shared server password.
/// Any user name is accepted; the role that matters is the `actor_id` a
/// statement names.
#[derive(Debug)]
pub struct SharedPasswordAuth {
    password: String,
}

impl SharedPasswordAuth {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedPasswordAuth {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
