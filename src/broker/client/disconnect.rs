//! DISCONNECT handling: the one graceful way out of a session.

use tracing::debug;

use super::{Client, SessionError};

impl Client {
    /// The will dies with a graceful disconnect: dropped from the session
    /// and deleted from storage, never published.
    pub(super) async fn handle_disconnect(&self) -> Result<(), SessionError> {
        debug!("client {} sent DISCONNECT", self.client_id());
        self.close_with(false).await;
        Err(SessionError::Disconnected)
    }
}
