//! Configuration module
//!
//! Handles CLI configuration including gateway URL and caller identity.

use docprobe_client::GatewayClient;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the gateway service
    pub gateway_url: String,
    /// Sent as the request owner; the gateway falls back to `anonymous`
    pub user_id: Option<String>,
}

impl Config {
    /// Builds a client for the configured gateway and user
    pub fn client(&self) -> GatewayClient {
        let client = GatewayClient::new(&self.gateway_url);
        match &self.user_id {
            Some(user) => client.with_user(user),
            None => client,
        }
    }
}
