//! Connect-request construction for the challenge/response handshake.
//!
//! After the WebSocket upgrade the gateway pushes a `connect.challenge` event
//! carrying a nonce. The client answers with a `connect` request whose params
//! bundle protocol bounds, client description, optional bearer token and, when
//! a device identity is available, a signature over:
//!
//! ```text
//! v2|deviceId|clientId|clientMode|role|scopes|signedAtMs|token|nonce
//! ```

use serde::Serialize;
use serde_json::Value;

use gatewatch_core::prelude::*;

use crate::config::ClientConfig;
use crate::identity::DeviceIdentity;
use crate::protocol::PROTOCOL_VERSION;

/// Signature payload version tag.
const DEVICE_AUTH_VERSION: &str = "v2";

/// Inputs to the signed device-auth string.
#[derive(Debug)]
pub struct DeviceAuthPayload<'a> {
    pub device_id: &'a str,
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    pub signed_at_ms: i64,
    pub token: Option<&'a str>,
    pub nonce: &'a str,
}

impl DeviceAuthPayload<'_> {
    /// Pipe-joined string that is signed by the device key.
    pub fn build(&self) -> String {
        [
            DEVICE_AUTH_VERSION.to_string(),
            self.device_id.to_string(),
            self.client_id.to_string(),
            self.client_mode.to_string(),
            self.role.to_string(),
            self.scopes.join(","),
            self.signed_at_ms.to_string(),
            self.token.unwrap_or_default().to_string(),
            self.nonce.to_string(),
        ]
        .join("|")
    }
}

// ---------------------------------------------------------------------------
// Connect params
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams<'a> {
    min_protocol: u32,
    max_protocol: u32,
    client: ClientInfo<'a>,
    auth: AuthParams<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<DeviceParams>,
    role: &'a str,
    scopes: &'a [String],
    caps: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientInfo<'a> {
    id: &'a str,
    display_name: &'a str,
    version: &'a str,
    platform: &'a str,
    mode: &'a str,
}

#[derive(Debug, Serialize)]
struct AuthParams<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceParams {
    id: String,
    public_key: String,
    signature: String,
    signed_at: i64,
    nonce: String,
}

/// Build the `connect` request params answering the challenge `nonce`.
///
/// Without an identity the request degrades to token-only authentication.
pub fn build_connect_params(
    config: &ClientConfig,
    token: Option<&str>,
    identity: Option<&DeviceIdentity>,
    nonce: &str,
    signed_at_ms: i64,
) -> Result<Value> {
    let device = identity.map(|identity| {
        let payload = DeviceAuthPayload {
            device_id: identity.device_id(),
            client_id: &config.client.id,
            client_mode: &config.client.mode,
            role: &config.role,
            scopes: &config.scopes,
            signed_at_ms,
            token,
            nonce,
        }
        .build();
        DeviceParams {
            id: identity.device_id().to_string(),
            public_key: identity.public_key_base64url(),
            signature: identity.sign(&payload),
            signed_at: signed_at_ms,
            nonce: nonce.to_string(),
        }
    });

    let params = ConnectParams {
        min_protocol: PROTOCOL_VERSION,
        max_protocol: PROTOCOL_VERSION,
        client: ClientInfo {
            id: &config.client.id,
            display_name: &config.client.display_name,
            version: &config.client.version,
            platform: &config.client.platform,
            mode: &config.client.mode,
        },
        auth: AuthParams { token },
        device,
        role: &config.role,
        scopes: &config.scopes,
        caps: &config.caps,
    };
    Ok(serde_json::to_value(params)?)
}
