//! Message envelope, type tags and payloads shared by both transports.
//!
//! Every frame on the wire, whether a WebSocket text frame from a browser or a
//! newline-terminated line from a gamepad device, is one JSON object:
//!
//! ```json
//! {"MsgType":"gpConnectReq","GamepadConnectRequest":{"DelivererId":"d1","ControllerId":"c1","GamepadId":"g1"}}
//! ```
//!
//! `MsgType` selects how the rest of the object is interpreted.  Each tag has
//! at most one relevant payload field; all payload fields are optional on the
//! wire and omitted when absent.  An optional `Error` object carries a
//! human-readable reason on responses and server errors.
//!
//! # Absent versus empty
//!
//! A payload that is missing from the JSON decodes to `None`.  A string field
//! that is missing *inside* a present payload decodes to an empty string.
//! Handlers treat both as "not present" and reject the message; nothing in
//! this module assigns meaning to a zero value.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::relation::RelationIds;

// ── Type tags ─────────────────────────────────────────────────────────────────

/// The discriminating tag of a [`Message`].
///
/// Serialized as the exact camelCase strings the browser and device clients
/// use.  Tags this server does not know decode to [`MsgType::Unknown`] with
/// the received tag preserved, so the receiving loop can log and skip the
/// frame instead of failing the whole decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MsgType {
    /// Liveness signal in both directions; carries no payload.
    Ping,
    /// Browser announces its display name.
    RegisterReq,
    /// Server assigns the connection's client id.
    RegisterRes,
    /// Deliverer asks for the current controller and gamepad listings.
    LookupReq,
    /// Server replies with the listings.
    LookupRes,
    /// Deliverer → controller: offer SDP.
    SigOfferSdpReq,
    /// Controller → deliverer: offer accepted or refused.
    SigOfferSdpRes,
    /// Server → sender: the offer leg failed validation or delivery.
    SigOfferSdpSrvErr,
    /// Controller → deliverer: answer SDP.
    SigAnswerSdpReq,
    /// Deliverer → controller: answer accepted or refused.
    SigAnswerSdpRes,
    /// Server → sender: the answer leg failed validation or delivery.
    SigAnswerSdpSrvErr,
    /// Gamepad device → server: authenticate with the shared-secret digest.
    GpHandshakeReq,
    /// Server → gamepad device: issued gamepad id, or an error.
    GpHandshakeRes,
    /// Controller → gamepad: open the virtual gamepad.
    GpConnectReq,
    /// Gamepad → controller: result of the connect request.
    GpConnectRes,
    /// Server → sender: the connect request failed validation or delivery.
    GpConnectSrvErr,
    /// Controller → gamepad: periodic button and axis state.
    GpState,
    /// Gamepad → controller: rumble request.
    GpVibration,
    /// TCP half → WebSocket half: a gamepad device went away.
    GpUnregister,
    /// Any tag this server does not understand.
    Unknown(String),
}

impl MsgType {
    /// Returns the wire string for this tag.
    pub fn as_str(&self) -> &str {
        match self {
            MsgType::Ping => "ping",
            MsgType::RegisterReq => "registerReq",
            MsgType::RegisterRes => "registerRes",
            MsgType::LookupReq => "lookupReq",
            MsgType::LookupRes => "lookupRes",
            MsgType::SigOfferSdpReq => "sigOfferSdpReq",
            MsgType::SigOfferSdpRes => "sigOfferSdpRes",
            MsgType::SigOfferSdpSrvErr => "sigOfferSdpSrvErr",
            MsgType::SigAnswerSdpReq => "sigAnswerSdpReq",
            MsgType::SigAnswerSdpRes => "sigAnswerSdpRes",
            MsgType::SigAnswerSdpSrvErr => "sigAnswerSdpSrvErr",
            MsgType::GpHandshakeReq => "gpHandshakeReq",
            MsgType::GpHandshakeRes => "gpHandshakeRes",
            MsgType::GpConnectReq => "gpConnectReq",
            MsgType::GpConnectRes => "gpConnectRes",
            MsgType::GpConnectSrvErr => "gpConnectSrvErr",
            MsgType::GpState => "gpState",
            MsgType::GpVibration => "gpVibration",
            MsgType::GpUnregister => "gpUnregister",
            MsgType::Unknown(tag) => tag,
        }
    }
}

impl From<String> for MsgType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "ping" => MsgType::Ping,
            "registerReq" => MsgType::RegisterReq,
            "registerRes" => MsgType::RegisterRes,
            "lookupReq" => MsgType::LookupReq,
            "lookupRes" => MsgType::LookupRes,
            "sigOfferSdpReq" => MsgType::SigOfferSdpReq,
            "sigOfferSdpRes" => MsgType::SigOfferSdpRes,
            "sigOfferSdpSrvErr" => MsgType::SigOfferSdpSrvErr,
            "sigAnswerSdpReq" => MsgType::SigAnswerSdpReq,
            "sigAnswerSdpRes" => MsgType::SigAnswerSdpRes,
            "sigAnswerSdpSrvErr" => MsgType::SigAnswerSdpSrvErr,
            "gpHandshakeReq" => MsgType::GpHandshakeReq,
            "gpHandshakeRes" => MsgType::GpHandshakeRes,
            "gpConnectReq" => MsgType::GpConnectReq,
            "gpConnectRes" => MsgType::GpConnectRes,
            "gpConnectSrvErr" => MsgType::GpConnectSrvErr,
            "gpState" => MsgType::GpState,
            "gpVibration" => MsgType::GpVibration,
            "gpUnregister" => MsgType::GpUnregister,
            _ => MsgType::Unknown(tag),
        }
    }
}

impl From<MsgType> for String {
    fn from(tag: MsgType) -> Self {
        match tag {
            MsgType::Unknown(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Client roles ──────────────────────────────────────────────────────────────

/// The three kinds of peers the server brokers between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// WebSocket client that initiates the SDP offer.
    Deliverer,
    /// WebSocket client representing the human driving the gamepad.
    Controller,
    /// TCP-connected gamepad-emulating device.
    Gamepad,
}

impl ClientType {
    /// Returns the wire string for this role.
    pub fn as_str(self) -> &'static str {
        match self {
            ClientType::Deliverer => "deliverer",
            ClientType::Controller => "controller",
            ClientType::Gamepad => "gamepad",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// Human-readable failure reason attached to a response or server error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ErrorPayload {
    pub message: String,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RegisterRequest {
    pub client_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterResponse {
    pub client_type: ClientType,
    pub client_id: String,
}

/// One row of a registry listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NameAndId {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LookupResponse {
    pub controllers: Vec<NameAndId>,
    pub gamepads: Vec<NameAndId>,
}

/// Offer or answer SDP, relayed opaquely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SignalingSdpRequest {
    /// Display name of the sender; informational only.
    pub name: String,
    pub deliverer_id: String,
    pub controller_id: String,
    pub gamepad_id: String,
    /// Session description; never parsed by the server.
    pub sdp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SignalingSdpResponse {
    pub deliverer_id: String,
    pub controller_id: String,
    pub gamepad_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GamepadHandshakeRequest {
    pub name: String,
    /// Lowercase hex SHA-256 of the shared secret.
    pub digest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GamepadHandshakeResponse {
    pub gamepad_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GamepadConnectRequest {
    pub deliverer_id: String,
    pub controller_id: String,
    pub gamepad_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GamepadConnectResponse {
    pub deliverer_id: String,
    pub controller_id: String,
    pub gamepad_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GamepadButtonState {
    pub pressed: bool,
    pub touched: bool,
    pub value: f64,
}

/// A snapshot of the controller's gamepad, sent roughly 60 times a second.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GamepadState {
    pub deliverer_id: String,
    pub controller_id: String,
    pub gamepad_id: String,
    pub buttons: Vec<GamepadButtonState>,
    pub axes: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GamepadVibration {
    pub deliverer_id: String,
    pub controller_id: String,
    pub gamepad_id: String,
    pub duration: f64,
    pub start_delay: f64,
    pub strong_magnitude: f64,
    pub weak_magnitude: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GamepadUnregister {
    pub gamepad_id: String,
}

macro_rules! impl_relation_ids {
    ($($payload:ty),* $(,)?) => {
        $(
            impl $payload {
                /// Returns the deliverer/controller/gamepad triple this payload names.
                pub fn relation_ids(&self) -> RelationIds {
                    RelationIds::new(&self.deliverer_id, &self.controller_id, &self.gamepad_id)
                }
            }
        )*
    };
}

impl_relation_ids!(
    SignalingSdpRequest,
    SignalingSdpResponse,
    GamepadConnectRequest,
    GamepadConnectResponse,
    GamepadState,
    GamepadVibration,
);

// ── Envelope ──────────────────────────────────────────────────────────────────

/// The envelope every frame on either transport decodes into.
///
/// Build messages with struct-update syntax over [`Message::new`]:
///
/// ```rust
/// use regap_core::protocol::messages::{Message, MsgType, RegisterRequest};
///
/// let msg = Message {
///     register_request: Some(RegisterRequest { client_name: "alice".into() }),
///     ..Message::new(MsgType::RegisterReq)
/// };
/// assert_eq!(msg.msg_type, MsgType::RegisterReq);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    pub msg_type: MsgType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register_request: Option<RegisterRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register_response: Option<RegisterResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_response: Option<LookupResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signaling_sdp_request: Option<SignalingSdpRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signaling_sdp_response: Option<SignalingSdpResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gamepad_handshake_request: Option<GamepadHandshakeRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gamepad_handshake_response: Option<GamepadHandshakeResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gamepad_connect_request: Option<GamepadConnectRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gamepad_connect_response: Option<GamepadConnectResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gamepad_state: Option<GamepadState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gamepad_vibration: Option<GamepadVibration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gamepad_unregister: Option<GamepadUnregister>,
}

impl Message {
    /// Creates an envelope with the given tag and no payload.
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            msg_type,
            error: None,
            register_request: None,
            register_response: None,
            lookup_response: None,
            signaling_sdp_request: None,
            signaling_sdp_response: None,
            gamepad_handshake_request: None,
            gamepad_handshake_response: None,
            gamepad_connect_request: None,
            gamepad_connect_response: None,
            gamepad_state: None,
            gamepad_vibration: None,
            gamepad_unregister: None,
        }
    }

    /// The heartbeat frame: `{"MsgType":"ping"}`.
    pub fn ping() -> Self {
        Self::new(MsgType::Ping)
    }

    /// An envelope with the given tag carrying only an `Error` reason.
    pub fn with_error(msg_type: MsgType, reason: impl Into<String>) -> Self {
        Self {
            error: Some(ErrorPayload::new(reason)),
            ..Self::new(msg_type)
        }
    }

    /// Returns the error reason when the envelope carries a non-empty one.
    pub fn error_message(&self) -> Option<&str> {
        self.error
            .as_ref()
            .map(|e| e.message.as_str())
            .filter(|m| !m.is_empty())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
