//! Application messages exchanged between connected peers.

use crate::frame::{Frame, DEFAULT_MAX_BODY_SIZE};
use crate::header::FrameKind;
use crate::WireError;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Geographic position carried in a profile snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireCoordinates {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
}

/// A social link as sent over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireLink {
    /// Platform name, e.g. "instagram"
    pub platform: String,
    /// Link target
    pub url: String,
}

/// Profile fields a peer shares about itself after connecting
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    /// Display username
    pub username: String,
    /// Free-text bio
    pub bio: Option<String>,
    /// Age in years
    pub age: Option<u16>,
    /// Avatar reference
    pub avatar_url: Option<String>,
    /// Contact email
    pub email: Option<String>,
    /// Free-text status line
    pub status: Option<String>,
    /// Last known position
    pub coordinates: Option<WireCoordinates>,
    /// Premium subscription flag
    pub is_premium: bool,
    /// The sender's own social links
    pub social_links: Vec<WireLink>,
}

/// Body of a link grant
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkGrant {
    /// Links the approving peer shares
    pub links: Vec<WireLink>,
}

/// Decoded application message
#[derive(Debug, Clone, PartialEq)]
pub enum AppMessage {
    /// Chat text
    Chat(String),
    /// Sender's profile snapshot
    ProfileSnapshot(ProfileSnapshot),
    /// Request for the receiver's social links
    LinkRequest,
    /// Approval carrying the sender's links
    LinkGrant(LinkGrant),
    /// Rejection of an earlier link request
    LinkDeclined,
}

impl AppMessage {
    /// Frame kind used for this message
    pub fn kind(&self) -> FrameKind {
        match self {
            AppMessage::Chat(_) => FrameKind::Chat,
            AppMessage::ProfileSnapshot(_) => FrameKind::ProfileSnapshot,
            AppMessage::LinkRequest => FrameKind::LinkRequest,
            AppMessage::LinkGrant(_) => FrameKind::LinkGrant,
            AppMessage::LinkDeclined => FrameKind::LinkDeclined,
        }
    }

    /// Encode into a framed payload ready for the transport
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let body = match self {
            AppMessage::Chat(text) => Bytes::copy_from_slice(text.as_bytes()),
            AppMessage::ProfileSnapshot(snapshot) => to_cbor(snapshot)?,
            AppMessage::LinkGrant(grant) => to_cbor(grant)?,
            AppMessage::LinkRequest | AppMessage::LinkDeclined => Bytes::new(),
        };

        Frame::new(self.kind(), body).encode(DEFAULT_MAX_BODY_SIZE)
    }

    /// Decode a framed payload received from the transport
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let frame = Frame::decode(payload, DEFAULT_MAX_BODY_SIZE)?;

        match frame.kind {
            FrameKind::Chat => String::from_utf8(frame.body.to_vec())
                .map(AppMessage::Chat)
                .map_err(|_| WireError::Utf8),
            FrameKind::ProfileSnapshot => from_cbor(&frame.body).map(AppMessage::ProfileSnapshot),
            FrameKind::LinkGrant => from_cbor(&frame.body).map(AppMessage::LinkGrant),
            FrameKind::LinkRequest if frame.body.is_empty() => Ok(AppMessage::LinkRequest),
            FrameKind::LinkDeclined if frame.body.is_empty() => Ok(AppMessage::LinkDeclined),
            FrameKind::LinkRequest | FrameKind::LinkDeclined => Err(WireError::Malformed),
        }
    }
}

fn to_cbor<T: Serialize>(value: &T) -> Result<Bytes, WireError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| WireError::Cbor(e.to_string()))?;
    Ok(Bytes::from(buf))
}

fn from_cbor<T: DeserializeOwned>(body: &[u8]) -> Result<T, WireError> {
    ciborium::from_reader(body).map_err(|e| WireError::Cbor(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{FrameHeader, HEADER_SIZE};
    use bytes::BytesMut;

    fn raw_frame(kind: FrameKind, body: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
        FrameHeader::for_body(kind, body).encode(&mut buf);
        buf.extend_from_slice(body);
        buf.to_vec()
    }

    #[test]
    fn test_chat_message() {
        let bytes = AppMessage::Chat("hey bob 👋".to_string()).encode().unwrap();
        assert_eq!(
            AppMessage::decode(&bytes).unwrap(),
            AppMessage::Chat("hey bob 👋".to_string())
        );
    }

    #[test]
    fn test_profile_snapshot_message() {
        let snapshot = ProfileSnapshot {
            username: "alice".to_string(),
            bio: Some("climber".to_string()),
            coordinates: Some(WireCoordinates {
                latitude: 37.77,
                longitude: -122.41,
            }),
            is_premium: true,
            social_links: vec![WireLink {
                platform: "mastodon".to_string(),
                url: "https://example.social/@alice".to_string(),
            }],
            ..Default::default()
        };

        let bytes = AppMessage::ProfileSnapshot(snapshot.clone()).encode().unwrap();
        assert_eq!(
            AppMessage::decode(&bytes).unwrap(),
            AppMessage::ProfileSnapshot(snapshot)
        );
    }

    #[test]
    fn test_invalid_utf8_chat() {
        let bytes = raw_frame(FrameKind::Chat, &[0xff, 0xfe, 0xfd]);
        assert_eq!(AppMessage::decode(&bytes), Err(WireError::Utf8));
    }

    #[test]
    fn test_garbage_snapshot_body() {
        let bytes = raw_frame(FrameKind::ProfileSnapshot, b"\xff\x00not cbor");
        assert!(matches!(AppMessage::decode(&bytes), Err(WireError::Cbor(_))));
    }

    #[test]
    fn test_link_request_with_body_is_malformed() {
        let bytes = raw_frame(FrameKind::LinkRequest, b"x");
        assert_eq!(AppMessage::decode(&bytes), Err(WireError::Malformed));

        let bytes = AppMessage::LinkRequest.encode().unwrap();
        assert_eq!(AppMessage::decode(&bytes).unwrap(), AppMessage::LinkRequest);
    }
}
