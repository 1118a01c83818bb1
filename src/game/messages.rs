//! Match message set and lobby state snapshot.
//!
//! These are the wire types exchanged after the handshake. The message set is
//! a closed, internally tagged enum: decode and dispatch are exhaustive
//! matches, and adding a variant is a compile-time-checked change.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::settings::MatchSettings;

/// Control input seat owned by a client. A client may run several players
/// (splitscreen), one per seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlType {
    Keyboard,
    Joystick1,
    Joystick2,
    Joystick3,
    Joystick4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatMessageType {
    User,
    System,
}

/// Malformed inner match message payload. Recoverable: the message is
/// dropped and logged, the connection stays up.
#[derive(Debug, Error)]
#[error("malformed match message: {0}")]
pub struct PayloadError(#[from] serde_json::Error);

/// One event/intent of the post-handshake protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MatchMessage {
    ClientJoined {
        client_guid: Uuid,
        client_name: String,
    },
    ClientLeft {
        client_guid: Uuid,
    },
    PlayerJoined {
        client_guid: Uuid,
        ctrl_type: ControlType,
        initial_character: usize,
    },
    PlayerLeft {
        client_guid: Uuid,
        ctrl_type: ControlType,
    },
    CharacterChanged {
        client_guid: Uuid,
        ctrl_type: ControlType,
        new_character: usize,
    },
    ChangedReady {
        client_guid: Uuid,
        ctrl_type: ControlType,
        ready: bool,
    },
    /// Server-authoritative; client-sent instances are logged and ignored.
    SettingsChanged {
        new_settings: MatchSettings,
    },
    /// Client: "my stage finished loading". Server: "go".
    StartRace,
    Chat {
        from: String,
        kind: ChatMessageType,
        text: String,
    },
    /// Client: vote to return to lobby. Server: return to lobby now.
    LoadLobby,
    CheckpointPassed {
        client_guid: Uuid,
        ctrl_type: ControlType,
        lap_time: f32,
    },
    DoneRacing {
        client_guid: Uuid,
        ctrl_type: ControlType,
        race_time: f64,
        disqualified: bool,
    },
    /// Warning that a player is close to being disqualified. `seconds_left`
    /// of zero clears a previously shown warning.
    RaceTimeout {
        client_guid: Uuid,
        ctrl_type: ControlType,
        seconds_left: f32,
    },
    AutoStartTimer {
        enabled: bool,
    },
    LoadRace,
}

impl MatchMessage {
    /// Serialize to the string carried inside a `Match` frame.
    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).expect("match message serialization cannot fail")
    }

    /// Deserialize from the string carried inside a `Match` frame.
    pub fn from_payload(payload: &str) -> Result<Self, PayloadError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Client descriptor embedded in the `Connect` handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub version: f32,
    pub is_testing: bool,
}

/// Projection of one connected client, as seen in a state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchClientState {
    pub guid: Uuid,
    pub name: String,
}

/// Projection of one active player, as seen in a state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchPlayerState {
    pub client_guid: Uuid,
    pub ctrl_type: ControlType,
    pub ready_to_race: bool,
    pub character_id: usize,
}

/// Full lobby/race view sent to a newly validated client so it can
/// reconstruct match state. Recomputed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchState {
    pub clients: Vec<MatchClientState>,
    pub players: Vec<MatchPlayerState>,
    pub settings: MatchSettings,
    pub in_race: bool,
    /// Seconds left on the auto-start timer, zero when it is not running.
    pub cur_auto_start_time: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::settings::{AllowedTiers, StageRotationMode};

    #[test]
    fn match_message_payload_round_trip() {
        let msg = MatchMessage::PlayerJoined {
            client_guid: Uuid::new_v4(),
            ctrl_type: ControlType::Joystick2,
            initial_character: 7,
        };
        let payload = msg.to_payload();
        match MatchMessage::from_payload(&payload).unwrap() {
            MatchMessage::PlayerJoined {
                ctrl_type,
                initial_character,
                ..
            } => {
                assert_eq!(ctrl_type, ControlType::Joystick2);
                assert_eq!(initial_character, 7);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_variant_tag_is_a_payload_error() {
        let err = MatchMessage::from_payload(r#"{"type":"warpDrive","clientGuid":"x"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn missing_fields_are_a_payload_error() {
        let err = MatchMessage::from_payload(r#"{"type":"playerJoined"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn match_state_round_trip() {
        let client_guid = Uuid::new_v4();
        let mut settings = MatchSettings::default();
        settings.stage_id = 3;
        settings.allowed_tiers = AllowedTiers::OddOnly;
        settings.stage_rotation_mode = StageRotationMode::Sequenced;

        let state = MatchState {
            clients: vec![MatchClientState {
                guid: client_guid,
                name: "racer".into(),
            }],
            players: vec![MatchPlayerState {
                client_guid,
                ctrl_type: ControlType::Keyboard,
                ready_to_race: true,
                character_id: 8,
            }],
            settings,
            in_race: true,
            cur_auto_start_time: 4.5,
        };

        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: MatchState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, state);
    }
}
