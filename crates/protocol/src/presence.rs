//! Presence/activity value objects and their wire representation.

use serde::{Deserialize, Serialize};

/// A button attached to an activity: a label and a target URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub url: String,
}

/// An immutable presence snapshot.
///
/// Constructed fresh per update and never mutated afterwards; the
/// controller builds one of these from caller-supplied track metadata and
/// resolved artwork, and the queue delivers it as an op-3 payload via
/// [`Presence::to_update`].
#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    pub name: String,
    pub state: Option<String>,
    pub details: Option<String>,
    /// Start/end timestamps in epoch milliseconds.
    pub start: Option<i64>,
    pub end: Option<i64>,
    /// Resolved asset references, not raw URLs.
    pub large_image: Option<String>,
    pub small_image: Option<String>,
    pub large_text: Option<String>,
    pub small_text: Option<String>,
    /// At most two buttons.
    pub buttons: Vec<Button>,
    pub application_id: Option<String>,
    /// Numeric activity type (0 = playing, 2 = listening, ...).
    pub activity_type: u8,
    /// Online-status string ("online", "idle", "dnd").
    pub status: String,
}

impl Presence {
    /// Maps this snapshot into the wire-level op-3 payload.
    pub fn to_update(&self) -> PresenceUpdate {
        let timestamps = if self.start.is_some() || self.end.is_some() {
            Some(Timestamps {
                start: self.start,
                end: self.end,
            })
        } else {
            None
        };

        let assets = if self.large_image.is_some() || self.small_image.is_some() {
            Some(Assets {
                large_image: self.large_image.clone(),
                large_text: self.large_text.clone(),
                small_image: self.small_image.clone(),
                small_text: self.small_text.clone(),
            })
        } else {
            None
        };

        // Labels go in `buttons`, URLs ride separately in `metadata`.
        let (buttons, metadata) = if self.buttons.is_empty() {
            (None, None)
        } else {
            let labels = self.buttons.iter().map(|b| b.label.clone()).collect();
            let urls = self.buttons.iter().map(|b| b.url.clone()).collect();
            (Some(labels), Some(ActivityMetadata { button_urls: urls }))
        };

        PresenceUpdate {
            activities: vec![Activity {
                name: self.name.clone(),
                kind: self.activity_type,
                state: self.state.clone(),
                details: self.details.clone(),
                application_id: self.application_id.clone(),
                timestamps,
                assets,
                buttons,
                metadata,
            }],
            status: self.status.clone(),
            since: self.start,
            afk: false,
        }
    }
}

/// Wire-level activity object inside an op-3 payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<Timestamps>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<Assets>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buttons: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ActivityMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestamps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityMetadata {
    pub button_urls: Vec<String>,
}

/// Op-3 payload: the full presence update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub activities: Vec<Activity>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    pub afk: bool,
}
