//! Context snapshot types published to subscribers.
//!
//! Snapshots are immutable once emitted. Raw frames and probes never appear
//! here; only derived summaries do.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audio::classifier::AudioClass;

/// Best single-word description of what the user is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextTag {
    FocusedWork,
    Meeting,
    MusicSession,
    Reading,
    Idle,
    Unknown,
}

/// Why a snapshot was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// The materiality test fired (tag or confidence change).
    Update,
    /// Forced liveness emission after the heartbeat interval.
    Heartbeat,
    /// Terminal snapshot sent during engine shutdown.
    Shutdown,
}

/// Digest of the screen modality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenSummary {
    /// First 200 characters of cleaned OCR text; empty when the modality is
    /// absent or below the confidence floor.
    pub digest: String,
    /// Top tokens by frequency, stopword-filtered.
    pub keywords: Vec<String>,
    /// In [0, 1]; decays while the summary is reused.
    pub confidence: f32,
}

impl ScreenSummary {
    pub fn empty() -> Self {
        Self {
            digest: String::new(),
            keywords: Vec::new(),
            confidence: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.digest.is_empty()
    }
}

/// Digest of the audio modality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSummary {
    pub class: AudioClass,
    pub source_app: Option<String>,
    /// In [0, 1].
    pub confidence: f32,
}

impl AudioSummary {
    pub fn empty() -> Self {
        Self {
            class: AudioClass::Unknown,
            source_app: None,
            confidence: 0.0,
        }
    }
}

/// The unified, immutable description of what the user is doing at a moment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    /// Strictly increasing within one engine run.
    pub seq: u64,
    /// Sequence number of the snapshot this one supersedes.
    pub parent_seq: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub kind: SnapshotKind,
    pub primary: ContextTag,
    /// Secondary reading when two tags apply (editor work over music).
    pub secondary: Option<ContextTag>,
    /// Overall confidence in [0, 1].
    pub confidence: f32,
    /// How consistent the two modalities are, in [0, 1].
    pub correlation: f32,
    pub screen: ScreenSummary,
    pub audio: AudioSummary,
    /// Frame id of the OCR result this snapshot drew on.
    pub ocr_frame_id: Option<u64>,
    /// Timestamp of that OCR result; never later than `timestamp`.
    pub ocr_timestamp: Option<DateTime<Utc>>,
    /// Timestamp of the audio classification drawn on; never later than
    /// `timestamp`.
    pub audio_timestamp: Option<DateTime<Utc>>,
}

impl ContextSnapshot {
    /// Content equality for coalescing: two snapshots with the same tags,
    /// summaries, and near-equal confidence are the same context.
    pub fn same_content(&self, other: &ContextSnapshot) -> bool {
        self.primary == other.primary
            && self.secondary == other.secondary
            && self.screen == other.screen
            && self.audio == other.audio
            && (self.confidence - other.confidence).abs() < 1e-3
    }
}
