//! Categorical classification of audio probes.
//!
//! ## Rule table (first match wins)
//!
//! | Condition | Class | Confidence |
//! |---|---|---|
//! | media metadata with a non-empty title | music | 0.95 |
//! | known media app in session list, volume > 10 | music | 0.90 |
//! | OS hint "call" or known call app in session list | call | 0.90 |
//! | volume > 50, no media metadata | music | 0.80 |
//! | 10 < volume ≤ 50 | ambient | 0.70 |
//! | volume ≤ 10, no active audio process | silence | 0.90 |
//! | otherwise | unknown | 0.40 |
//!
//! A trailing window of the last 5 decisions adds a +0.05 streak boost
//! (capped at 1.0) when they all agree.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AudioProbe;

/// What the machine is playing or hearing, categorically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioClass {
    Music,
    Speech,
    Call,
    Ambient,
    Silence,
    Unknown,
}

/// Derived from one probe (plus the trailing window); immutable once
/// produced. Retained in a bounded ring by the fusion engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioClassification {
    pub class: AudioClass,
    /// In [0, 1].
    pub confidence: f32,
    pub source_app: Option<String>,
    /// Free-form detail (track title, matched process, hint).
    pub detail: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// Trailing-window length for the streak boost.
const STREAK_WINDOW: usize = 5;
const STREAK_BOOST: f32 = 0.05;

/// Stateful probe classifier. One instance per audio lane.
pub struct AudioClassifier {
    known_media_apps: Vec<String>,
    known_call_apps: Vec<String>,
    recent: VecDeque<AudioClass>,
}

impl AudioClassifier {
    pub fn new(known_media_apps: Vec<String>, known_call_apps: Vec<String>) -> Self {
        Self {
            known_media_apps: lowered(known_media_apps),
            known_call_apps: lowered(known_call_apps),
            recent: VecDeque::with_capacity(STREAK_WINDOW),
        }
    }

    /// Classify one probe, folding it into the trailing window.
    pub fn classify(&mut self, probe: &AudioProbe) -> AudioClassification {
        let (class, base_confidence, source_app, detail) = self.apply_rules(probe);

        if self.recent.len() == STREAK_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(class);

        let streak = self.recent.len() == STREAK_WINDOW && self.recent.iter().all(|&c| c == class);
        let confidence = if streak {
            (base_confidence + STREAK_BOOST).min(1.0)
        } else {
            base_confidence
        };

        debug!(
            class = ?class,
            confidence = format_args!("{confidence:.2}"),
            streak,
            volume = probe.volume,
            "probe classified"
        );

        AudioClassification {
            class,
            confidence,
            source_app,
            detail,
            timestamp: probe.timestamp,
        }
    }

    pub fn reset(&mut self) {
        self.recent.clear();
    }

    fn apply_rules(
        &self,
        probe: &AudioProbe,
    ) -> (AudioClass, f32, Option<String>, BTreeMap<String, String>) {
        let mut detail = BTreeMap::new();

        // Media metadata with a real title is the strongest music signal.
        if let Some(title) = probe.media_title.as_deref().filter(|t| !t.trim().is_empty()) {
            detail.insert("title".into(), title.to_string());
            return (AudioClass::Music, 0.95, probe.media_app.clone(), detail);
        }

        if probe.volume > 10 {
            if let Some(app) = self.match_process(&probe.audio_processes, &self.known_media_apps) {
                detail.insert("matchedProcess".into(), app.clone());
                return (AudioClass::Music, 0.90, Some(app), detail);
            }
        }

        let hinted_call = probe
            .category_hint
            .as_deref()
            .map(|h| h.eq_ignore_ascii_case("call"))
            .unwrap_or(false);
        let call_app = self.match_process(&probe.audio_processes, &self.known_call_apps);
        if hinted_call || call_app.is_some() {
            if let Some(hint) = probe.category_hint.as_deref() {
                detail.insert("hint".into(), hint.to_string());
            }
            return (AudioClass::Call, 0.90, call_app, detail);
        }

        // Loud output with no metadata at all is still most likely music,
        // at reduced confidence.
        if probe.volume > 50 {
            return (AudioClass::Music, 0.80, None, detail);
        }

        if probe.volume > 10 {
            return (AudioClass::Ambient, 0.70, None, detail);
        }

        if probe.audio_processes.is_empty() {
            return (AudioClass::Silence, 0.90, None, detail);
        }

        (AudioClass::Unknown, 0.40, None, detail)
    }

    fn match_process(&self, processes: &[String], known: &[String]) -> Option<String> {
        processes
            .iter()
            .find(|p| {
                let lowered = p.to_ascii_lowercase();
                known.iter().any(|k| lowered.contains(k))
            })
            .cloned()
    }
}

fn lowered(names: Vec<String>) -> Vec<String> {
    names.into_iter().map(|n| n.to_ascii_lowercase()).collect()
}
