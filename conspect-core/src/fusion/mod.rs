//! Context fusion: reconciles OCR results and audio classifications into a
//! single evolving `ContextSnapshot`.
//!
//! ## Per-input recompute
//!
//! ```text
//! 1. Screen summary: digest + keywords when OCR confidence ≥ floor,
//!    otherwise the previous summary with confidence × 0.8 per cadence
//! 2. Audio summary: most recent classification
//! 3. Primary tag: decision table over keyword hits and audio class
//! 4. Correlation: 1.0 agree / 0.5 one-neutral / 0.0 conflict
//! 5. Confidence: (0.6·ocr + 0.4·audio) · correlation, clamped to [0, 1]
//! 6. Materiality: emit iff tag changed, confidence moved ≥ delta, or the
//!    heartbeat interval elapsed
//! ```
//!
//! A modality silent for longer than the modality timeout is dropped; the
//! engine continues from the survivor. With both gone it emits `unknown`
//! heartbeats so subscribers can still observe liveness.

pub mod context;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::audio::classifier::{AudioClass, AudioClassification};
use crate::ocr::OcrResult;
use context::{AudioSummary, ContextSnapshot, ContextTag, ScreenSummary, SnapshotKind};

/// Recent-result ring lengths.
const OCR_HISTORY: usize = 20;
const AUDIO_HISTORY: usize = 20;

/// Screen-confidence decay applied per elapsed frame cadence while a stale
/// summary is reused.
const DECAY_PER_CADENCE: f32 = 0.8;

/// Modality weights for the overall confidence.
const OCR_WEIGHT: f32 = 0.6;
const AUDIO_WEIGHT: f32 = 0.4;

#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// OCR results below this confidence do not refresh the screen summary.
    pub min_ocr_confidence: f32,
    /// Forced emission interval.
    pub heartbeat: Duration,
    /// Confidence movement that makes a candidate material.
    pub confidence_delta: f32,
    /// Nominal frame cadence, used as the decay step.
    pub frame_cadence: Duration,
    /// A modality silent this long is treated as absent.
    pub modality_timeout: Duration,
    /// Digest length in characters.
    pub digest_chars: usize,
    /// Keyword set size.
    pub keyword_count: usize,
    pub editor_keywords: Vec<String>,
    pub meeting_keywords: Vec<String>,
    pub reader_keywords: Vec<String>,
    pub stopwords: Vec<String>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_ocr_confidence: 0.3,
            heartbeat: Duration::from_millis(30_000),
            confidence_delta: 0.15,
            frame_cadence: Duration::from_millis(5_000),
            modality_timeout: Duration::from_secs(60),
            digest_chars: 200,
            keyword_count: 5,
            editor_keywords: default_set(&[
                "fn ", "function", "import", "def ", "class ", "const ", "let ", ">>>", "cargo",
                "#include",
            ]),
            meeting_keywords: default_set(&[
                "mute",
                "unmute",
                "leave meeting",
                "share screen",
                "participants",
                "recording",
            ]),
            reader_keywords: default_set(&[
                "chapter",
                "abstract",
                "references",
                "contents",
                "introduction",
                "page",
            ]),
            stopwords: default_set(&[
                "the", "and", "for", "that", "with", "this", "from", "have", "are", "was", "not",
                "but", "you", "all", "can", "your", "will",
            ]),
        }
    }
}

fn default_set(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Screen summary source retained between frames for reuse and decay.
struct ScreenState {
    digest: String,
    keywords: Vec<String>,
    base_confidence: f32,
    captured_at: Instant,
    frame_id: u64,
    timestamp: DateTime<Utc>,
}

/// Owns the current snapshot and the emission decision. Driven by the
/// fusion lane; not internally synchronized.
pub struct FusionEngine {
    config: FusionConfig,
    seq: u64,
    current: Option<Arc<ContextSnapshot>>,
    last_emit: Option<Instant>,
    screen: Option<ScreenState>,
    audio: Option<AudioClassification>,
    last_ocr_at: Option<Instant>,
    last_audio_at: Option<Instant>,
    ocr_history: VecDeque<OcrResult>,
    audio_history: VecDeque<AudioClassification>,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            seq: 0,
            current: None,
            last_emit: None,
            screen: None,
            audio: None,
            last_ocr_at: None,
            last_audio_at: None,
            ocr_history: VecDeque::with_capacity(OCR_HISTORY),
            audio_history: VecDeque::with_capacity(AUDIO_HISTORY),
        }
    }

    /// Fold in one OCR result; returns a snapshot when material.
    pub fn ingest_ocr(&mut self, result: OcrResult) -> Option<Arc<ContextSnapshot>> {
        self.last_ocr_at = Some(Instant::now());

        if result.confidence >= self.config.min_ocr_confidence && !result.text.is_empty() {
            self.screen = Some(ScreenState {
                digest: digest(&result.text, self.config.digest_chars),
                keywords: extract_keywords(
                    &result.text,
                    &self.config.stopwords,
                    self.config.keyword_count,
                ),
                base_confidence: result.confidence,
                captured_at: Instant::now(),
                frame_id: result.frame_id,
                timestamp: result.timestamp,
            });
        }
        // Below the floor: previous summary is reused; decay happens at
        // summary-build time from `captured_at`.

        if self.ocr_history.len() == OCR_HISTORY {
            self.ocr_history.pop_front();
        }
        self.ocr_history.push_back(result);

        self.consider(SnapshotKind::Update)
    }

    /// Fold in one audio classification; returns a snapshot when material.
    pub fn ingest_audio(&mut self, classification: AudioClassification) -> Option<Arc<ContextSnapshot>> {
        self.last_audio_at = Some(Instant::now());

        if self.audio_history.len() == AUDIO_HISTORY {
            self.audio_history.pop_front();
        }
        self.audio_history.push_back(classification.clone());
        self.audio = Some(classification);

        self.consider(SnapshotKind::Update)
    }

    /// Periodic tick: expire stale modalities and force a heartbeat when
    /// the interval has elapsed without a material emission.
    pub fn on_tick(&mut self) -> Option<Arc<ContextSnapshot>> {
        self.expire_stale_modalities();

        let due = match self.last_emit {
            None => true,
            Some(at) => at.elapsed() >= self.config.heartbeat,
        };
        if !due {
            return None;
        }
        let candidate = self.build_candidate(SnapshotKind::Heartbeat);
        Some(self.emit(candidate))
    }

    /// Terminal snapshot for cooperative shutdown: confidence 0, delivered
    /// to every subscriber so they observe the end of the stream.
    pub fn terminal(&mut self) -> Arc<ContextSnapshot> {
        let snapshot = ContextSnapshot {
            seq: self.seq,
            parent_seq: self.current.as_ref().map(|c| c.seq),
            timestamp: Utc::now(),
            kind: SnapshotKind::Shutdown,
            primary: ContextTag::Unknown,
            secondary: None,
            confidence: 0.0,
            correlation: 0.0,
            screen: ScreenSummary::empty(),
            audio: AudioSummary::empty(),
            ocr_frame_id: None,
            ocr_timestamp: None,
            audio_timestamp: None,
        };
        self.emit(snapshot)
    }

    pub fn current(&self) -> Option<Arc<ContextSnapshot>> {
        self.current.clone()
    }

    pub fn recent_ocr(&self) -> &VecDeque<OcrResult> {
        &self.ocr_history
    }

    pub fn recent_audio(&self) -> &VecDeque<AudioClassification> {
        &self.audio_history
    }

    // ── Candidate construction ───────────────────────────────────────────

    fn expire_stale_modalities(&mut self) {
        let timeout = self.config.modality_timeout;
        if self
            .last_ocr_at
            .map(|at| at.elapsed() > timeout)
            .unwrap_or(false)
        {
            if self.screen.is_some() {
                info!("screen modality silent past timeout — continuing audio-only");
            }
            self.screen = None;
        }
        if self
            .last_audio_at
            .map(|at| at.elapsed() > timeout)
            .unwrap_or(false)
        {
            if self.audio.is_some() {
                info!("audio modality silent past timeout — continuing screen-only");
            }
            self.audio = None;
        }
    }

    fn screen_summary(&self) -> (ScreenSummary, Option<u64>, Option<DateTime<Utc>>) {
        match &self.screen {
            Some(state) => {
                let cadences =
                    (state.captured_at.elapsed().as_millis()
                        / self.config.frame_cadence.as_millis().max(1)) as u32;
                let confidence =
                    state.base_confidence * DECAY_PER_CADENCE.powi(cadences as i32);
                (
                    ScreenSummary {
                        digest: state.digest.clone(),
                        keywords: state.keywords.clone(),
                        confidence,
                    },
                    Some(state.frame_id),
                    Some(state.timestamp),
                )
            }
            None => (ScreenSummary::empty(), None, None),
        }
    }

    fn build_candidate(&self, kind: SnapshotKind) -> ContextSnapshot {
        let (screen, ocr_frame_id, ocr_timestamp) = self.screen_summary();
        let audio = match &self.audio {
            Some(c) => AudioSummary {
                class: c.class,
                source_app: c.source_app.clone(),
                confidence: c.confidence,
            },
            None => AudioSummary::empty(),
        };
        let audio_timestamp = self.audio.as_ref().map(|c| c.timestamp);

        let has_text = !screen.is_empty() && screen.confidence >= self.config.min_ocr_confidence;
        let text = if has_text {
            Some(screen.digest.as_str())
        } else {
            None
        };
        let audio_class = self.audio.as_ref().map(|c| c.class);

        let (primary, secondary) = self.decide_tag(text, audio_class);
        let correlation = self.correlation(primary, text, audio_class);
        let confidence = ((OCR_WEIGHT * screen.confidence + AUDIO_WEIGHT * audio.confidence)
            * correlation)
            .clamp(0.0, 1.0);

        ContextSnapshot {
            seq: 0, // assigned at emit
            parent_seq: None,
            timestamp: Utc::now(),
            kind,
            primary,
            secondary,
            confidence,
            correlation,
            screen,
            audio,
            ocr_frame_id,
            ocr_timestamp,
            audio_timestamp,
        }
    }

    fn decide_tag(
        &self,
        text: Option<&str>,
        audio: Option<AudioClass>,
    ) -> (ContextTag, Option<ContextTag>) {
        let meeting_kw = text.map(|t| contains_any(t, &self.config.meeting_keywords));
        let editor_kw = text.map(|t| contains_any(t, &self.config.editor_keywords));
        let reader_kw = text.map(|t| contains_any(t, &self.config.reader_keywords));

        if meeting_kw == Some(true) || audio == Some(AudioClass::Call) {
            return (ContextTag::Meeting, None);
        }

        if editor_kw == Some(true) {
            return match audio {
                Some(AudioClass::Music) => {
                    (ContextTag::FocusedWork, Some(ContextTag::MusicSession))
                }
                _ => (ContextTag::FocusedWork, None),
            };
        }

        if reader_kw == Some(true)
            && matches!(
                audio,
                None | Some(AudioClass::Silence) | Some(AudioClass::Ambient)
            )
        {
            return (ContextTag::Reading, None);
        }

        if text.is_none() {
            return match audio {
                Some(AudioClass::Music) => (ContextTag::MusicSession, None),
                Some(AudioClass::Silence) => (ContextTag::Idle, None),
                _ => (ContextTag::Unknown, None),
            };
        }

        (ContextTag::Unknown, None)
    }

    fn correlation(
        &self,
        tag: ContextTag,
        text: Option<&str>,
        audio: Option<AudioClass>,
    ) -> f32 {
        let meeting_kw = text
            .map(|t| contains_any(t, &self.config.meeting_keywords))
            .unwrap_or(false);
        let editor_kw = text
            .map(|t| contains_any(t, &self.config.editor_keywords))
            .unwrap_or(false);

        match tag {
            ContextTag::Meeting => {
                let call = audio == Some(AudioClass::Call);
                if call && meeting_kw {
                    1.0
                } else if call && editor_kw {
                    // The screen outright disagrees: call audio dominates
                    // but the modalities conflict.
                    0.0
                } else {
                    0.5
                }
            }
            ContextTag::FocusedWork => match audio {
                Some(AudioClass::Silence) | Some(AudioClass::Ambient) => 1.0,
                _ => 0.5,
            },
            ContextTag::Reading => match audio {
                Some(AudioClass::Silence) | Some(AudioClass::Ambient) => 1.0,
                _ => 0.5,
            },
            // Only reachable when the audio class matches and the screen is
            // consistent (empty).
            ContextTag::MusicSession | ContextTag::Idle => 1.0,
            ContextTag::Unknown => 0.5,
        }
    }

    // ── Emission ─────────────────────────────────────────────────────────

    fn consider(&mut self, kind: SnapshotKind) -> Option<Arc<ContextSnapshot>> {
        let candidate = self.build_candidate(kind);

        let material = match &self.current {
            None => true,
            Some(current) => {
                candidate.primary != current.primary
                    || (candidate.confidence - current.confidence).abs()
                        >= self.config.confidence_delta
            }
        };
        let heartbeat_due = self
            .last_emit
            .map(|at| at.elapsed() >= self.config.heartbeat)
            .unwrap_or(false);

        if material {
            Some(self.emit(candidate))
        } else if heartbeat_due {
            let mut candidate = candidate;
            candidate.kind = SnapshotKind::Heartbeat;
            Some(self.emit(candidate))
        } else {
            // Identical-enough content coalesces into the current snapshot.
            debug!(tag = ?candidate.primary, "candidate not material — coalesced");
            None
        }
    }

    fn emit(&mut self, mut snapshot: ContextSnapshot) -> Arc<ContextSnapshot> {
        snapshot.seq = self.seq;
        snapshot.parent_seq = self.current.as_ref().map(|c| c.seq);
        self.seq += 1;

        let snapshot = Arc::new(snapshot);
        self.current = Some(Arc::clone(&snapshot));
        self.last_emit = Some(Instant::now());
        debug!(
            seq = snapshot.seq,
            tag = ?snapshot.primary,
            confidence = format_args!("{:.2}", snapshot.confidence),
            correlation = format_args!("{:.1}", snapshot.correlation),
            kind = ?snapshot.kind,
            "context snapshot emitted"
        );
        snapshot
    }
}

// ── Text digestion ───────────────────────────────────────────────────────

fn digest(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Top tokens by frequency; ties broken lexicographically so the set is
/// deterministic. Tokens shorter than 3 chars and stopwords are skipped.
fn extract_keywords(text: &str, stopwords: &[String], count: usize) -> Vec<String> {
    let mut freq: HashMap<String, usize> = HashMap::new();
    for token in text.split(|c: char| !c.is_alphanumeric()) {
        let token = token.to_lowercase();
        if token.len() < 3 || stopwords.iter().any(|s| s == &token) {
            continue;
        }
        *freq.entry(token).or_default() += 1;
    }
    let mut ranked: Vec<(String, usize)> = freq.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(count).map(|(t, _)| t).collect()
}

fn contains_any(text: &str, needles: &[String]) -> bool {
    let lowered = text.to_lowercase();
    needles
        .iter()
        .any(|n| !n.is_empty() && lowered.contains(&n.to_lowercase()))
}
