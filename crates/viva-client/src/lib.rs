//! Caller-side decoder for the relay's re-emitted stream.
//!
//! The relay speaks the same `data: <json>` framing as the upstream
//! protocol, chunked arbitrarily by whatever transport sits in between, so
//! the consumer runs the identical frame decoder and folds the tagged
//! payloads into transcript state.

use tracing::debug;
use uuid::Uuid;

use viva_types::event::TokenUsage;
use viva_types::relay::RelayFrame;
use viva_types::wire::FrameDecoder;

/// One rendered transcript entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Interviewee,
    System,
}

/// Per-interview statistics shown alongside the transcript.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnStats {
    /// Completed turns this connection.
    pub answered: u64,
    /// Latest cumulative totals as reported by the relay. Replaced on each
    /// `done` frame, never summed locally.
    pub usage: TokenUsage,
}

/// Incrementally reconstructed view of one turn stream.
#[derive(Debug, Default)]
pub struct Transcript {
    pub entries: Vec<TranscriptEntry>,
    pub stats: TurnStats,
    pub interview_id: Option<Uuid>,
    /// Set once an `error` frame arrives; the remainder of that turn is
    /// ignored. Cleared when the next turn's frames begin.
    pub failed: bool,
    turn_open: bool,
}

impl Transcript {
    fn append_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.turn_open {
            self.entries.push(TranscriptEntry {
                speaker: Speaker::Interviewee,
                text: String::new(),
            });
            self.turn_open = true;
        }
        if let Some(entry) = self.entries.last_mut() {
            entry.text.push_str(text);
        }
    }

    fn apply(&mut self, frame: RelayFrame) {
        match frame {
            RelayFrame::Message { event } => {
                // The relay closes a turn's stream right after an error
                // frame, so a message frame means the next turn has begun.
                self.failed = false;
                let text: String = event.text_fragments().collect();
                self.append_text(&text);
            }
            RelayFrame::Done {
                event,
                interview_id,
            } => {
                self.failed = false;
                let text: String = event.text_fragments().collect();
                self.append_text(&text);
                if let Some(usage) = event.token_usage() {
                    self.stats.usage = usage;
                }
                self.stats.answered += 1;
                if interview_id.is_some() {
                    self.interview_id = interview_id;
                }
                self.turn_open = false;
            }
            RelayFrame::Error { error } => {
                if self.failed {
                    debug!("ignoring repeated error frame");
                    return;
                }
                self.entries.push(TranscriptEntry {
                    speaker: Speaker::System,
                    text: format!("[interview interrupted: {error}]"),
                });
                self.failed = true;
                self.turn_open = false;
            }
        }
    }
}

/// Feeds raw relay bytes through the frame decoder into a [`Transcript`].
#[derive(Default)]
pub struct StreamConsumer {
    decoder: FrameDecoder<RelayFrame>,
    transcript: Transcript,
}

impl StreamConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one read's worth of bytes, at whatever boundary the
    /// transport produced them.
    pub fn push_bytes(&mut self, chunk: &[u8]) {
        for frame in self.decoder.feed(chunk) {
            self.transcript.apply(frame);
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// The stream is over; hand back the final state.
    pub fn into_transcript(self) -> Transcript {
        self.decoder.finish();
        self.transcript
    }
}
