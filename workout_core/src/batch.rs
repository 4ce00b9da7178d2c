//! Proof-of-work batches.
//!
//! Frames and completion records are buffered until more than
//! `frame_threshold` frames are held, then sealed into an immutable
//! [`SessionBatch`]. The proof is a SHA-256 digest (base64) of the canonical
//! JSON body followed by the session token, computed once at seal time.

use crate::types::{CompletionRecord, FrameMeta, FrameSnapshot};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use uuid::Uuid;

/// Everything in a batch except its proof, in wire field order
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BatchBody {
    #[serde(rename = "total_time")]
    pub total_time_seconds: u64,
    #[serde(rename = "frame")]
    pub frame_meta: FrameMeta,
    pub exercises: Vec<CompletionRecord>,
    pub frames: Vec<FrameSnapshot>,
}

impl BatchBody {
    /// Digest binding this body to the session token
    pub fn proof(&self, token: &str) -> crate::Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hasher.update(token.as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(hasher.finalize()))
    }
}

/// A sealed, immutable batch ready for upload
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SessionBatch {
    #[serde(flatten)]
    body: BatchBody,
    proof: String,
    /// Sent as an idempotency key, never part of the proof
    #[serde(skip)]
    id: Uuid,
}

impl SessionBatch {
    fn seal(body: BatchBody, token: &str) -> crate::Result<Self> {
        let proof = body.proof(token)?;
        Ok(Self {
            body,
            proof,
            id: Uuid::new_v4(),
        })
    }

    pub fn body(&self) -> &BatchBody {
        &self.body
    }

    pub fn proof(&self) -> &str {
        &self.proof
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn frame_count(&self) -> usize {
        self.body.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.frames.is_empty() && self.body.exercises.is_empty()
    }
}

/// Buffers frames and completions between seals
#[derive(Debug)]
pub struct BatchAccumulator {
    token: String,
    frame_threshold: usize,
    frame_meta: FrameMeta,
    frames: Vec<FrameSnapshot>,
    completions: Vec<CompletionRecord>,
    started_at: Instant,
}

impl BatchAccumulator {
    pub fn new(token: impl Into<String>, frame_threshold: usize, frame_meta: FrameMeta) -> Self {
        Self {
            token: token.into(),
            frame_threshold,
            frame_meta,
            frames: Vec::with_capacity(frame_threshold + 1),
            completions: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn set_frame_meta(&mut self, meta: FrameMeta) {
        self.frame_meta = meta;
    }

    /// Restart the batch clock without touching buffered data
    pub fn restart_clock(&mut self) {
        self.started_at = Instant::now();
    }

    pub fn buffered_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn append_frame(&mut self, snapshot: FrameSnapshot) {
        if let Some(last) = self.frames.last() {
            if snapshot.frame_id <= last.frame_id {
                tracing::warn!(
                    "Out-of-order frame {} after {}, dropping",
                    snapshot.frame_id,
                    last.frame_id
                );
                return;
            }
        }
        self.frames.push(snapshot);
    }

    pub fn append_completion(&mut self, record: CompletionRecord) {
        if let Some(last) = self.completions.last() {
            if record.frame_id < last.frame_id {
                tracing::warn!(
                    "Out-of-order completion at frame {} after {}, dropping",
                    record.frame_id,
                    last.frame_id
                );
                return;
            }
        }
        self.completions.push(record);
    }

    /// Seal once more than `frame_threshold` frames are buffered
    pub fn seal_if_ready(&mut self) -> crate::Result<Option<SessionBatch>> {
        if self.frames.len() <= self.frame_threshold {
            return Ok(None);
        }
        self.seal().map(Some)
    }

    /// Seal whatever is buffered, regardless of the threshold
    pub fn seal_final(&mut self) -> crate::Result<SessionBatch> {
        self.seal()
    }

    fn seal(&mut self) -> crate::Result<SessionBatch> {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.started_at);
        let body = BatchBody {
            total_time_seconds: elapsed.as_secs_f64().round() as u64,
            frame_meta: self.frame_meta,
            exercises: std::mem::take(&mut self.completions),
            frames: std::mem::replace(
                &mut self.frames,
                Vec::with_capacity(self.frame_threshold + 1),
            ),
        };
        let batch = SessionBatch::seal(body, &self.token)?;
        self.started_at = now;

        tracing::debug!(
            batch_id = %batch.id(),
            frames = batch.frame_count(),
            completions = batch.body().exercises.len(),
            total_time = batch.body().total_time_seconds,
            "Sealed batch"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PosePoint;
    use std::time::Duration;

    fn frame(frame_id: u64) -> FrameSnapshot {
        FrameSnapshot {
            frame_id,
            points: vec![PosePoint {
                x: 0.5,
                y: 0.25,
                z: -0.1,
                confidence: 0.9,
            }],
        }
    }

    fn accumulator() -> BatchAccumulator {
        BatchAccumulator::new("jwt-token", 80, FrameMeta::new(640, 480))
    }

    #[tokio::test]
    async fn test_seals_at_81_frames() {
        let mut acc = accumulator();
        for id in 1..=80 {
            acc.append_frame(frame(id));
            assert!(acc.seal_if_ready().unwrap().is_none());
        }

        acc.append_frame(frame(81));
        let batch = acc.seal_if_ready().unwrap().expect("batch at 81 frames");
        assert_eq!(batch.frame_count(), 81);
        assert_eq!(batch.body().frames.first().map(|f| f.frame_id), Some(1));
        assert_eq!(batch.body().frames.last().map(|f| f.frame_id), Some(81));
        assert_eq!(acc.buffered_frames(), 0);
    }

    #[tokio::test]
    async fn test_empty_seals_stay_empty() {
        let mut acc = accumulator();
        assert!(acc.seal_if_ready().unwrap().is_none());
        assert!(acc.seal_final().unwrap().is_empty());
        assert!(acc.seal_final().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_seal_final_keeps_completions() {
        let mut acc = accumulator();
        acc.append_frame(frame(1));
        acc.append_frame(frame(2));
        acc.append_completion(CompletionRecord {
            frame_id: 2,
            label: "squat".into(),
        });

        let batch = acc.seal_final().unwrap();
        assert_eq!(batch.frame_count(), 2);
        assert_eq!(batch.body().exercises.len(), 1);
        assert!(acc.seal_final().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_time_measured_at_seal() {
        let mut acc = accumulator();
        acc.append_frame(frame(1));
        tokio::time::advance(Duration::from_millis(4600)).await;
        let first = acc.seal_final().unwrap();
        assert_eq!(first.body().total_time_seconds, 5);

        tokio::time::advance(Duration::from_secs(2)).await;
        let second = acc.seal_final().unwrap();
        assert_eq!(second.body().total_time_seconds, 2);
    }

    #[test]
    fn test_proof_is_deterministic() {
        let body = BatchBody {
            total_time_seconds: 12,
            frame_meta: FrameMeta::new(640, 480),
            exercises: vec![CompletionRecord {
                frame_id: 3,
                label: "squat".into(),
            }],
            frames: vec![frame(1), frame(2), frame(3)],
        };

        let a = body.proof("token").unwrap();
        let b = body.clone().proof("token").unwrap();
        assert_eq!(a, b);

        let mut changed = body.clone();
        changed.total_time_seconds = 13;
        assert_ne!(changed.proof("token").unwrap(), a);

        let mut changed = body.clone();
        changed.frames[1].points[0].x = 0.51;
        assert_ne!(changed.proof("token").unwrap(), a);

        let mut changed = body.clone();
        changed.exercises[0].label = "lunge".into();
        assert_ne!(changed.proof("token").unwrap(), a);

        assert_ne!(body.proof("other-token").unwrap(), a);
    }

    #[test]
    fn test_wire_format() {
        let body = BatchBody {
            total_time_seconds: 1,
            frame_meta: FrameMeta::new(640, 480),
            exercises: vec![],
            frames: vec![],
        };
        let batch = SessionBatch::seal(body, "t").unwrap();
        let json = serde_json::to_value(&batch).unwrap();

        assert_eq!(json["total_time"], 1);
        assert_eq!(json["frame"]["width"], 640);
        assert_eq!(json["frame"]["orientation"], "horizontal");
        assert_eq!(json["proof"], batch.proof());
        assert!(json.get("id").is_none());
    }

    #[tokio::test]
    async fn test_out_of_order_frames_dropped() {
        let mut acc = accumulator();
        acc.append_frame(frame(5));
        acc.append_frame(frame(4));
        acc.append_frame(frame(6));
        assert_eq!(acc.buffered_frames(), 2);
    }
}
