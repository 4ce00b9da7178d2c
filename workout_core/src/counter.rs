//! Repetition debouncer.
//!
//! The classifier emits a `<pose>_<phase>` label every frame (e.g.
//! `star_up`). A label is accepted only after it persists for
//! `required_frames` consecutive frames, and only a change of phase for a
//! pose counts as a transition. A repetition is reported when an accepted
//! transition lands on the pose's key-moment phase and at least one
//! transition was accepted before it.

use std::collections::HashMap;

/// Consecutive frames a label must persist at the given capture rate
pub fn required_frames(fps: f32) -> u32 {
    let frames = (3.0 * fps / 30.0).round();
    if frames.is_finite() && frames >= 1.0 {
        frames as u32
    } else {
        1
    }
}

/// Converts a noisy per-frame label stream into repetition events
#[derive(Clone, Debug)]
pub struct RepetitionCounter {
    key_moments: HashMap<String, String>,
    required_frames: u32,
    current_label: String,
    consecutive: u32,
    last_phase_by_pose: HashMap<String, String>,
    has_accepted_any: bool,
}

impl RepetitionCounter {
    pub fn new(key_moments: HashMap<String, String>, fps: f32) -> Self {
        Self {
            key_moments,
            required_frames: required_frames(fps),
            current_label: String::new(),
            consecutive: 0,
            last_phase_by_pose: HashMap::new(),
            has_accepted_any: false,
        }
    }

    pub fn required_frames(&self) -> u32 {
        self.required_frames
    }

    /// Retune for a new capture frame rate
    pub fn update_threshold(&mut self, fps: f32) {
        let frames = required_frames(fps);
        if frames != self.required_frames {
            tracing::debug!(
                "Debounce threshold {} -> {} frames (fps {:.1})",
                self.required_frames,
                frames,
                fps
            );
            self.required_frames = frames;
        }
    }

    /// Feed one classified frame; returns the pose name on a repetition
    ///
    /// `None` and the empty label take part in the consecutive count like any
    /// other label. Labels without a `_phase` suffix never match.
    pub fn step(&mut self, label: Option<&str>) -> Option<String> {
        let label = label.unwrap_or("");

        if label == self.current_label {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            self.current_label.clear();
            self.current_label.push_str(label);
            self.consecutive = 1;
        }

        if self.consecutive < self.required_frames {
            return None;
        }

        let (pose, phase) = label.rsplit_once('_')?;
        if pose.is_empty() || phase.is_empty() {
            return None;
        }

        if self.last_phase_by_pose.get(pose).map(String::as_str) == Some(phase) {
            return None;
        }
        self.last_phase_by_pose
            .insert(pose.to_string(), phase.to_string());

        let is_key_moment = self.key_moments.get(pose).map(String::as_str) == Some(phase);
        let matched = is_key_moment && self.has_accepted_any;
        self.has_accepted_any = true;

        if matched {
            tracing::debug!("Repetition of '{}' at phase '{}'", pose, phase);
            Some(pose.to_string())
        } else {
            tracing::trace!("Accepted transition {} -> {}", pose, phase);
            None
        }
    }
}
