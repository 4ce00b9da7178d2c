//! Ordered exercise pipeline and progress tracking.
//!
//! The workout program (sets × repeats × exercises) is flattened into one
//! list of segments. Progress is a single counter of completed actions; the
//! current segment is derived from it by scanning cumulative prefix sums.

use crate::types::{ExerciseSegment, WorkoutSet};

/// Flat ordered list of exercise segments plus the completed-action counter
#[derive(Clone, Debug, Default)]
pub struct ExercisePipeline {
    segments: Vec<ExerciseSegment>,
    completed_actions: u32,
}

impl ExercisePipeline {
    pub fn new(segments: Vec<ExerciseSegment>) -> Self {
        Self {
            segments,
            completed_actions: 0,
        }
    }

    /// Flatten a workout program into one segment list
    ///
    /// Every repeat of every set contributes its exercises in order, so a set
    /// of `[squat×3, lunge×2]` with 2 repeats becomes four segments.
    pub fn from_program(sets: &[WorkoutSet]) -> Self {
        let mut segments = Vec::new();
        for set in sets {
            for _ in 0..set.repeats {
                segments.extend(set.exercises.iter().cloned());
            }
        }
        Self::new(segments)
    }

    /// Resume with the first `completed_segments` segments already done
    pub fn resume_at(mut self, completed_segments: usize) -> Self {
        self.completed_actions = self.prefix_sum(completed_segments.min(self.segments.len()));
        self
    }

    pub fn segments(&self) -> &[ExerciseSegment] {
        &self.segments
    }

    pub fn completed_actions(&self) -> u32 {
        self.completed_actions
    }

    /// Sum of all segment counts
    pub fn total(&self) -> u32 {
        self.segments.iter().map(|s| s.count).sum()
    }

    /// Index of the current segment, `None` once the pipeline is finished
    pub fn position(&self) -> Option<usize> {
        let mut after = 0;
        for (idx, segment) in self.segments.iter().enumerate() {
            after += segment.count;
            if self.completed_actions < after {
                return Some(idx);
            }
        }
        None
    }

    pub fn current_segment(&self) -> Option<&ExerciseSegment> {
        self.position().map(|idx| &self.segments[idx])
    }

    pub fn is_finished(&self) -> bool {
        self.completed_actions >= self.total()
    }

    /// Fraction of actions completed; an empty pipeline counts as done
    pub fn progress(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 1.0;
        }
        f64::from(self.completed_actions.min(total)) / f64::from(total)
    }

    /// Repetitions left in the current segment
    pub fn actions_left_for_current(&self) -> u32 {
        match self.position() {
            Some(idx) => self.prefix_sum(idx + 1) - self.completed_actions,
            None => 0,
        }
    }

    /// Count one completed action; no-op once the pipeline is finished
    pub fn advance(&mut self) {
        if self.current_segment().is_none() {
            tracing::debug!("Pipeline finished, ignoring extra action");
            return;
        }
        self.completed_actions += 1;
    }

    /// Overwrite the segment at `position` and restart that slot
    ///
    /// Progress becomes the prefix sum of all segments before `position`, so
    /// partial progress on the replaced segment is discarded. Returns `false`
    /// when `position` is out of range.
    pub fn replace(&mut self, position: usize, segment: ExerciseSegment) -> bool {
        if position >= self.segments.len() {
            tracing::warn!(
                "Replace position {} out of range ({} segments)",
                position,
                self.segments.len()
            );
            return false;
        }
        tracing::info!(
            "Replacing segment {} ({} x{}) with {} x{}",
            position,
            self.segments[position].label,
            self.segments[position].count,
            segment.label,
            segment.count
        );
        self.segments[position] = segment;
        self.completed_actions = self.prefix_sum(position);
        true
    }

    fn prefix_sum(&self, end: usize) -> u32 {
        self.segments[..end].iter().map(|s| s.count).sum()
    }
}
