//! Frame classifier seam.
//!
//! The pose classifier itself lives outside this crate; the orchestrator
//! only needs a label per frame.

use crate::types::FrameSnapshot;
use async_trait::async_trait;
use std::collections::VecDeque;

/// Classifies one frame into a `<pose>_<phase>` label
#[async_trait]
pub trait FrameClassifier: Send {
    async fn classify(&mut self, exercise: &str, frame: &FrameSnapshot) -> Option<String>;
}

/// Replays a pre-recorded label stream, one label per frame
#[derive(Clone, Debug, Default)]
pub struct ScriptedClassifier {
    labels: VecDeque<Option<String>>,
}

impl ScriptedClassifier {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(|l| l.map(Into::into)).collect(),
        }
    }
}

#[async_trait]
impl FrameClassifier for ScriptedClassifier {
    async fn classify(&mut self, _exercise: &str, _frame: &FrameSnapshot) -> Option<String> {
        self.labels.pop_front().flatten()
    }
}

/// Never recognizes anything; used when the service decides repetitions
#[derive(Clone, Copy, Debug, Default)]
pub struct NullClassifier;

#[async_trait]
impl FrameClassifier for NullClassifier {
    async fn classify(&mut self, _exercise: &str, _frame: &FrameSnapshot) -> Option<String> {
        None
    }
}
