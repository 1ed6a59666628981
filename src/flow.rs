//! Backpressure between the data-plane socket and the render sink.
//!
//! The controller counts bytes that arrived from the wire but have not been
//! confirmed rendered (the *watermark*). Above the high threshold it asks the
//! server to pause the PTY; once the sink catches up below the low threshold
//! it sends a resume. Chunks are coalesced into one batch per rendering frame.
//!
//! Everything here is synchronous bookkeeping. Timers and sends are returned
//! as [`FlowAction`]s for the session driver to carry out.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Client environment class. Slow renderers get lower thresholds so they
/// pause earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowProfile {
    #[default]
    Desktop,
    Constrained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowThresholds {
    pub high: usize,
    pub low: usize,
    pub hard_cap: usize,
    pub pause_retry: Duration,
    pub emergency: Duration,
}

impl FlowThresholds {
    pub fn for_profile(profile: FlowProfile) -> Self {
        match profile {
            FlowProfile::Desktop => Self {
                high: 100_000,
                low: 10_000,
                hard_cap: 1_000_000,
                pause_retry: Duration::from_millis(500),
                emergency: Duration::from_secs(5),
            },
            FlowProfile::Constrained => Self {
                high: 30_000,
                low: 3_000,
                hard_cap: 300_000,
                pause_retry: Duration::from_millis(500),
                emergency: Duration::from_secs(5),
            },
        }
    }
}

impl Default for FlowThresholds {
    fn default() -> Self {
        Self::for_profile(FlowProfile::Desktop)
    }
}

/// Side effects requested by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowAction {
    SendPause,
    SendResume,
    /// Deliver the queued chunks on the next rendering frame.
    ScheduleFlush,
    ArmPauseRetry(Duration),
    CancelPauseRetry,
    ArmEmergency(Duration),
    CancelEmergency,
}

/// A batch ready for the render sink, tagged with the generation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderBatch {
    pub generation: u64,
    pub data: Bytes,
}

#[derive(Debug)]
pub struct FlowController {
    thresholds: FlowThresholds,
    watermark: usize,
    pause_sent: bool,
    pause_confirm_pending: bool,
    generation: u64,
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    flush_scheduled: bool,
}

impl FlowController {
    pub fn new(thresholds: FlowThresholds) -> Self {
        Self {
            thresholds,
            watermark: 0,
            pause_sent: false,
            pause_confirm_pending: false,
            generation: 0,
            queue: VecDeque::new(),
            queued_bytes: 0,
            flush_scheduled: false,
        }
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_paused(&self) -> bool {
        self.pause_sent
    }

    pub fn pause_confirm_pending(&self) -> bool {
        self.pause_confirm_pending
    }

    pub fn thresholds(&self) -> &FlowThresholds {
        &self.thresholds
    }

    /// Forget everything belonging to the previous socket and adopt a new
    /// generation. Completions tagged with older generations are ignored
    /// from here on.
    pub fn reset(&mut self, generation: u64) {
        self.generation = generation;
        self.watermark = 0;
        self.pause_sent = false;
        self.pause_confirm_pending = false;
        self.queue.clear();
        self.queued_bytes = 0;
        self.flush_scheduled = false;
    }

    /// Account for a chunk from the wire and queue it for the next flush.
    pub fn on_data(&mut self, data: Bytes) -> Vec<FlowAction> {
        let mut actions = Vec::new();
        if data.is_empty() {
            return actions;
        }

        self.watermark = self
            .watermark
            .saturating_add(data.len())
            .min(self.thresholds.hard_cap);
        self.queued_bytes += data.len();
        self.queue.push_back(data);

        if !self.flush_scheduled {
            self.flush_scheduled = true;
            actions.push(FlowAction::ScheduleFlush);
        }

        if self.watermark > self.thresholds.high && !self.pause_sent {
            tracing::debug!(
                watermark = self.watermark,
                high = self.thresholds.high,
                "watermark above high threshold, pausing"
            );
            self.pause_sent = true;
            self.pause_confirm_pending = true;
            actions.push(FlowAction::SendPause);
            actions.push(FlowAction::ArmPauseRetry(self.thresholds.pause_retry));
            actions.push(FlowAction::ArmEmergency(self.thresholds.emergency));
        }

        actions
    }

    /// Drain the queue into a single batch. Clears the scheduled-flush flag
    /// even when the queue turned out empty.
    pub fn take_batch(&mut self) -> Option<RenderBatch> {
        self.flush_scheduled = false;
        if self.queue.is_empty() {
            return None;
        }

        let data = if self.queue.len() == 1 {
            self.queue.pop_front().unwrap_or_default()
        } else {
            let mut buf = BytesMut::with_capacity(self.queued_bytes);
            for chunk in self.queue.drain(..) {
                buf.extend_from_slice(&chunk);
            }
            buf.freeze()
        };
        self.queued_bytes = 0;

        Some(RenderBatch { generation: self.generation, data })
    }

    /// The sink finished rendering a batch of `len` bytes.
    pub fn on_rendered(&mut self, generation: u64, len: usize) -> Vec<FlowAction> {
        let mut actions = Vec::new();
        if generation != self.generation {
            tracing::trace!(
                generation,
                current = self.generation,
                "ignoring render completion from superseded connection"
            );
            return actions;
        }

        self.watermark = self.watermark.saturating_sub(len);

        if self.pause_sent {
            if self.watermark < self.thresholds.low {
                self.resume(&mut actions);
            } else {
                // Progress while paused pushes the emergency deadline back.
                actions.push(FlowAction::ArmEmergency(self.thresholds.emergency));
            }
        }

        actions
    }

    /// The server confirmed our pause.
    pub fn on_pause_ack(&mut self) -> Vec<FlowAction> {
        if !self.pause_confirm_pending {
            return Vec::new();
        }
        self.pause_confirm_pending = false;
        vec![FlowAction::CancelPauseRetry]
    }

    /// The pause-retry timer fired.
    pub fn on_pause_retry(&mut self) -> Vec<FlowAction> {
        if !(self.pause_sent && self.pause_confirm_pending) {
            return Vec::new();
        }
        tracing::debug!(watermark = self.watermark, "pause not acknowledged, re-sending");
        vec![
            FlowAction::SendPause,
            FlowAction::ArmPauseRetry(self.thresholds.pause_retry),
        ]
    }

    /// The emergency timer fired: the sink made no progress for the whole
    /// interval while paused. Drop the accounting and resume anyway.
    pub fn on_emergency(&mut self) -> Vec<FlowAction> {
        let mut actions = Vec::new();
        if !self.pause_sent {
            return actions;
        }
        tracing::warn!(
            watermark = self.watermark,
            "render sink stalled while paused, forcing resume"
        );
        self.watermark = 0;
        self.resume(&mut actions);
        actions
    }

    fn resume(&mut self, actions: &mut Vec<FlowAction>) {
        self.pause_sent = false;
        self.pause_confirm_pending = false;
        actions.push(FlowAction::SendResume);
        actions.push(FlowAction::CancelPauseRetry);
        actions.push(FlowAction::CancelEmergency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(len: usize) -> Bytes {
        Bytes::from(vec![b'x'; len])
    }

    fn desktop() -> FlowController {
        let mut flow = FlowController::new(FlowThresholds::for_profile(FlowProfile::Desktop));
        flow.reset(1);
        flow
    }

    fn count(actions: &[FlowAction], wanted: &FlowAction) -> usize {
        actions.iter().filter(|a| *a == wanted).count()
    }

    #[test]
    fn first_chunk_schedules_one_flush() {
        let mut flow = desktop();
        let a1 = flow.on_data(chunk(10));
        let a2 = flow.on_data(chunk(10));
        assert_eq!(a1, vec![FlowAction::ScheduleFlush]);
        assert!(a2.is_empty());
        assert_eq!(flow.watermark(), 20);
    }

    #[test]
    fn batches_coalesce_in_order() {
        let mut flow = desktop();
        flow.on_data(Bytes::from_static(b"hello "));
        flow.on_data(Bytes::from_static(b"world"));
        let batch = flow.take_batch().unwrap();
        assert_eq!(batch.data, Bytes::from_static(b"hello world"));
        assert_eq!(batch.generation, 1);
        assert!(flow.take_batch().is_none());

        // Flag was cleared, so the next chunk schedules a new flush.
        assert_eq!(flow.on_data(chunk(1)), vec![FlowAction::ScheduleFlush]);
    }

    #[test]
    fn empty_chunks_are_ignored() {
        let mut flow = desktop();
        assert!(flow.on_data(Bytes::new()).is_empty());
        assert_eq!(flow.watermark(), 0);
    }

    #[test]
    fn watermark_never_exceeds_hard_cap() {
        let mut flow = desktop();
        for _ in 0..50 {
            flow.on_data(chunk(64 * 1024));
            assert!(flow.watermark() <= flow.thresholds().hard_cap);
        }
        assert_eq!(flow.watermark(), flow.thresholds().hard_cap);
    }

    #[test]
    fn pause_then_single_resume() {
        let mut flow = desktop();
        let mut sent_pause = 0;
        for _ in 0..12 {
            sent_pause += count(&flow.on_data(chunk(10_000)), &FlowAction::SendPause);
        }
        assert_eq!(sent_pause, 1, "pause sent exactly once while outstanding");
        assert!(flow.is_paused());
        assert_eq!(flow.watermark(), 120_000);

        let mut resumes = 0;
        for _ in 0..12 {
            resumes += count(&flow.on_rendered(1, 10_000), &FlowAction::SendResume);
        }
        assert_eq!(resumes, 1);
        assert!(!flow.is_paused());
        assert_eq!(flow.watermark(), 0);
    }

    #[test]
    fn resume_only_below_low_threshold() {
        let mut flow = desktop();
        flow.on_data(chunk(100_001));
        assert!(flow.is_paused());

        let actions = flow.on_rendered(1, 90_000);
        assert_eq!(flow.watermark(), 10_001);
        assert_eq!(count(&actions, &FlowAction::SendResume), 0);
        assert_eq!(actions, vec![FlowAction::ArmEmergency(Duration::from_secs(5))]);

        let actions = flow.on_rendered(1, 2);
        assert_eq!(count(&actions, &FlowAction::SendResume), 1);
        assert!(actions.contains(&FlowAction::CancelEmergency));
    }

    #[test]
    fn stale_generation_completions_are_ignored() {
        let mut flow = desktop();
        flow.on_data(chunk(5_000));
        flow.reset(2);
        flow.on_data(chunk(3_000));

        assert!(flow.on_rendered(1, 5_000).is_empty());
        assert_eq!(flow.watermark(), 3_000);

        flow.on_rendered(2, 3_000);
        assert_eq!(flow.watermark(), 0);
    }

    #[test]
    fn completion_never_underflows() {
        let mut flow = desktop();
        flow.on_data(chunk(10));
        flow.on_rendered(1, 1_000);
        assert_eq!(flow.watermark(), 0);
    }

    #[test]
    fn pause_retry_resends_until_acknowledged() {
        let mut flow = desktop();
        flow.on_data(chunk(150_000));
        assert!(flow.pause_confirm_pending());

        let retry = flow.on_pause_retry();
        assert_eq!(
            retry,
            vec![FlowAction::SendPause, FlowAction::ArmPauseRetry(Duration::from_millis(500))]
        );

        assert_eq!(flow.on_pause_ack(), vec![FlowAction::CancelPauseRetry]);
        assert!(!flow.pause_confirm_pending());
        assert!(flow.on_pause_retry().is_empty());
        // Duplicate acks are harmless.
        assert!(flow.on_pause_ack().is_empty());
    }

    #[test]
    fn emergency_reset_zeroes_watermark_and_resumes() {
        let mut flow = desktop();
        flow.on_data(chunk(200_000));
        assert!(flow.is_paused());

        let actions = flow.on_emergency();
        assert_eq!(flow.watermark(), 0);
        assert!(!flow.is_paused());
        assert!(!flow.pause_confirm_pending());
        assert_eq!(count(&actions, &FlowAction::SendResume), 1);
    }

    #[test]
    fn emergency_without_pause_is_noop() {
        let mut flow = desktop();
        flow.on_data(chunk(1_000));
        assert!(flow.on_emergency().is_empty());
        assert_eq!(flow.watermark(), 1_000);
    }

    #[test]
    fn constrained_profile_pauses_earlier() {
        let mut flow = FlowController::new(FlowThresholds::for_profile(FlowProfile::Constrained));
        flow.reset(1);
        let actions = flow.on_data(chunk(40_000));
        assert!(actions.contains(&FlowAction::SendPause));
    }

    #[test]
    fn reset_clears_queue_and_pause() {
        let mut flow = desktop();
        flow.on_data(chunk(150_000));
        flow.reset(7);
        assert_eq!(flow.watermark(), 0);
        assert!(!flow.is_paused());
        assert!(flow.take_batch().is_none());
        assert_eq!(flow.generation(), 7);
    }
}
