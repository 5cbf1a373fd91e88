//! Command batching: one open recording session at a time.
//!
//! The session is opened lazily by the first command that needs it and closed
//! by [`flush`](CommandBatcher::flush), which submits everything recorded so
//! far. Dispatches share one compute pass; encoder-level commands (uploads,
//! copies) close the pass first. A flush happens automatically once the
//! pending dispatch count reaches the configured threshold.

use crate::device::ComputeDevice;
use core::mem;

/// Recording state.
///
/// A pass can only exist inside a recording, and must be closed before the
/// recording is submitted.
pub enum RecordingState<E, P> {
    Closed,
    Recording(E),
    PassOpen(E, P),
}

impl<E, P> RecordingState<E, P> {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn has_pass(&self) -> bool {
        matches!(self, Self::PassOpen(..))
    }
}

/// Batcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatcherStats {
    pub sessions_opened: usize,
    pub submissions: usize,
    pub dispatches: usize,
    /// Submissions triggered by the pending threshold.
    pub threshold_flushes: usize,
}

pub struct CommandBatcher<D: ComputeDevice> {
    state: RecordingState<D::Encoder, D::Pass>,
    pending_dispatches: usize,
    max_pending: usize,
    stats: BatcherStats,
}

impl<D: ComputeDevice> CommandBatcher<D> {
    pub fn new(max_dispatches_per_flush: usize) -> Self {
        Self {
            state: RecordingState::Closed,
            pending_dispatches: 0,
            max_pending: max_dispatches_per_flush.max(1),
            stats: BatcherStats::default(),
        }
    }

    /// The open recording, opened on first use.
    ///
    /// An open compute pass is left open; close it with
    /// [`end_compute_pass`](Self::end_compute_pass) before recording
    /// encoder-level commands.
    pub fn current_recording(&mut self, device: &D) -> &mut D::Encoder {
        if self.state.is_closed() {
            self.state = RecordingState::Recording(device.begin_recording());
            self.stats.sessions_opened += 1;
        }
        match &mut self.state {
            RecordingState::Recording(encoder) | RecordingState::PassOpen(encoder, _) => encoder,
            RecordingState::Closed => unreachable!("recording opened above"),
        }
    }

    /// The open compute pass, opened (with its recording) on first use.
    pub fn current_compute_pass(&mut self, device: &D) -> &mut D::Pass {
        self.state = match mem::replace(&mut self.state, RecordingState::Closed) {
            RecordingState::Closed => {
                self.stats.sessions_opened += 1;
                let mut encoder = device.begin_recording();
                let pass = device.begin_pass(&mut encoder);
                RecordingState::PassOpen(encoder, pass)
            }
            RecordingState::Recording(mut encoder) => {
                let pass = device.begin_pass(&mut encoder);
                RecordingState::PassOpen(encoder, pass)
            }
            open @ RecordingState::PassOpen(..) => open,
        };
        match &mut self.state {
            RecordingState::PassOpen(_, pass) => pass,
            _ => unreachable!("pass opened above"),
        }
    }

    /// Close the compute pass, if one is open.
    pub fn end_compute_pass(&mut self, device: &D) {
        self.state = match mem::replace(&mut self.state, RecordingState::Closed) {
            RecordingState::PassOpen(mut encoder, pass) => {
                device.end_pass(&mut encoder, pass);
                RecordingState::Recording(encoder)
            }
            other => other,
        };
    }

    /// Submit everything recorded so far. No-op when nothing is open.
    pub fn flush(&mut self, device: &D) {
        self.end_compute_pass(device);
        if let RecordingState::Recording(encoder) =
            mem::replace(&mut self.state, RecordingState::Closed)
        {
            device.submit(encoder);
            self.stats.submissions += 1;
            tracing::trace!("Flushed session with {} dispatches", self.pending_dispatches);
        }
        self.pending_dispatches = 0;
    }

    /// Record a dispatch into the current pass. Returns `true` if the pending
    /// threshold was reached and the session was flushed.
    pub fn record_dispatch(
        &mut self,
        device: &D,
        program: &D::Program,
        bindings: &[&D::Buffer],
        workgroups: [u32; 3],
    ) -> bool {
        let pass = self.current_compute_pass(device);
        device.record_dispatch(pass, program, bindings, workgroups);
        self.pending_dispatches += 1;
        self.stats.dispatches += 1;

        if self.pending_dispatches >= self.max_pending {
            self.stats.threshold_flushes += 1;
            self.flush(device);
            return true;
        }
        false
    }

    pub fn record_upload(&mut self, device: &D, dst: &D::Buffer, data: &[u8]) {
        self.end_compute_pass(device);
        let encoder = self.current_recording(device);
        device.record_upload(encoder, dst, data);
    }

    pub fn record_copy(&mut self, device: &D, src: &D::Buffer, dst: &D::Buffer, size: u64) {
        self.end_compute_pass(device);
        let encoder = self.current_recording(device);
        device.record_copy(encoder, src, dst, size);
    }

    pub fn is_open(&self) -> bool {
        !self.state.is_closed()
    }

    pub fn has_open_pass(&self) -> bool {
        self.state.has_pass()
    }

    pub fn pending_dispatches(&self) -> usize {
        self.pending_dispatches
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn stats(&self) -> &BatcherStats {
        &self.stats
    }
}
