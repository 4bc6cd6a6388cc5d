// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Synchronization between the buffer manager and the hardware blocks' event threads.
//!
//! The caller takes the pipeline lock with [`PipelineSync::lock`] and keeps it for a whole
//! negotiation round or abort, passing the resulting [`PipelineGuard`] to every call. Waiting on a
//! port releases the lock until the block signals or the wait times out.

use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use crate::buffer::BufferConfiguration;
use crate::buffer::BufferRequirement;
use crate::stream::StreamIndex;
use crate::Error;

/// Ceiling of every wait on a hardware block.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of [`wait_for_condition`].
///
/// Callers log anything other than `Success` and carry on with whatever state is visible.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Success,
    Timeout,
    BadParameter,
}

impl WaitStatus {
    pub fn into_result(self) -> crate::Result<()> {
        match self {
            WaitStatus::Success => Ok(()),
            WaitStatus::Timeout => Err(Error::Timeout),
            WaitStatus::BadParameter => Err(Error::BadParameter("condition wait failed".into())),
        }
    }

    /// Logs anything but a success. `event` names what was waited for.
    pub fn report(self, stream: StreamIndex, event: &str) {
        match self {
            WaitStatus::Success => (),
            WaitStatus::Timeout => {
                log::warn!("Timed out waiting for {} on {:?}, continuing", event, stream)
            }
            WaitStatus::BadParameter => {
                log::error!("Waiting for {} on {:?} failed, continuing", event, stream)
            }
        }
    }
}

/// What a condition primitive reports after a timed wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Woken,
    TimedOut,
    Failed,
}

/// A condition variable that can be waited on with a lock held by the caller.
pub trait Condition {
    /// Releases `guard`, waits for a signal for at most `timeout`, then reacquires the lock.
    fn timed_wait<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, WaitOutcome);
}

impl Condition for Condvar {
    fn timed_wait<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, WaitOutcome) {
        match self.wait_timeout(guard, timeout) {
            Ok((guard, result)) if result.timed_out() => (guard, WaitOutcome::TimedOut),
            Ok((guard, _)) => (guard, WaitOutcome::Woken),
            // A writer panicked while holding the lock.
            Err(poisoned) => (poisoned.into_inner().0, WaitOutcome::Failed),
        }
    }
}

/// Waits on `condition` for at most [`WAIT_TIMEOUT`]. The lock must already be held; taking the
/// guard by value makes that explicit.
pub fn wait_for_condition<'a, T, C: Condition>(
    condition: &C,
    guard: MutexGuard<'a, T>,
) -> (MutexGuard<'a, T>, WaitStatus) {
    wait_for_condition_timeout(condition, guard, WAIT_TIMEOUT)
}

fn wait_for_condition_timeout<'a, T, C: Condition>(
    condition: &C,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> (MutexGuard<'a, T>, WaitStatus) {
    let (guard, outcome) = condition.timed_wait(guard, timeout);
    let status = match outcome {
        WaitOutcome::Woken => WaitStatus::Success,
        WaitOutcome::TimedOut => WaitStatus::Timeout,
        WaitOutcome::Failed => WaitStatus::BadParameter,
    };

    (guard, status)
}

/// Negotiation state of one stream.
#[derive(Debug, Default)]
pub struct PortBufferState {
    pub used: bool,
    /// Last requirement computed for, or reported by, the stream.
    pub requirement: BufferRequirement,
    /// Last configuration proposed to, or returned by, the block.
    pub configuration: BufferConfiguration,
    /// Set by the block when its side of the configuration is complete.
    pub config_done: bool,
    /// Set by the block when it has given back every buffer after an abort.
    pub abort_done: bool,
}

/// State of every stream, protected by the pipeline lock.
#[derive(Debug)]
pub struct PipelineState {
    ports: [PortBufferState; StreamIndex::COUNT],
}

impl PipelineState {
    fn new() -> Self {
        Self { ports: std::array::from_fn(|_| PortBufferState::default()) }
    }

    pub fn port(&self, stream: impl Into<StreamIndex>) -> &PortBufferState {
        &self.ports[stream.into().index()]
    }

    pub fn port_mut(&mut self, stream: impl Into<StreamIndex>) -> &mut PortBufferState {
        &mut self.ports[stream.into().index()]
    }
}

#[derive(Debug, Default)]
struct PortConditions {
    config_done: Condvar,
    abort_done: Condvar,
}

/// Per-stream state and condition variables shared with the hardware blocks.
///
/// There are two sides to this object:
///
/// * The buffer manager (one control thread) holds the lock through a [`PipelineGuard`] and only
///   reads what a block returned after the matching done flag is set.
/// * Each block's event thread is the single writer of the done flags and of the values it
///   returns, through [`PipelineSync::complete_configuration`] and
///   [`PipelineSync::complete_abort`].
#[derive(Debug)]
pub struct PipelineSync {
    state: Mutex<PipelineState>,
    conditions: [PortConditions; StreamIndex::COUNT],
    wait_timeout: Duration,
}

impl PipelineSync {
    pub fn new() -> Self {
        Self::with_wait_timeout(WAIT_TIMEOUT)
    }

    /// Builds a pipeline whose waits give up after `wait_timeout` instead of [`WAIT_TIMEOUT`].
    /// Only meant for tests.
    pub fn with_wait_timeout(wait_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(PipelineState::new()),
            conditions: std::array::from_fn(|_| PortConditions::default()),
            wait_timeout,
        }
    }

    /// Takes the pipeline lock.
    pub fn lock(&self) -> PipelineGuard<'_> {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        PipelineGuard { sync: self, guard: Some(guard) }
    }

    /// Called by a block when its side of the configuration of `stream` is complete. The returned
    /// configuration and requirement, if any, replace the ones held for the stream.
    pub fn complete_configuration(
        &self,
        stream: StreamIndex,
        configuration: Option<BufferConfiguration>,
        requirement: Option<BufferRequirement>,
    ) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let port = state.port_mut(stream);
        if let Some(configuration) = configuration {
            port.configuration = configuration;
        }
        if let Some(requirement) = requirement {
            port.requirement = requirement;
        }
        port.config_done = true;
        self.conditions[stream.index()].config_done.notify_all();
    }

    /// Called by a block once it has given back every buffer of `stream` after an abort.
    pub fn complete_abort(&self, stream: StreamIndex) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.port_mut(stream).abort_done = true;
        self.conditions[stream.index()].abort_done.notify_all();
    }
}

impl Default for PipelineSync {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, Debug)]
enum Signal {
    ConfigDone,
    AbortDone,
}

/// The pipeline lock, held by the buffer manager's control thread.
pub struct PipelineGuard<'a> {
    sync: &'a PipelineSync,
    // Only `None` while waiting.
    guard: Option<MutexGuard<'a, PipelineState>>,
}

impl<'a> PipelineGuard<'a> {
    /// Waits until the block signals that the configuration of `stream` is done. Returns
    /// immediately if it already did.
    pub fn wait_config_done(&mut self, stream: StreamIndex) -> WaitStatus {
        self.wait(stream, Signal::ConfigDone)
    }

    /// Waits until the block acknowledges the abort of `stream`.
    pub fn wait_abort_done(&mut self, stream: StreamIndex) -> WaitStatus {
        self.wait(stream, Signal::AbortDone)
    }

    fn is_signaled(&self, stream: StreamIndex, signal: Signal) -> bool {
        let port = self.port(stream);
        match signal {
            Signal::ConfigDone => port.config_done,
            Signal::AbortDone => port.abort_done,
        }
    }

    fn wait(&mut self, stream: StreamIndex, signal: Signal) -> WaitStatus {
        let sync = self.sync;
        let conditions = &sync.conditions[stream.index()];
        let condition = match signal {
            Signal::ConfigDone => &conditions.config_done,
            Signal::AbortDone => &conditions.abort_done,
        };
        let deadline = Instant::now() + sync.wait_timeout;

        while !self.is_signaled(stream, signal) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WaitStatus::Timeout;
            }

            // `unwrap` will never fail as `guard` is only taken for the duration of the wait.
            let guard = self.guard.take().unwrap();
            let (guard, status) = wait_for_condition_timeout(condition, guard, remaining);
            self.guard = Some(guard);

            if status != WaitStatus::Success {
                return status;
            }
        }

        WaitStatus::Success
    }
}

impl Deref for PipelineGuard<'_> {
    type Target = PipelineState;

    fn deref(&self) -> &PipelineState {
        // `unwrap` will never fail as `guard` is only taken for the duration of a wait.
        self.guard.as_deref().unwrap()
    }
}

impl DerefMut for PipelineGuard<'_> {
    fn deref_mut(&mut self) -> &mut PipelineState {
        self.guard.as_deref_mut().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::stream::ZoomStream;

    struct FakeCondition(WaitOutcome);

    impl Condition for FakeCondition {
        fn timed_wait<'a, T>(
            &self,
            guard: MutexGuard<'a, T>,
            _: Duration,
        ) -> (MutexGuard<'a, T>, WaitOutcome) {
            (guard, self.0)
        }
    }

    #[test]
    fn wait_status_follows_outcome() {
        let mutex = Mutex::new(());

        let (guard, status) =
            wait_for_condition(&FakeCondition(WaitOutcome::Woken), mutex.lock().unwrap());
        assert_eq!(status, WaitStatus::Success);
        drop(guard);

        let (guard, status) =
            wait_for_condition(&FakeCondition(WaitOutcome::TimedOut), mutex.lock().unwrap());
        assert_eq!(status, WaitStatus::Timeout);
        drop(guard);

        let (_guard, status) =
            wait_for_condition(&FakeCondition(WaitOutcome::Failed), mutex.lock().unwrap());
        assert_eq!(status, WaitStatus::BadParameter);
    }

    #[test]
    fn condvar_times_out_without_signal() {
        let mutex = Mutex::new(());
        let condvar = Condvar::new();
        let (_guard, status) =
            wait_for_condition_timeout(&condvar, mutex.lock().unwrap(), Duration::from_millis(10));
        assert_eq!(status, WaitStatus::Timeout);
    }

    #[test]
    fn status_into_result() {
        assert!(WaitStatus::Success.into_result().is_ok());
        assert!(matches!(WaitStatus::Timeout.into_result(), Err(Error::Timeout)));
        assert!(matches!(WaitStatus::BadParameter.into_result(), Err(Error::BadParameter(_))));
    }

    #[test]
    fn config_done_signaled_from_another_thread() {
        let sync = Arc::new(PipelineSync::new());
        let stream = StreamIndex::Zoom(ZoomStream::OutputStill);
        let mut guard = sync.lock();

        let signaler = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                let configuration = BufferConfiguration { num_buffers: 4, ..Default::default() };
                sync.complete_configuration(stream, Some(configuration), None);
            })
        };

        assert_eq!(guard.wait_config_done(stream), WaitStatus::Success);
        assert!(guard.port(stream).config_done);
        assert_eq!(guard.port(stream).configuration.num_buffers, 4);
        drop(guard);
        signaler.join().unwrap();
    }

    #[test]
    fn already_signaled_returns_immediately() {
        let sync = PipelineSync::with_wait_timeout(Duration::from_secs(60));
        let stream = StreamIndex::Zoom(ZoomStream::OutputVideo);
        sync.complete_abort(stream);

        let mut guard = sync.lock();
        assert_eq!(guard.wait_abort_done(stream), WaitStatus::Success);
    }

    #[test]
    fn wait_times_out_and_keeps_state() {
        let sync = PipelineSync::with_wait_timeout(Duration::from_millis(20));
        let stream = StreamIndex::Zoom(ZoomStream::OutputStill);
        let mut guard = sync.lock();
        guard.port_mut(stream).configuration.num_buffers = 7;

        assert_eq!(guard.wait_config_done(stream), WaitStatus::Timeout);
        // The lock is held again and the stale value is still readable.
        assert_eq!(guard.port(stream).configuration.num_buffers, 7);
    }
}
