//! Stage coordination between transcription and conversion.
//!
//! Transcription and conversion are both CPU-heavy and must never run
//! concurrently. The two one-way signals of the pipeline ("transcribing
//! active", "transcription complete") are modelled as one small state
//! machine so every transition is explicit:
//!
//! ```text
//!   Idle ──T-start──▶ Transcribing ──T-drain──▶ Draining ──C-pop──▶ Converting
//!    ▲                     ▲                      ▲                    │
//!    └──────C-drain────────┴──────T-start─────────┴───────C-done──────┘
//! ```
//!
//! The converter proceeds only in `Draining`/`Converting`; the transcriber
//! takes priority by forcing `Transcribing` from any state.

use tokio::sync::watch;

/// Pipeline stage occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StageState {
    /// No stage holds the CPU.
    #[default]
    Idle,
    /// A transcription task is in flight.
    Transcribing,
    /// Transcription drained; conversions may start.
    Draining,
    /// A conversion is in flight.
    Converting,
}

/// Shared gate handed to the transcriber, converter, and housekeeping loop.
#[derive(Clone)]
pub struct StageGate {
    tx: watch::Sender<StageState>,
}

impl Default for StageGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StageGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(StageState::default());
        Self { tx }
    }

    pub fn state(&self) -> StageState {
        *self.tx.borrow()
    }

    /// The "transcribing-active" signal.
    pub fn transcribing_active(&self) -> bool {
        self.state() == StageState::Transcribing
    }

    /// The "transcription-complete" signal: conversions are admitted.
    pub fn transcription_complete(&self) -> bool {
        matches!(self.state(), StageState::Draining | StageState::Converting)
    }

    /// Transcriber picked up an item. Takes priority from any state.
    pub fn begin_transcribing(&self) {
        self.tx.send_replace(StageState::Transcribing);
    }

    /// Transcriber finished an item. Opens the conversion gate when its
    /// queue drained; otherwise the stage merely goes quiet between items.
    pub fn finish_transcribing(&self, queue_drained: bool) {
        let next = if queue_drained {
            StageState::Draining
        } else {
            StageState::Idle
        };
        self.tx.send_replace(next);
    }

    /// Housekeeping: admit conversions when there is nothing to transcribe
    /// but converts are waiting (e.g. a WAV whose transcript already
    /// existed on disk).
    pub fn open_conversion_gate(&self) {
        self.tx.send_if_modified(|state| {
            if *state == StageState::Idle {
                *state = StageState::Draining;
                true
            } else {
                false
            }
        });
    }

    /// Converter took an item while the gate was open.
    pub fn begin_converting(&self) {
        self.tx.send_if_modified(|state| {
            if *state == StageState::Draining {
                *state = StageState::Converting;
                true
            } else {
                false
            }
        });
    }

    /// Converter finished an item. Clears the gate once its queue drained.
    pub fn finish_converting(&self, queue_drained: bool) {
        self.tx.send_if_modified(|state| {
            if *state == StageState::Converting {
                *state = if queue_drained {
                    StageState::Idle
                } else {
                    StageState::Draining
                };
                true
            } else {
                false
            }
        });
    }

    /// Waits until the conversion gate opens.
    pub async fn wait_transcription_complete(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx
            .wait_for(|state| matches!(state, StageState::Draining | StageState::Converting))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcribe_cycle_opens_gate_on_drain() {
        let gate = StageGate::new();
        assert_eq!(gate.state(), StageState::Idle);

        gate.begin_transcribing();
        assert!(gate.transcribing_active());
        assert!(!gate.transcription_complete());

        // More items pending: stage goes quiet but conversions stay gated.
        gate.finish_transcribing(false);
        assert!(!gate.transcribing_active());
        assert!(!gate.transcription_complete());

        gate.begin_transcribing();
        gate.finish_transcribing(true);
        assert!(gate.transcription_complete());
    }

    #[test]
    fn test_convert_cycle_clears_gate_on_drain() {
        let gate = StageGate::new();
        gate.begin_transcribing();
        gate.finish_transcribing(true);

        gate.begin_converting();
        assert_eq!(gate.state(), StageState::Converting);

        gate.finish_converting(false);
        assert_eq!(gate.state(), StageState::Draining);

        gate.begin_converting();
        gate.finish_converting(true);
        assert_eq!(gate.state(), StageState::Idle);
    }

    #[test]
    fn test_transcriber_preempts_converting() {
        let gate = StageGate::new();
        gate.begin_transcribing();
        gate.finish_transcribing(true);
        gate.begin_converting();

        // New recording arrived mid-conversion cycle: TR takes priority.
        gate.begin_transcribing();
        assert!(gate.transcribing_active());
        assert!(!gate.transcription_complete());
    }

    #[test]
    fn test_gate_opens_without_transcription_work() {
        let gate = StageGate::new();
        gate.open_conversion_gate();
        assert!(gate.transcription_complete());

        // No-op while a transcription is active.
        let gate = StageGate::new();
        gate.begin_transcribing();
        gate.open_conversion_gate();
        assert!(!gate.transcription_complete());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_drain() {
        let gate = StageGate::new();
        let waiter = gate.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_transcription_complete().await;
        });

        gate.begin_transcribing();
        gate.finish_transcribing(true);
        handle.await.unwrap();
    }
}
