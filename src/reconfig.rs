//! Reconfiguration controller
//!
//! Tracks the stream format a decoder last reported and decides when the codec
//! engine has to be rebuilt:
//!
//! ```text
//! Fresh --resources built--> Ready --format drift--> NeedsRecreate
//!   ^                                                   |
//!   +---------------- rebuild ok -----------------------+
//!                     rebuild failed --> Faulted (terminal)
//! ```

use crate::error::{Error, Result};
use crate::types::{DisplayRect, VideoFormatSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigState {
    /// No surfaces or shaders built for the current engine
    Fresh,
    /// Surfaces built, a snapshot may be recorded
    Ready,
    /// Drift detected, the engine must be rebuilt before the next decode
    NeedsRecreate,
    /// Rebuild failed; only destroy is permitted
    Faulted,
}

/// Why the engine has to be rebuilt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateReason {
    DisplayAreaChanged { from: DisplayRect, to: DisplayRect },
    ExceedsMax { coded: (u32, u32), max: (u32, u32) },
}

impl std::fmt::Display for RecreateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecreateReason::DisplayAreaChanged { from, to } => {
                write!(f, "display area changed from {} to {}", from, to)
            }
            RecreateReason::ExceedsMax { coded, max } => write!(
                f,
                "coded size {}x{} exceeds max {}x{}",
                coded.0, coded.1, max.0, max.1
            ),
        }
    }
}

#[derive(Debug)]
pub struct ReconfigController {
    state: ReconfigState,
    last: Option<VideoFormatSnapshot>,
    recreations: u32,
}

impl ReconfigController {
    pub fn new() -> Self {
        Self {
            state: ReconfigState::Fresh,
            last: None,
            recreations: 0,
        }
    }

    pub fn state(&self) -> ReconfigState {
        self.state
    }

    pub fn last_snapshot(&self) -> Option<&VideoFormatSnapshot> {
        self.last.as_ref()
    }

    /// Number of successful engine rebuilds so far
    pub fn recreations(&self) -> u32 {
        self.recreations
    }

    /// Fail fast once the session is faulted
    pub fn ensure_usable(&self) -> Result<()> {
        if self.state == ReconfigState::Faulted {
            return Err(Error::Faulted);
        }
        Ok(())
    }

    /// Compare the format reported by a successful decode with the last one
    ///
    /// Only a `Ready` engine can drift. A `Fresh` engine has nothing built
    /// yet, so the format is recorded as the baseline instead.
    pub fn observe(&mut self, current: &VideoFormatSnapshot) -> Option<RecreateReason> {
        match self.state {
            ReconfigState::Ready => {}
            ReconfigState::Fresh => {
                self.last = Some(*current);
                return None;
            }
            ReconfigState::NeedsRecreate | ReconfigState::Faulted => return None,
        }
        let last = self.last.as_ref().filter(|s| s.coded_width != 0)?;
        if last.display_area == current.display_area {
            return None;
        }
        let reason = RecreateReason::DisplayAreaChanged {
            from: last.display_area,
            to: current.display_area,
        };
        self.state = ReconfigState::NeedsRecreate;
        Some(reason)
    }

    /// Inspect the format reported alongside a failed decode
    pub fn observe_failure(&mut self, current: &VideoFormatSnapshot) -> Option<RecreateReason> {
        if !current.exceeds_max() {
            return None;
        }
        self.state = ReconfigState::NeedsRecreate;
        Some(RecreateReason::ExceedsMax {
            coded: (current.coded_width, current.coded_height),
            max: (current.max_width, current.max_height),
        })
    }

    /// Remember the format of a decode that produced frames
    pub fn record(&mut self, snapshot: VideoFormatSnapshot) {
        self.last = Some(snapshot);
    }

    /// Surfaces and shaders were built for the current engine
    pub fn mark_ready(&mut self) {
        if self.state == ReconfigState::Fresh {
            self.state = ReconfigState::Ready;
        }
    }

    /// Run `rebuild` for a pending recreation
    ///
    /// On success the state returns to `Fresh` and the old snapshot is
    /// forgotten; the caller drops its surfaces and resubmits. On failure the
    /// session is faulted for good.
    pub fn recreate<F>(&mut self, reason: RecreateReason, rebuild: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        if self.state != ReconfigState::NeedsRecreate {
            return Err(Error::Internal(format!(
                "recreate requested in state {:?}",
                self.state
            )));
        }
        tracing::info!("Recreating decoder, {}", reason);
        match rebuild() {
            Ok(()) => {
                self.state = ReconfigState::Fresh;
                self.last = None;
                self.recreations += 1;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Decoder recreation failed: {}", e);
                self.state = ReconfigState::Faulted;
                Err(Error::Recreate(e.to_string()))
            }
        }
    }
}

impl Default for ReconfigController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Resolution;

    fn snapshot(w: u32, h: u32) -> VideoFormatSnapshot {
        VideoFormatSnapshot {
            display_area: DisplayRect::full(Resolution::new(w, h)),
            coded_width: w,
            coded_height: h,
            max_width: 1920,
            max_height: 1088,
        }
    }

    #[test]
    fn test_first_decode_never_drifts() {
        let mut c = ReconfigController::new();
        assert!(c.observe(&snapshot(1280, 720)).is_none());
        assert_eq!(c.state(), ReconfigState::Fresh);
        assert_eq!(c.last_snapshot(), Some(&snapshot(1280, 720)));
    }

    #[test]
    fn test_fresh_engine_records_without_drift() {
        let mut c = ReconfigController::new();
        c.record(snapshot(1280, 720));
        assert!(c.observe(&snapshot(640, 480)).is_none());
        assert_eq!(c.state(), ReconfigState::Fresh);
        assert_eq!(c.last_snapshot(), Some(&snapshot(640, 480)));
    }

    #[test]
    fn test_full_cycle_forgets_old_format() {
        let mut c = ReconfigController::new();
        assert!(c.observe(&snapshot(1280, 720)).is_none());
        c.mark_ready();
        assert_eq!(c.state(), ReconfigState::Ready);

        let reason = c.observe(&snapshot(1920, 1080)).unwrap();
        assert_eq!(c.state(), ReconfigState::NeedsRecreate);
        c.recreate(reason, || Ok(())).unwrap();
        assert_eq!(c.state(), ReconfigState::Fresh);
        assert!(c.last_snapshot().is_none());

        // The rebuilt engine's first format is a baseline, not a second drift
        assert!(c.observe(&snapshot(1920, 1080)).is_none());
        c.mark_ready();
        assert!(c.observe(&snapshot(1920, 1080)).is_none());
        assert_eq!(c.state(), ReconfigState::Ready);
        assert_eq!(c.recreations(), 1);
    }

    #[test]
    fn test_display_area_change_requests_recreate() {
        let mut c = ReconfigController::new();
        c.mark_ready();
        c.record(snapshot(1280, 720));
        assert!(c.observe(&snapshot(1280, 720)).is_none());

        let reason = c.observe(&snapshot(1920, 1080)).unwrap();
        assert!(matches!(reason, RecreateReason::DisplayAreaChanged { .. }));
        assert_eq!(c.state(), ReconfigState::NeedsRecreate);

        c.recreate(reason, || Ok(())).unwrap();
        assert_eq!(c.state(), ReconfigState::Fresh);
        assert_eq!(c.recreations(), 1);
    }

    #[test]
    fn test_exceeding_max_requests_recreate() {
        let mut c = ReconfigController::new();
        let mut s = snapshot(3840, 2160);
        assert!(c.observe_failure(&s).is_some());
        assert_eq!(c.state(), ReconfigState::NeedsRecreate);

        let mut c = ReconfigController::new();
        s.max_width = 0;
        assert!(c.observe_failure(&s).is_none());
    }

    #[test]
    fn test_failed_rebuild_is_terminal() {
        let mut c = ReconfigController::new();
        c.mark_ready();
        c.record(snapshot(1280, 720));
        let reason = c.observe(&snapshot(640, 480)).unwrap();
        let err = c
            .recreate(reason, || Err(Error::BackendInit("decoder".into())))
            .unwrap_err();
        assert!(matches!(err, Error::Recreate(_)));
        assert_eq!(c.state(), ReconfigState::Faulted);
        assert!(matches!(c.ensure_usable(), Err(Error::Faulted)));
    }

    #[test]
    fn test_recreate_without_drift_rejected() {
        let mut c = ReconfigController::new();
        let reason = RecreateReason::ExceedsMax {
            coded: (1, 1),
            max: (0, 0),
        };
        assert!(c.recreate(reason, || Ok(())).is_err());
        assert_eq!(c.state(), ReconfigState::Fresh);
    }
}
