//! Per-device bounded state machine driving multi-shot face capture to
//! completion or timeout.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Number of enrollment shots required before the entry completes.
const SHOTS_REQUIRED: u32 = 2;

pub struct PendingEnrollment {
    pub enroll_id: i64,
    pub name: String,
    pub is_admin: bool,
    pub shots_remaining: u32,
    pub started_at: Instant,
}

pub enum StartError {
    DeviceNotConnected,
    AlreadyPending,
    AlreadyHasFaceData,
}

pub enum AdvanceOutcome {
    /// A shot was recorded; enrollment continues.
    Progressing { shots_remaining: u32 },
    /// The final shot was recorded; the caller should commit to the
    /// gallery and notify the device and operators.
    Complete {
        enroll_id: i64,
        name: String,
        is_admin: bool,
    },
    /// No pending enrollment for this serial — the log frame does not
    /// advance anything.
    NoPendingEnrollment,
    /// The 60s wall-clock bound was exceeded; the entry was removed.
    TimedOut,
}

/// Keyed by device serial. A `std::sync::Mutex` is sufficient — every
/// operation is a short, synchronous map mutation with no `.await` inside
/// the critical section.
pub struct EnrollmentController {
    pending: Mutex<HashMap<String, PendingEnrollment>>,
    timeout: Duration,
}

impl EnrollmentController {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// *Idle → Collecting(2)*. Preconditions are evaluated by the caller
    /// (device connectivity, duplicate-entry, existing face data) and
    /// passed in as booleans so this module stays free of store/session
    /// dependencies.
    pub fn start(
        &self,
        serial: &str,
        enroll_id: i64,
        name: String,
        is_admin: bool,
        device_connected: bool,
        already_has_face_data: bool,
    ) -> Result<(), StartError> {
        if !device_connected {
            return Err(StartError::DeviceNotConnected);
        }
        if already_has_face_data {
            return Err(StartError::AlreadyHasFaceData);
        }

        let mut guard = self.pending.lock().expect("enrollment lock poisoned");
        if guard.contains_key(serial) {
            return Err(StartError::AlreadyPending);
        }
        guard.insert(
            serial.to_string(),
            PendingEnrollment {
                enroll_id,
                name,
                is_admin,
                shots_remaining: SHOTS_REQUIRED,
                started_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Advance the machine for `serial` on an inbound log frame carrying an
    /// image. The caller is responsible for persisting the image to the
    /// store before calling this (so the decrement and the persistence are
    /// attempted together) and for running `embed`+`upsert` on `Complete`.
    pub fn advance(&self, serial: &str) -> AdvanceOutcome {
        let mut guard = self.pending.lock().expect("enrollment lock poisoned");
        let Some(entry) = guard.get_mut(serial) else {
            return AdvanceOutcome::NoPendingEnrollment;
        };

        if entry.started_at.elapsed() > self.timeout {
            guard.remove(serial);
            return AdvanceOutcome::TimedOut;
        }

        entry.shots_remaining -= 1;
        if entry.shots_remaining == 0 {
            let entry = guard.remove(serial).expect("entry just matched above");
            AdvanceOutcome::Complete {
                enroll_id: entry.enroll_id,
                name: entry.name,
                is_admin: entry.is_admin,
            }
        } else {
            AdvanceOutcome::Progressing {
                shots_remaining: entry.shots_remaining,
            }
        }
    }

    /// *Collecting → Aborted* on device disconnect.
    pub fn cancel(&self, serial: &str) -> bool {
        self.pending
            .lock()
            .expect("enrollment lock poisoned")
            .remove(serial)
            .is_some()
    }

    pub fn is_pending(&self, serial: &str) -> bool {
        self.pending
            .lock()
            .expect("enrollment lock poisoned")
            .contains_key(serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_rejects_duplicate_pending_entry() {
        let controller = EnrollmentController::new(60);
        controller
            .start("SN-A", 1000, "Ada".into(), false, true, false)
            .unwrap();
        assert!(matches!(
            controller.start("SN-A", 1001, "Bob".into(), false, true, false),
            Err(StartError::AlreadyPending)
        ));
    }

    #[test]
    fn two_shots_complete_the_enrollment() {
        let controller = EnrollmentController::new(60);
        controller
            .start("SN-A", 1000, "Ada".into(), false, true, false)
            .unwrap();

        assert!(matches!(
            controller.advance("SN-A"),
            AdvanceOutcome::Progressing { shots_remaining: 1 }
        ));
        assert!(matches!(
            controller.advance("SN-A"),
            AdvanceOutcome::Complete {
                enroll_id: 1000,
                is_admin: false,
                ..
            }
        ));
        assert!(!controller.is_pending("SN-A"));
    }

    #[test]
    fn advance_without_pending_entry_is_a_noop() {
        let controller = EnrollmentController::new(60);
        assert!(matches!(
            controller.advance("SN-ghost"),
            AdvanceOutcome::NoPendingEnrollment
        ));
    }

    #[test]
    fn cancel_removes_pending_entry() {
        let controller = EnrollmentController::new(60);
        controller
            .start("SN-A", 1000, "Ada".into(), false, true, false)
            .unwrap();
        assert!(controller.cancel("SN-A"));
        assert!(!controller.is_pending("SN-A"));
    }

    #[test]
    fn advance_past_timeout_aborts_and_clears_entry() {
        let controller = EnrollmentController::new(0);
        controller
            .start("SN-A", 1000, "Ada".into(), false, true, false)
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(controller.advance("SN-A"), AdvanceOutcome::TimedOut));
        assert!(!controller.is_pending("SN-A"));
    }
}
