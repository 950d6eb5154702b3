//! The node's [`Activity`], shared by the inbox and queue-event loops.
//!
//! Every move is checked against [`Activity::can_move_to`]. Callers that
//! depend on an earlier event having been handled (a new round needs the
//! previous one Completed, realtime input needs Standby) wait for it instead
//! of racing the event loop.

use std::time::Duration;

use tokio::sync::watch;

use mix_round::{Result, RoundError};
use mix_types::Activity;

pub struct ActivityMachine {
    state: watch::Sender<Activity>,
}

impl Default for ActivityMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityMachine {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Activity::NotStarted);
        Self { state }
    }

    pub fn current(&self) -> Activity {
        *self.state.borrow()
    }

    /// Move to `next`. Staying put is allowed; anything else
    /// [`Activity::can_move_to`] refuses is an error and changes nothing.
    pub fn enter(&self, next: Activity) -> Result<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_move_to(next) {
                result = Err(RoundError::InvalidActivity {
                    from: *current,
                    to: next,
                });
                return false;
            }
            *current = next;
            true
        });
        result
    }

    /// Move to Error. Returns false when the node had already failed, so
    /// only the first failure is acted on.
    pub fn fail(&self) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_failed() {
                return false;
            }
            *current = Activity::Error;
            true
        })
    }

    /// Error → Crash; no effect from any other state.
    pub fn crash(&self) {
        self.state.send_if_modified(|current| {
            if *current != Activity::Error {
                return false;
            }
            *current = Activity::Crash;
            true
        });
    }

    /// Block until the node is in one of `expected`. A failed node never
    /// gets there, so failure ends the wait early.
    pub async fn wait_for(&self, expected: &[Activity], timeout: Duration) -> Result<Activity> {
        let mut rx = self.state.subscribe();
        let reached = async {
            rx.wait_for(|a| expected.contains(a) || a.is_failed())
                .await
                .map(|a| *a)
        };
        let current = match tokio::time::timeout(timeout, reached).await {
            Ok(Ok(a)) => a,
            _ => self.current(),
        };
        if expected.contains(&current) {
            return Ok(current);
        }
        Err(RoundError::UnexpectedActivity {
            current,
            expected: expected.to_vec(),
        })
    }

    /// Like [`wait_for`](Self::wait_for) without waiting.
    pub fn require(&self, expected: &[Activity]) -> Result<Activity> {
        let current = self.current();
        if expected.contains(&current) {
            return Ok(current);
        }
        Err(RoundError::UnexpectedActivity {
            current,
            expected: expected.to_vec(),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn standby() -> ActivityMachine {
        let m = ActivityMachine::new();
        for a in [Activity::Waiting, Activity::Precomputing, Activity::Standby] {
            m.enter(a).unwrap();
        }
        m
    }

    #[test]
    fn illegal_moves_are_refused_and_change_nothing() {
        let m = ActivityMachine::new();
        assert!(matches!(
            m.enter(Activity::Realtime),
            Err(RoundError::InvalidActivity {
                from: Activity::NotStarted,
                to: Activity::Realtime
            })
        ));
        assert_eq!(m.current(), Activity::NotStarted);

        let m = standby();
        assert!(m.enter(Activity::Precomputing).is_err());
        assert!(m.enter(Activity::Completed).is_err());
        assert_eq!(m.current(), Activity::Standby);
        m.enter(Activity::Standby).unwrap();
    }

    #[test]
    fn only_the_first_failure_counts() {
        let m = standby();
        assert!(m.fail());
        assert!(!m.fail());
        assert!(m.enter(Activity::Waiting).is_err());

        m.crash();
        assert_eq!(m.current(), Activity::Crash);
        assert!(!m.fail());
        assert!(m.enter(Activity::Error).is_err());
    }

    #[test]
    fn crash_needs_error_first() {
        let m = standby();
        m.crash();
        assert_eq!(m.current(), Activity::Standby);
    }

    #[test]
    fn require_does_not_wait() {
        let m = standby();
        assert_eq!(m.require(&[Activity::Standby]).unwrap(), Activity::Standby);
        assert!(matches!(
            m.require(&[Activity::Waiting]),
            Err(RoundError::UnexpectedActivity { current: Activity::Standby, .. })
        ));
    }

    #[tokio::test]
    async fn wait_sees_a_later_move() {
        let m = Arc::new(ActivityMachine::new());
        m.enter(Activity::Waiting).unwrap();
        m.enter(Activity::Precomputing).unwrap();
        let waiter = {
            let m = Arc::clone(&m);
            tokio::spawn(async move {
                m.wait_for(&[Activity::Standby], Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        m.enter(Activity::Standby).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), Activity::Standby);
    }

    #[tokio::test]
    async fn wait_ends_on_failure_or_timeout() {
        let m = Arc::new(standby());
        let err = m
            .wait_for(&[Activity::Completed], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RoundError::UnexpectedActivity { current: Activity::Standby, .. }
        ));

        let waiter = {
            let m = Arc::clone(&m);
            tokio::spawn(async move {
                m.wait_for(&[Activity::Completed], Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        m.fail();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(RoundError::UnexpectedActivity { current: Activity::Error, .. })
        ));
    }
}
