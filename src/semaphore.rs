//! The one-outstanding-operation lock over the shared radio.
//!
//! The radio can only service one connect or one command/response exchange
//! at a time no matter how many devices are registered, so there is exactly
//! one of these per [`crate::ConnectionManager`]. Devices are identified by
//! their index in the manager's registration table.

use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreState {
    Idle,
    AwaitingConnection { device: usize },
    AwaitingResponse { device: usize, tag: u16 },
}

#[derive(Debug)]
pub struct Semaphore {
    state: SemaphoreState,
    started_at: u64,
    timeout_ms: u64,
}

impl Semaphore {
    pub fn new(timeout_ms: u64) -> Self {
        Self { state: SemaphoreState::Idle, started_at: 0, timeout_ms }
    }

    pub fn state(&self) -> SemaphoreState {
        self.state
    }

    /// The device currently holding the radio, if any.
    pub fn holder(&self) -> Option<usize> {
        match self.state {
            SemaphoreState::Idle => None,
            SemaphoreState::AwaitingConnection { device }
            | SemaphoreState::AwaitingResponse { device, .. } => Some(device),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state != SemaphoreState::Idle
    }

    pub fn acquire_for_connect(&mut self, device: usize, now: u64) -> bool {
        self.acquire(SemaphoreState::AwaitingConnection { device }, now)
    }

    pub fn acquire_for_command(&mut self, device: usize, tag: u16, now: u64) -> bool {
        self.acquire(SemaphoreState::AwaitingResponse { device, tag }, now)
    }

    fn acquire(&mut self, next: SemaphoreState, now: u64) -> bool {
        if self.is_busy() {
            warn!("radio busy with {:?}, rejecting {:?}", self.state, next);
            return false;
        }
        self.state = next;
        self.started_at = now;
        true
    }

    pub fn release(&mut self) {
        self.state = SemaphoreState::Idle;
        self.started_at = 0;
    }

    /// Release only if `device` holds a connect wait.
    pub fn release_connection(&mut self, device: usize) -> bool {
        if self.state == (SemaphoreState::AwaitingConnection { device }) {
            self.release();
            return true;
        }
        false
    }

    /// Release only if `device` is waiting for the response tagged `tag`.
    pub fn release_response(&mut self, device: usize, tag: u16) -> bool {
        if self.state == (SemaphoreState::AwaitingResponse { device, tag }) {
            self.release();
            return true;
        }
        false
    }

    /// Release whatever `device` holds, e.g. because it disconnected.
    pub fn release_if_held_by(&mut self, device: usize) -> bool {
        if self.holder() == Some(device) {
            info!("releasing radio held by disconnected device {device}");
            self.release();
            return true;
        }
        false
    }

    pub fn is_timed_out(&self, now: u64) -> bool {
        self.is_busy() && now.saturating_sub(self.started_at) >= self.timeout_ms
    }
}

#[test]
fn test_single_holder() {
    let mut semaphore = Semaphore::new(15_000);
    assert!(!semaphore.is_busy());
    assert!(semaphore.acquire_for_command(0, 0x0100, 5));
    assert!(!semaphore.acquire_for_command(1, 0xF0CC, 6));
    assert!(!semaphore.acquire_for_connect(2, 7));
    assert_eq!(semaphore.state(), SemaphoreState::AwaitingResponse { device: 0, tag: 0x0100 });
    assert_eq!(semaphore.holder(), Some(0));
}

#[test]
fn test_release_requires_matching_holder() {
    let mut semaphore = Semaphore::new(15_000);
    semaphore.acquire_for_command(1, 0xF0CC, 0);
    assert!(!semaphore.release_response(0, 0xF0CC));
    assert!(!semaphore.release_response(1, 0xF2CC));
    assert!(!semaphore.release_connection(1));
    assert!(!semaphore.release_if_held_by(2));
    assert!(semaphore.is_busy());
    assert!(semaphore.release_response(1, 0xF0CC));
    assert!(!semaphore.is_busy());

    semaphore.acquire_for_connect(2, 0);
    assert!(semaphore.release_if_held_by(2));
    assert_eq!(semaphore.holder(), None);
}

#[test]
fn test_timeout() {
    let mut semaphore = Semaphore::new(15_000);
    assert!(!semaphore.is_timed_out(1_000_000));
    semaphore.acquire_for_connect(0, 1_000);
    assert!(!semaphore.is_timed_out(15_999));
    assert!(semaphore.is_timed_out(16_000));
    semaphore.release();
    assert!(!semaphore.is_timed_out(20_000));
}
