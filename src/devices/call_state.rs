use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tracing::info;

use super::{CallStateProvider, DeviceError, RouteController};

/// In-process call flag. Hanging up simply clears it.
#[derive(Debug)]
pub struct SharedCallState {
    active: AtomicBool,
    hangups: AtomicU32,
}

impl SharedCallState {
    pub fn new(active: bool) -> Self {
        Self {
            active: AtomicBool::new(active),
            hangups: AtomicU32::new(0),
        }
    }

    /// Marks the far end as gone.
    pub fn end(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn hangups(&self) -> u32 {
        self.hangups.load(Ordering::SeqCst)
    }
}

impl Default for SharedCallState {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CallStateProvider for SharedCallState {
    fn is_call_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn hang_up(&self) -> Result<(), DeviceError> {
        self.hangups.fetch_add(1, Ordering::SeqCst);
        if self.active.swap(false, Ordering::SeqCst) {
            info!("call hung up");
        }
        Ok(())
    }
}

/// Route controller with nothing to reroute; counts how often it was asked.
#[derive(Debug, Default)]
pub struct StaticRoute {
    reapplied: AtomicU32,
}

impl StaticRoute {
    pub fn reapplied(&self) -> u32 {
        self.reapplied.load(Ordering::SeqCst)
    }
}

impl RouteController for StaticRoute {
    fn reapply(&self) -> Result<(), DeviceError> {
        self.reapplied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hang_up_clears_the_flag_once() {
        let call = SharedCallState::default();
        assert!(call.is_call_active());
        call.hang_up().unwrap();
        call.hang_up().unwrap();
        assert!(!call.is_call_active());
        assert_eq!(call.hangups(), 2);
    }
}
