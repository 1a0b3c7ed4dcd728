use std::sync::Mutex;

use courier_common::{Result, RpcError};

/// Connection lifecycle shared by all registry backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Inited,
    Started,
    Stopped,
}

/// Guards the `Inited -> Started -> Stopped` transitions of one registry.
pub(crate) struct Lifecycle {
    name: &'static str,
    state: Mutex<RegistryState>,
}

impl Lifecycle {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(RegistryState::Inited),
        }
    }

    pub(crate) fn state(&self) -> RegistryState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(RegistryState::Stopped)
    }

    /// Moves to `Started`. Returns false when already started or stopped.
    pub(crate) fn start(&self) -> bool {
        match self.state.lock() {
            Ok(mut state) if *state == RegistryState::Inited => {
                *state = RegistryState::Started;
                true
            }
            _ => false,
        }
    }

    /// Moves to `Stopped`. Returns false unless the registry was running.
    pub(crate) fn stop(&self) -> bool {
        match self.state.lock() {
            Ok(mut state) if *state == RegistryState::Started => {
                *state = RegistryState::Stopped;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == RegistryState::Started
    }

    /// Fails with `ConnectionLoss` unless started.
    pub(crate) fn check(&self, op: &str) -> Result<()> {
        match self.state() {
            RegistryState::Started => Ok(()),
            RegistryState::Inited => Err(RpcError::ConnectionLoss(format!(
                "[courier-{}] ({}) CONNECTION_LOSS: registry is not started",
                self.name, op
            ))),
            RegistryState::Stopped => Err(RpcError::ConnectionLoss(format!(
                "[courier-{}] ({}) CONNECTION_LOSS: registry is stopped",
                self.name, op
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_one_way() {
        let lifecycle = Lifecycle::new("test");
        assert!(!lifecycle.stop());
        assert!(lifecycle.start());
        assert!(!lifecycle.start());
        assert!(lifecycle.is_connected());
        assert!(lifecycle.stop());
        assert!(!lifecycle.stop());
        assert!(!lifecycle.start());
        assert_eq!(lifecycle.state(), RegistryState::Stopped);
    }

    #[test]
    fn test_check_reports_connection_loss() {
        let lifecycle = Lifecycle::new("localRegistry");
        let err = lifecycle.check("register").unwrap_err();
        assert!(matches!(err, RpcError::ConnectionLoss(_)));
        assert!(err.to_string().contains("not started"));

        lifecycle.start();
        assert!(lifecycle.check("register").is_ok());

        lifecycle.stop();
        let err = lifecycle.check("register").unwrap_err();
        assert!(err.to_string().contains("stopped"));
    }
}
