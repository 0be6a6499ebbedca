//! Resource lifecycle states and the shared transition table.
//!
//! Every lifecycle operation is validated against one explicit
//! `state x operation -> next state` table instead of ad-hoc checks per
//! method, so all concrete resource types reject invalid transitions the
//! same way.

/// Lifecycle states of a resource.
///
/// The happy path is monotonic: CREATED through DESTROYED in order.
/// ERROR is reachable from any active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ResourceState {
    Created,
    Initializing,
    Ready,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
    Cleanup,
    Destroyed,
}

/// Health of a resource as reported by its driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ResourceHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Lifecycle operations validated by the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ResourceOp {
    Initialize,
    Connect,
    Disconnect,
    Cleanup,
}

/// One validated transition: the state entered while the operation runs
/// and the state reached when it succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub in_progress: ResourceState,
    pub on_success: ResourceState,
}

/// Rejected transition, naming the states the operation would accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current: ResourceState,
    pub required: &'static str,
}

impl ResourceState {
    /// Looks up the transition for `op` from this state.
    pub fn begin(self, op: ResourceOp) -> Result<Transition, InvalidTransition> {
        use ResourceState::*;
        match (op, self) {
            (ResourceOp::Initialize, Created) => Ok(Transition {
                in_progress: Initializing,
                on_success: Ready,
            }),
            (ResourceOp::Initialize, current) => Err(InvalidTransition {
                current,
                required: "`created`",
            }),
            (ResourceOp::Connect, Ready | Disconnected) => Ok(Transition {
                in_progress: Connecting,
                on_success: Connected,
            }),
            (ResourceOp::Connect, current) => Err(InvalidTransition {
                current,
                required: "`ready` or `disconnected`",
            }),
            (ResourceOp::Disconnect, Connected | Error) => Ok(Transition {
                in_progress: Disconnecting,
                on_success: Disconnected,
            }),
            (ResourceOp::Disconnect, current) => Err(InvalidTransition {
                current,
                required: "`connected` or `error`",
            }),
            (ResourceOp::Cleanup, Destroyed) => Err(InvalidTransition {
                current: Destroyed,
                required: "any state except `destroyed`",
            }),
            (ResourceOp::Cleanup, _) => Ok(Transition {
                in_progress: Cleanup,
                on_success: Destroyed,
            }),
        }
    }

    /// Ready for use: initialized, possibly connected.
    pub fn is_ready(self) -> bool {
        matches!(self, ResourceState::Ready | ResourceState::Connected)
    }

    pub fn is_connected(self) -> bool {
        self == ResourceState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_happy_path_transitions() {
        let init = ResourceState::Created.begin(ResourceOp::Initialize).unwrap();
        assert_eq!(init.in_progress, ResourceState::Initializing);
        assert_eq!(init.on_success, ResourceState::Ready);

        let connect = ResourceState::Ready.begin(ResourceOp::Connect).unwrap();
        assert_eq!(connect.on_success, ResourceState::Connected);

        let disconnect = ResourceState::Connected
            .begin(ResourceOp::Disconnect)
            .unwrap();
        assert_eq!(disconnect.on_success, ResourceState::Disconnected);

        let cleanup = ResourceState::Disconnected
            .begin(ResourceOp::Cleanup)
            .unwrap();
        assert_eq!(cleanup.on_success, ResourceState::Destroyed);
    }

    #[test]
    fn test_reconnect_after_disconnect() {
        assert!(ResourceState::Disconnected
            .begin(ResourceOp::Connect)
            .is_ok());
    }

    #[test]
    fn test_disconnect_from_error_state() {
        assert!(ResourceState::Error.begin(ResourceOp::Disconnect).is_ok());
    }

    #[test]
    fn test_invalid_transitions_name_requirements() {
        let err = ResourceState::Connected
            .begin(ResourceOp::Initialize)
            .unwrap_err();
        assert_eq!(err.current, ResourceState::Connected);
        assert_eq!(err.required, "`created`");

        let err = ResourceState::Created.begin(ResourceOp::Connect).unwrap_err();
        assert_eq!(err.required, "`ready` or `disconnected`");

        assert!(ResourceState::Destroyed.begin(ResourceOp::Cleanup).is_err());
    }
}
