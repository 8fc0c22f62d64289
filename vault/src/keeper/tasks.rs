//! Task pipeline vocabulary and the per-agent connection state machine.

use crate::transport::FailureSymbol;
use std::fmt::{Display, Formatter};

/// Tasks the keeper can run against one agent, in declared order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeeperTaskKind {
    EnrollSubordinates,
    SyncObjects,
    GetState,
}

impl KeeperTaskKind {
    pub fn parse(name: &str) -> Option<KeeperTaskKind> {
        match name {
            "enroll_subordinates" => Some(KeeperTaskKind::EnrollSubordinates),
            "sync_objects" => Some(KeeperTaskKind::SyncObjects),
            "get_state" => Some(KeeperTaskKind::GetState),
            _ => None,
        }
    }

    /// The default per-agent pipeline.
    pub fn default_pipeline() -> Vec<KeeperTaskKind> {
        vec![
            KeeperTaskKind::EnrollSubordinates,
            KeeperTaskKind::SyncObjects,
            KeeperTaskKind::GetState,
        ]
    }
}

impl Display for KeeperTaskKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KeeperTaskKind::EnrollSubordinates => "enroll_subordinates",
            KeeperTaskKind::SyncObjects => "sync_objects",
            KeeperTaskKind::GetState => "get_state",
        };
        write!(f, "{name}")
    }
}

/// Keeper's view of one agent connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Discovered,
    Connecting,
    Connected,
    Authenticating,
    Encrypted,
    Enrolling,
    Enrolled,
    TlsConnected,
    Ready,
    Disconnected,
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Transport(FailureSymbol),
    Enrollment,
    Task(String),
}

impl Display for ConnectionPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionPhase::Discovered => write!(f, "DISCOVERED"),
            ConnectionPhase::Connecting => write!(f, "CONNECTING"),
            ConnectionPhase::Connected => write!(f, "CONNECTED"),
            ConnectionPhase::Authenticating => write!(f, "AUTHENTICATING"),
            ConnectionPhase::Encrypted => write!(f, "ENCRYPTED"),
            ConnectionPhase::Enrolling => write!(f, "ENROLLING"),
            ConnectionPhase::Enrolled => write!(f, "ENROLLED"),
            ConnectionPhase::TlsConnected => write!(f, "TLS_CONNECTED"),
            ConnectionPhase::Ready => write!(f, "READY"),
            ConnectionPhase::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionPhase::Failed(reason) => write!(f, "FAILED({reason:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_names_round_trip() {
        for task in KeeperTaskKind::default_pipeline() {
            assert_eq!(KeeperTaskKind::parse(&task.to_string()), Some(task));
        }
        assert_eq!(KeeperTaskKind::parse("flarp"), None);
    }

    #[test]
    fn test_default_pipeline_order() {
        assert_eq!(
            KeeperTaskKind::default_pipeline(),
            vec![
                KeeperTaskKind::EnrollSubordinates,
                KeeperTaskKind::SyncObjects,
                KeeperTaskKind::GetState,
            ]
        );
    }
}
