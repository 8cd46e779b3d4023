//! Stage engine error types.
//!
//! Propagation policy: local-media and signaling-join failures abort the
//! whole session and surface as a terminal state; single-peer negotiation
//! failures are contained to that peer link and the call continues with the
//! remaining participants. Resource-leak guard violations are logged, never
//! returned to the consumer.

use crate::types::UserId;
use thiserror::Error;

/// Failure to acquire a capture device.
///
/// User-actionable; never retried automatically.
#[derive(Debug, Clone, Error)]
pub enum MediaAcquisitionError {
    /// The user denied the capture permission prompt.
    #[error("Media permission denied")]
    PermissionDenied,

    /// The device exists but is busy or unreadable.
    #[error("Media device unavailable: {0}")]
    DeviceUnavailable(String),

    /// No device matches the requested device id.
    #[error("Media device not found: {0}")]
    DeviceNotFound(String),

    /// Acquisition was interrupted before it completed.
    #[error("Media acquisition aborted")]
    Aborted,
}

/// Failure on the signaling channel.
///
/// Retriable with backoff by the reconnection policy.
#[derive(Debug, Clone, Error)]
pub enum SignalingError {
    /// The channel could not be reached.
    #[error("Signaling channel unreachable: {0}")]
    Unreachable(String),

    /// The channel rejected the join.
    #[error("Signaling join rejected: {0}")]
    JoinRejected(String),

    /// An operation required a joined channel.
    #[error("Not joined to a signaling channel")]
    NotJoined,

    /// The join did not acknowledge within the bounded timeout.
    #[error("Signaling join timed out")]
    Timeout,
}

/// Failure negotiating a single peer link.
///
/// Isolated to that link; other links are unaffected.
#[derive(Debug, Clone, Error)]
pub enum NegotiationError {
    /// The remote side or transport rejected a session description.
    #[error("SDP rejected: {0}")]
    SdpRejected(String),

    /// A candidate could not be applied.
    #[error("ICE failure: {0}")]
    IceFailure(String),

    /// The transport does not support in-place track replacement.
    #[error("In-place track replacement unsupported")]
    ReplaceUnsupported,

    /// The transport is already closed.
    #[error("Peer transport closed")]
    TransportClosed,

    /// Offer/answer did not complete within the bounded timeout.
    #[error("Negotiation timed out")]
    Timeout,
}

/// Stage engine error type.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// Local capture acquisition failed.
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaAcquisitionError),

    /// Signaling channel failure.
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Negotiation with one remote participant failed.
    #[error("Negotiation with {remote_user_id} failed: {source}")]
    Negotiation {
        remote_user_id: UserId,
        #[source]
        source: NegotiationError,
    },

    /// The requested action is not valid in the current session state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Reconnection attempts exhausted the configured cap.
    #[error("Reconnection failed after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },

    /// The operation was cancelled by a concurrent leave or disposal.
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StageError {
    /// Returns a bounded label string for the error variant (for metrics).
    ///
    /// Uses enum variant names, not error message content, so label
    /// cardinality stays bounded.
    #[must_use]
    pub fn error_type_label(&self) -> &'static str {
        match self {
            StageError::MediaAcquisition(_) => "media_acquisition",
            StageError::Signaling(_) => "signaling",
            StageError::Negotiation { .. } => "negotiation",
            StageError::InvalidState(_) => "invalid_state",
            StageError::AttemptsExhausted { .. } => "attempts_exhausted",
            StageError::Cancelled => "cancelled",
            StageError::Internal(_) => "internal",
        }
    }

    /// Returns a human-readable message suitable for direct display.
    ///
    /// Internal details stay in logs; the consumer gets an actionable
    /// sentence.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            StageError::MediaAcquisition(MediaAcquisitionError::PermissionDenied) => {
                "Camera or microphone access was denied".to_string()
            }
            StageError::MediaAcquisition(MediaAcquisitionError::DeviceNotFound(_)) => {
                "The selected device is no longer available".to_string()
            }
            StageError::MediaAcquisition(_) => {
                "Camera or microphone could not be started".to_string()
            }
            StageError::Signaling(_) => "Could not reach the stage".to_string(),
            StageError::Negotiation { remote_user_id, .. } => {
                format!("Connection to {remote_user_id} failed")
            }
            StageError::InvalidState(msg) => msg.clone(),
            StageError::AttemptsExhausted { .. } => {
                "Connection lost and could not be re-established".to_string()
            }
            StageError::Cancelled => "The call was closed before setup finished".to_string(),
            StageError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// Whether the reconnection policy may retry after this error.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, StageError::Signaling(_))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_labels_are_bounded() {
        assert_eq!(
            StageError::MediaAcquisition(MediaAcquisitionError::PermissionDenied)
                .error_type_label(),
            "media_acquisition"
        );
        assert_eq!(
            StageError::Signaling(SignalingError::Timeout).error_type_label(),
            "signaling"
        );
        assert_eq!(
            StageError::Negotiation {
                remote_user_id: UserId::from("u2"),
                source: NegotiationError::Timeout,
            }
            .error_type_label(),
            "negotiation"
        );
        assert_eq!(
            StageError::AttemptsExhausted { attempts: 5 }.error_type_label(),
            "attempts_exhausted"
        );
        assert_eq!(StageError::Cancelled.error_type_label(), "cancelled");
    }

    #[test]
    fn test_user_messages_hide_internal_details() {
        let err = StageError::Internal("mpsc channel closed at orchestrator".to_string());
        assert_eq!(err.user_message(), "An internal error occurred");
        assert!(!err.user_message().contains("mpsc"));

        let err = StageError::Signaling(SignalingError::Unreachable(
            "ws://10.0.0.3:9090 refused".to_string(),
        ));
        assert!(!err.user_message().contains("10.0.0.3"));
    }

    #[test]
    fn test_only_signaling_errors_are_retriable() {
        assert!(StageError::Signaling(SignalingError::Timeout).is_retriable());
        assert!(
            !StageError::MediaAcquisition(MediaAcquisitionError::PermissionDenied).is_retriable()
        );
        assert!(!StageError::Cancelled.is_retriable());
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!(
                "{}",
                StageError::MediaAcquisition(MediaAcquisitionError::PermissionDenied)
            ),
            "Media acquisition failed: Media permission denied"
        );
        assert_eq!(
            format!(
                "{}",
                StageError::Negotiation {
                    remote_user_id: UserId::from("u7"),
                    source: NegotiationError::SdpRejected("bad fingerprint".to_string()),
                }
            ),
            "Negotiation with u7 failed: SDP rejected: bad fingerprint"
        );
    }
}
