use crate::models::{DownloadState, FailureDetail, FailureKind, FailurePhase, StatusEvent};

/// Result of mapping one transfer notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: DownloadState,
    /// Progress to report, if the event carries any.
    pub progress: Option<f64>,
    /// Completion signals from the event stream are informational only; the
    /// availability and content read sequence decides the outcome.
    pub advisory: bool,
}

/// Translates transfer notifications into session transitions.
pub struct StatusMapper;

impl StatusMapper {
    /// Maps `event` given the last fraction reported for the same attempt.
    /// Reported fractions never go below `last_fraction` and stay in 0.0..=1.0.
    pub fn map(event: &StatusEvent, last_fraction: f64) -> Transition {
        let floor = clamp_fraction(last_fraction, 0.0);
        match event {
            StatusEvent::Began => Transition {
                state: DownloadState::Downloading(floor),
                progress: Some(floor),
                advisory: false,
            },
            StatusEvent::Paused => Transition {
                state: DownloadState::Paused,
                progress: None,
                advisory: false,
            },
            StatusEvent::Downloading(fraction) => {
                let fraction = clamp_fraction(*fraction, floor).max(floor);
                Transition {
                    state: DownloadState::Downloading(fraction),
                    progress: Some(fraction),
                    advisory: false,
                }
            }
            StatusEvent::Finished => Transition {
                state: DownloadState::Finished,
                progress: None,
                advisory: true,
            },
            StatusEvent::Failed(reason) => Transition {
                state: DownloadState::Failed(FailureDetail::new(
                    FailurePhase::Availability,
                    FailureKind::NetworkFailure,
                    reason.clone(),
                )),
                progress: None,
                advisory: true,
            },
        }
    }
}

fn clamp_fraction(fraction: f64, fallback: f64) -> f64 {
    if fraction.is_nan() {
        fallback
    } else {
        fraction.clamp(0.0, 1.0)
    }
}
