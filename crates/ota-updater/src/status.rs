use std::fmt;
use std::str::FromStr;

use ota_proto::ota::v1::UpdateState;

/// Client-side view of an update cycle.
///
/// The first twelve variants mirror the engine's own status codes; the last
/// three only ever originate from the updater.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpdateStatus {
    Idle,
    CheckingForUpdate,
    UpdateAvailable,
    Downloading,
    Verifying,
    Finalizing,
    UpdatedNeedReboot,
    ReportingErrorEvent,
    AttemptingRollback,
    Disabled,
    NeedPermissionToUpdate,
    CleanupPreviousUpdate,
    Suspended,
    PreparingToUpdate,
    FailedPreparingUpdate,
}

const ALL_STATUSES: [UpdateStatus; 15] = [
    UpdateStatus::Idle,
    UpdateStatus::CheckingForUpdate,
    UpdateStatus::UpdateAvailable,
    UpdateStatus::Downloading,
    UpdateStatus::Verifying,
    UpdateStatus::Finalizing,
    UpdateStatus::UpdatedNeedReboot,
    UpdateStatus::ReportingErrorEvent,
    UpdateStatus::AttemptingRollback,
    UpdateStatus::Disabled,
    UpdateStatus::NeedPermissionToUpdate,
    UpdateStatus::CleanupPreviousUpdate,
    UpdateStatus::Suspended,
    UpdateStatus::PreparingToUpdate,
    UpdateStatus::FailedPreparingUpdate,
];

impl UpdateStatus {
    pub fn all() -> &'static [UpdateStatus] {
        &ALL_STATUSES
    }

    /// Stable name used for persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateStatus::Idle => "IDLE",
            UpdateStatus::CheckingForUpdate => "CHECKING_FOR_UPDATE",
            UpdateStatus::UpdateAvailable => "UPDATE_AVAILABLE",
            UpdateStatus::Downloading => "DOWNLOADING",
            UpdateStatus::Verifying => "VERIFYING",
            UpdateStatus::Finalizing => "FINALIZING",
            UpdateStatus::UpdatedNeedReboot => "UPDATED_NEED_REBOOT",
            UpdateStatus::ReportingErrorEvent => "REPORTING_ERROR_EVENT",
            UpdateStatus::AttemptingRollback => "ATTEMPTING_ROLLBACK",
            UpdateStatus::Disabled => "DISABLED",
            UpdateStatus::NeedPermissionToUpdate => "NEED_PERMISSION_TO_UPDATE",
            UpdateStatus::CleanupPreviousUpdate => "CLEANUP_PREVIOUS_UPDATE",
            UpdateStatus::Suspended => "SUSPENDED",
            UpdateStatus::PreparingToUpdate => "PREPARING_TO_UPDATE",
            UpdateStatus::FailedPreparingUpdate => "FAILED_PREPARING_UPDATE",
        }
    }

    /// A sequence is being prepared or is in flight on the engine.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            UpdateStatus::PreparingToUpdate
                | UpdateStatus::Downloading
                | UpdateStatus::Suspended
                | UpdateStatus::Verifying
                | UpdateStatus::Finalizing
                | UpdateStatus::AttemptingRollback
                | UpdateStatus::CleanupPreviousUpdate
        )
    }

    /// Progress is only meaningful in these states.
    pub fn is_active_transfer(self) -> bool {
        matches!(
            self,
            UpdateStatus::Downloading
                | UpdateStatus::Suspended
                | UpdateStatus::Verifying
                | UpdateStatus::Finalizing
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            UpdateStatus::FailedPreparingUpdate | UpdateStatus::ReportingErrorEvent
        )
    }

    pub fn to_proto(self) -> UpdateState {
        match self {
            UpdateStatus::Idle => UpdateState::Idle,
            UpdateStatus::CheckingForUpdate => UpdateState::CheckingForUpdate,
            UpdateStatus::UpdateAvailable => UpdateState::UpdateAvailable,
            UpdateStatus::Downloading => UpdateState::Downloading,
            UpdateStatus::Verifying => UpdateState::Verifying,
            UpdateStatus::Finalizing => UpdateState::Finalizing,
            UpdateStatus::UpdatedNeedReboot => UpdateState::UpdatedNeedReboot,
            UpdateStatus::ReportingErrorEvent => UpdateState::ReportingErrorEvent,
            UpdateStatus::AttemptingRollback => UpdateState::AttemptingRollback,
            UpdateStatus::Disabled => UpdateState::Disabled,
            UpdateStatus::NeedPermissionToUpdate => UpdateState::NeedPermissionToUpdate,
            UpdateStatus::CleanupPreviousUpdate => UpdateState::CleanupPreviousUpdate,
            UpdateStatus::Suspended => UpdateState::Suspended,
            UpdateStatus::PreparingToUpdate => UpdateState::PreparingToUpdate,
            UpdateStatus::FailedPreparingUpdate => UpdateState::FailedPreparingUpdate,
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        ALL_STATUSES
            .iter()
            .copied()
            .find(|status| status.as_str() == name)
            .ok_or_else(|| format!("unknown update status '{name}'"))
    }
}

/// Status code reported by the engine's callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Known(UpdateStatus),
    Unknown(i32),
}

impl EngineStatus {
    pub fn from_code(code: i32) -> Self {
        let status = match code {
            0 => UpdateStatus::Idle,
            1 => UpdateStatus::CheckingForUpdate,
            2 => UpdateStatus::UpdateAvailable,
            3 => UpdateStatus::Downloading,
            4 => UpdateStatus::Verifying,
            5 => UpdateStatus::Finalizing,
            6 => UpdateStatus::UpdatedNeedReboot,
            7 => UpdateStatus::ReportingErrorEvent,
            8 => UpdateStatus::AttemptingRollback,
            9 => UpdateStatus::Disabled,
            10 => UpdateStatus::NeedPermissionToUpdate,
            11 => UpdateStatus::CleanupPreviousUpdate,
            other => return EngineStatus::Unknown(other),
        };
        EngineStatus::Known(status)
    }
}

/// Decides whether an engine-reported status replaces the current one.
///
/// Returns `None` when the engine status must be masked.
pub fn reconcile(current: UpdateStatus, incoming: UpdateStatus) -> Option<UpdateStatus> {
    match incoming {
        // Engine idle only ends a real transfer; anything else is a stale
        // report from before the app took control.
        UpdateStatus::Idle => matches!(
            current,
            UpdateStatus::Downloading
                | UpdateStatus::Verifying
                | UpdateStatus::Finalizing
                | UpdateStatus::UpdatedNeedReboot
        )
        .then_some(UpdateStatus::Idle),
        UpdateStatus::CheckingForUpdate | UpdateStatus::UpdateAvailable => None,
        // The engine keeps reporting downloading for a moment after a pause.
        UpdateStatus::Downloading if current == UpdateStatus::Suspended => None,
        UpdateStatus::Suspended
        | UpdateStatus::PreparingToUpdate
        | UpdateStatus::FailedPreparingUpdate => None,
        other => Some(other),
    }
}

/// Engine progress is a 0.0-1.0 fraction.
pub fn percent_from_fraction(fraction: f32) -> u32 {
    if !fraction.is_finite() {
        return 0;
    }
    (fraction.clamp(0.0, 1.0) * 100.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_codes_map_in_engine_order() {
        assert_eq!(EngineStatus::from_code(0), EngineStatus::Known(UpdateStatus::Idle));
        assert_eq!(
            EngineStatus::from_code(3),
            EngineStatus::Known(UpdateStatus::Downloading)
        );
        assert_eq!(
            EngineStatus::from_code(6),
            EngineStatus::Known(UpdateStatus::UpdatedNeedReboot)
        );
        assert_eq!(
            EngineStatus::from_code(11),
            EngineStatus::Known(UpdateStatus::CleanupPreviousUpdate)
        );
    }

    #[test]
    fn app_only_codes_are_unknown_to_the_engine() {
        assert_eq!(EngineStatus::from_code(12), EngineStatus::Unknown(12));
        assert_eq!(EngineStatus::from_code(-1), EngineStatus::Unknown(-1));
        assert_eq!(EngineStatus::from_code(i32::MAX), EngineStatus::Unknown(i32::MAX));
    }

    #[test]
    fn names_parse_back() {
        for status in UpdateStatus::all() {
            assert_eq!(status.as_str().parse::<UpdateStatus>(), Ok(*status));
        }
        assert!("SOMETHING_ELSE".parse::<UpdateStatus>().is_err());
    }

    #[test]
    fn downloading_is_masked_while_suspended() {
        assert_eq!(
            reconcile(UpdateStatus::Suspended, UpdateStatus::Downloading),
            None
        );
        assert_eq!(
            reconcile(UpdateStatus::Downloading, UpdateStatus::Downloading),
            Some(UpdateStatus::Downloading)
        );
    }

    #[test]
    fn app_controlled_states_survive_engine_idle() {
        for current in [
            UpdateStatus::Idle,
            UpdateStatus::CheckingForUpdate,
            UpdateStatus::UpdateAvailable,
            UpdateStatus::PreparingToUpdate,
            UpdateStatus::FailedPreparingUpdate,
            UpdateStatus::Suspended,
        ] {
            assert_eq!(reconcile(current, UpdateStatus::Idle), None, "{current}");
        }
        assert_eq!(
            reconcile(UpdateStatus::Downloading, UpdateStatus::Idle),
            Some(UpdateStatus::Idle)
        );
        assert_eq!(
            reconcile(UpdateStatus::UpdatedNeedReboot, UpdateStatus::Idle),
            Some(UpdateStatus::Idle)
        );
    }

    #[test]
    fn discovery_states_from_engine_are_ignored() {
        for current in UpdateStatus::all() {
            assert_eq!(reconcile(*current, UpdateStatus::CheckingForUpdate), None);
            assert_eq!(reconcile(*current, UpdateStatus::UpdateAvailable), None);
        }
    }

    #[test]
    fn other_engine_states_are_adopted() {
        for incoming in [
            UpdateStatus::Verifying,
            UpdateStatus::Finalizing,
            UpdateStatus::UpdatedNeedReboot,
            UpdateStatus::ReportingErrorEvent,
            UpdateStatus::AttemptingRollback,
            UpdateStatus::Disabled,
        ] {
            assert_eq!(reconcile(UpdateStatus::Suspended, incoming), Some(incoming));
            assert_eq!(reconcile(UpdateStatus::Downloading, incoming), Some(incoming));
        }
    }

    #[test]
    fn progress_fraction_is_truncated_and_clamped() {
        assert_eq!(percent_from_fraction(0.0), 0);
        assert_eq!(percent_from_fraction(0.429), 42);
        assert_eq!(percent_from_fraction(1.0), 100);
        assert_eq!(percent_from_fraction(1.7), 100);
        assert_eq!(percent_from_fraction(-0.2), 0);
        assert_eq!(percent_from_fraction(f32::NAN), 0);
    }
}
