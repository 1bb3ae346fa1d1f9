//! Startup decision policy.
//!
//! The surrounding boot loop validates both application banks through
//! the partition manager, reads the running application's request out of
//! battery-backed RAM, and asks this policy what to do. Jumping to an
//! image, or staying in update mode, is the loop's job.

use super::partitions::{ActiveBank, BankIndex, PartitionState};

/// One-shot request left behind by the running application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpdateRequest {
    #[default]
    None,
    /// Stay in the bootloader and wait for a host tool.
    Update,
    /// Boot this bank now, without persisting the selection.
    BootBank0,
    BootBank1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootDecision {
    Boot(BankIndex),
    /// Stay in update mode and run transfer sessions.
    Update,
}

/// Decides between booting and update mode.
///
/// Any invalid bank forces update mode — a half-flashed partition must
/// be reflashed, not booted around. An explicit update request does the
/// same. Otherwise the active bank boots if its image verifies, with
/// failover to the other bank; the application may also request one
/// specific bank as a one-shot override that diverges from the
/// persisted selector.
pub fn boot_decision(
    states: [PartitionState; 2],
    active: ActiveBank,
    request: UpdateRequest,
) -> BootDecision {
    if states.contains(&PartitionState::Invalid) {
        warning!("invalid application bank, forcing update mode");
        return BootDecision::Update;
    }
    match request {
        UpdateRequest::Update => {
            info!("application requested update mode");
            return BootDecision::Update;
        }
        UpdateRequest::BootBank0 if states[0] == PartitionState::Valid => {
            return BootDecision::Boot(BankIndex::Bank0);
        }
        UpdateRequest::BootBank1 if states[1] == PartitionState::Valid => {
            return BootDecision::Boot(BankIndex::Bank1);
        }
        _ => {}
    }

    match active.index() {
        Some(bank) if states[bank.as_usize()] == PartitionState::Valid => {
            BootDecision::Boot(bank)
        }
        Some(bank) if states[bank.other().as_usize()] == PartitionState::Valid => {
            warning!("active bank not bootable, failing over");
            BootDecision::Boot(bank.other())
        }
        _ => BootDecision::Update,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use PartitionState::{Empty, Invalid, Valid};

    #[test]
    fn any_invalid_bank_forces_update_mode() {
        for states in [[Invalid, Valid], [Valid, Invalid], [Invalid, Invalid], [Invalid, Empty]] {
            assert_eq!(
                boot_decision(states, ActiveBank::Bank0, UpdateRequest::None),
                BootDecision::Update
            );
        }
    }

    #[test]
    fn active_bank_boots_when_valid() {
        assert_eq!(
            boot_decision([Valid, Valid], ActiveBank::Bank1, UpdateRequest::None),
            BootDecision::Boot(BankIndex::Bank1)
        );
    }

    #[test]
    fn failover_to_the_other_valid_bank() {
        assert_eq!(
            boot_decision([Valid, Empty], ActiveBank::Bank1, UpdateRequest::None),
            BootDecision::Boot(BankIndex::Bank0)
        );
    }

    #[test]
    fn fresh_device_stays_in_update_mode() {
        assert_eq!(
            boot_decision([Empty, Empty], ActiveBank::None, UpdateRequest::None),
            BootDecision::Update
        );
    }

    #[test]
    fn application_update_request_wins_over_valid_banks() {
        assert_eq!(
            boot_decision([Valid, Valid], ActiveBank::Bank0, UpdateRequest::Update),
            BootDecision::Update
        );
    }

    #[test]
    fn one_shot_bank_override_diverges_from_the_persisted_selector() {
        assert_eq!(
            boot_decision([Valid, Valid], ActiveBank::Bank0, UpdateRequest::BootBank1),
            BootDecision::Boot(BankIndex::Bank1)
        );
        // But never onto an unproven bank.
        assert_eq!(
            boot_decision([Valid, Empty], ActiveBank::Bank0, UpdateRequest::BootBank1),
            BootDecision::Boot(BankIndex::Bank0)
        );
    }
}
