//! Background admission: JIT size limits, the per-context code cap and the
//! speculative compilation budget.

use std::fmt::Display;
use std::sync::{Mutex, MutexGuard, PoisonError};

use oopjit_common::{AdmissionConfig, FunctionSnapshot};
use tracing::trace;

/// Why a background request was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    /// Speculative request over both speculation caps.
    OverBudget,
    /// Bytecode count or byte length above the JIT limits.
    FunctionTooLarge,
    /// The context already produced more native code than allowed.
    ContextCodeLimit,
    /// A background compilation of the same source and tier failed before.
    PreviouslyFailed,
}

impl Display for DeclineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OverBudget => write!(f, "speculation budget exhausted"),
            Self::FunctionTooLarge => write!(f, "function too large"),
            Self::ContextCodeLimit => write!(f, "native code limit reached"),
            Self::PreviouslyFailed => write!(f, "previously failed"),
        }
    }
}

#[derive(Debug, Default)]
struct AdmissionState {
    /// Bytecode instructions admitted speculatively in this epoch.
    speculative_bytecodes: u64,
    native_code_bytes: u64,
}

#[derive(Debug)]
pub struct AdmissionPolicy {
    config: AdmissionConfig,
    state: Mutex<AdmissionState>,
}

impl AdmissionPolicy {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AdmissionState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks a background request and, when it is speculative and admitted,
    /// charges its bytecode count to the current epoch.
    ///
    /// A speculative request fits while the epoch total stays under the hard
    /// cap. Past it, the request is still admitted under the profile-gated
    /// soft cap when its profile says it is small and loop-dominated.
    pub fn admit(&self, snapshot: &FunctionSnapshot, speculative: bool) -> Result<(), DeclineReason> {
        let bytecode = &snapshot.bytecode;
        if bytecode.byte_code_count > self.config.max_function_bytecode_count
            || bytecode.byte_code_length > self.config.max_function_bytecode_length
        {
            return Err(DeclineReason::FunctionTooLarge);
        }

        let mut state = self.state();
        if state.native_code_bytes > self.config.max_context_native_code_bytes {
            return Err(DeclineReason::ContextCodeLimit);
        }
        if !speculative {
            return Ok(());
        }

        let total = state
            .speculative_bytecodes
            .saturating_add(u64::from(bytecode.byte_code_count));
        let under_hard_cap = total < self.config.speculation_cap;
        let under_soft_cap =
            total < self.config.profile_based_speculation_cap && snapshot.is_loop_dominated_and_small();
        if !(under_hard_cap || under_soft_cap) {
            trace!(function = %snapshot.function, total, "Speculative request over budget");
            return Err(DeclineReason::OverBudget);
        }
        state.speculative_bytecodes = total;
        Ok(())
    }

    /// Gives back what [`Self::admit`] charged for a request that was
    /// admitted but never queued.
    pub fn refund(&self, snapshot: &FunctionSnapshot, speculative: bool) {
        if !speculative {
            return;
        }
        let mut state = self.state();
        state.speculative_bytecodes = state
            .speculative_bytecodes
            .saturating_sub(u64::from(snapshot.bytecode.byte_code_count));
    }

    /// Starts a new speculation epoch.
    pub fn begin_epoch(&self) {
        self.state().speculative_bytecodes = 0;
    }

    pub fn speculative_bytecodes(&self) -> u64 {
        self.state().speculative_bytecodes
    }

    pub fn record_native_code(&self, bytes: usize) {
        let bytes = u64::try_from(bytes).unwrap_or(u64::MAX);
        let mut state = self.state();
        state.native_code_bytes = state.native_code_bytes.saturating_add(bytes);
    }

    pub fn release_native_code(&self, bytes: usize) {
        let bytes = u64::try_from(bytes).unwrap_or(u64::MAX);
        let mut state = self.state();
        state.native_code_bytes = state.native_code_bytes.saturating_sub(bytes);
    }

    pub fn native_code_bytes(&self) -> u64 {
        self.state().native_code_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oopjit_common::{BytecodeInfo, ProfileSnapshot, SourceHandle};

    fn config() -> AdmissionConfig {
        AdmissionConfig {
            speculation_cap: 100,
            profile_based_speculation_cap: 1000,
            ..Default::default()
        }
    }

    fn snapshot(count: u32, in_loop: u32, executed: bool) -> FunctionSnapshot {
        FunctionSnapshot::new(SourceHandle(1), "f")
            .with_bytecode(BytecodeInfo {
                byte_code_count: count,
                byte_code_in_loop_count: in_loop,
                byte_code_length: count * 2,
                loop_count: u32::from(in_loop > 0),
            })
            .with_profile(ProfileSnapshot {
                executed,
                ..Default::default()
            })
    }

    #[test]
    fn test_refund_returns_the_charge() {
        let policy = AdmissionPolicy::new(config());
        policy.admit(&snapshot(30, 0, false), true).unwrap();
        policy.admit(&snapshot(50, 0, false), true).unwrap();
        assert_eq!(policy.speculative_bytecodes(), 80);

        policy.refund(&snapshot(50, 0, false), true);
        assert_eq!(policy.speculative_bytecodes(), 30);
        // Non-speculative requests were never charged
        policy.refund(&snapshot(30, 0, false), false);
        assert_eq!(policy.speculative_bytecodes(), 30);

        // A refund after a new epoch cannot go below zero
        policy.begin_epoch();
        policy.refund(&snapshot(30, 0, false), true);
        assert_eq!(policy.speculative_bytecodes(), 0);
    }

    #[test]
    fn test_hard_cap_then_soft_cap() {
        let policy = AdmissionPolicy::new(config());

        // Fits under the hard cap
        policy.admit(&snapshot(60, 0, false), true).unwrap();
        assert_eq!(policy.speculative_bytecodes(), 60);

        // Over the hard cap and no profile
        assert_eq!(
            policy.admit(&snapshot(400, 0, false), true),
            Err(DeclineReason::OverBudget)
        );
        assert_eq!(policy.speculative_bytecodes(), 60);

        // Over the hard cap but a hot, loop-dominated function
        policy.admit(&snapshot(400, 300, true), true).unwrap();
        assert_eq!(policy.speculative_bytecodes(), 460);
    }

    #[test]
    fn test_soft_cap_is_a_ceiling() {
        let policy = AdmissionPolicy::new(config());
        assert_eq!(
            policy.admit(&snapshot(2000, 1900, true), true),
            Err(DeclineReason::OverBudget)
        );
    }

    #[test]
    fn test_epoch_resets_budget() {
        let policy = AdmissionPolicy::new(config());
        policy.admit(&snapshot(90, 0, false), true).unwrap();
        assert!(policy.admit(&snapshot(90, 0, false), true).is_err());

        policy.begin_epoch();
        policy.admit(&snapshot(90, 0, false), true).unwrap();
    }

    #[test]
    fn test_non_speculative_skips_budget() {
        let policy = AdmissionPolicy::new(config());
        policy.admit(&snapshot(5000, 0, false), false).unwrap();
        assert_eq!(policy.speculative_bytecodes(), 0);
    }

    #[test]
    fn test_jit_limits() {
        let policy = AdmissionPolicy::new(AdmissionConfig {
            max_function_bytecode_count: 10,
            max_context_native_code_bytes: 64,
            ..config()
        });
        assert_eq!(
            policy.admit(&snapshot(11, 0, false), false),
            Err(DeclineReason::FunctionTooLarge)
        );

        policy.record_native_code(65);
        assert_eq!(
            policy.admit(&snapshot(1, 0, false), false),
            Err(DeclineReason::ContextCodeLimit)
        );
        policy.release_native_code(65);
        policy.admit(&snapshot(1, 0, false), false).unwrap();
    }
}
