//! 顺序枚举器的单字原子状态机。
//!
//! ## 状态转移（What）
//! ```text
//! Initial ──advance──▶ MoveNextStarted ──item──▶ MoveNextEnded ──take_current──▶ CurrentReading ─┐
//!                           │   ▲                     │                                          │
//!                           │   └──────advance────────┘◀─────────────────────────────────────────┘
//!                           └──exhausted──▶ Ended
//! MoveNextStarted / MoveNextEnded / Ended ──end──▶ Resetting ──▶ Initial
//! ```
//! 所有转移都是对单个 `AtomicU8` 的 CAS；失败的 CAS 即意味着并发误用，由调用方转换为错误。

use std::sync::atomic::{AtomicU8, Ordering};

/// 顺序枚举器的生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnumerationState {
    /// 尚未开始（或上一轮已被 `end` 复位）。
    Initial = 0,
    /// 一次步进正在进行，生产者续延尚未返回。
    MoveNextStarted = 1,
    /// 步进已完成；当前元素可能尚未被读取，也可能已被取走（以槽位是否为空为准）。
    MoveNextEnded = 2,
    /// `take_current` 正在独占槽位。
    CurrentReading = 3,
    /// 生产者已报告没有更多元素。
    Ended = 4,
    /// `end` 正在排空续延并调用结束通知。
    Resetting = 5,
}

impl EnumerationState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Initial,
            1 => Self::MoveNextStarted,
            2 => Self::MoveNextEnded,
            3 => Self::CurrentReading,
            4 => Self::Ended,
            _ => Self::Resetting,
        }
    }
}

/// `EnumerationState` 的原子容器。
#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) const fn new(state: EnumerationState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> EnumerationState {
        EnumerationState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: EnumerationState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// 单次 CAS；失败时返回实际观察到的状态。
    pub(crate) fn transition(
        &self,
        from: EnumerationState,
        to: EnumerationState,
    ) -> Result<(), EnumerationState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(EnumerationState::from_u8)
    }

    /// 依次尝试多个源状态，返回成功转移前的源状态。
    pub(crate) fn transition_from_any(
        &self,
        from: &[EnumerationState],
        to: EnumerationState,
    ) -> Result<EnumerationState, EnumerationState> {
        let mut observed = self.load();
        for candidate in from {
            match self.transition(*candidate, to) {
                Ok(()) => return Ok(*candidate),
                Err(actual) => observed = actual,
            }
        }
        Err(observed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_reports_observed_state_on_conflict() {
        let state = AtomicState::new(EnumerationState::Initial);
        assert!(
            state
                .transition(EnumerationState::Initial, EnumerationState::MoveNextStarted)
                .is_ok()
        );
        assert_eq!(
            state.transition(EnumerationState::Initial, EnumerationState::MoveNextStarted),
            Err(EnumerationState::MoveNextStarted)
        );
    }

    #[test]
    fn transition_from_any_returns_matched_source() {
        let state = AtomicState::new(EnumerationState::Ended);
        let from = state.transition_from_any(
            &[
                EnumerationState::MoveNextStarted,
                EnumerationState::MoveNextEnded,
                EnumerationState::Ended,
            ],
            EnumerationState::Resetting,
        );
        assert_eq!(from, Ok(EnumerationState::Ended));
        assert_eq!(state.load(), EnumerationState::Resetting);
    }
}
