//! 读写器的独占标记。
//!
//! ```text
//!            claim                      create_limited_sub_*
//!   Idle ─────────────▶ Busy   Idle ──────────────────────▶ InnerActive
//!    ▲                   │                                       │
//!    └──── release ──────┘        子对象释放（无余量）  ◀────────┘
//!                                 子对象释放（流上仍有余量）──▶ WaitingForInnerRemainder
//!   WaitingForInnerRemainder ── claim ──▶ Busy（本次操作先排空余量）
//! ```
//!
//! 所有转移都是单字节 CAS；领取失败立即以 [`StreamError::Busy`] 报告，绝不等待。

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Result, StreamError};

/// 读写器的独占状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamState {
    /// 空闲，可接受新操作。
    Idle = 0,
    /// 正在执行一个操作。
    Busy = 1,
    /// 存活的子读写器独占共享缓冲。
    InnerActive = 2,
    /// 已释放的子读取器在流上留有未读余量，由下一次操作惰性排空。
    WaitingForInnerRemainder = 3,
}

impl StreamState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Busy,
            2 => Self::InnerActive,
            _ => Self::WaitingForInnerRemainder,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Gate(AtomicU8);

impl Gate {
    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(StreamState::Idle as u8))
    }

    pub(crate) fn load(&self) -> StreamState {
        StreamState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: StreamState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// 领取独占权；返回的凭证在析构时恢复到领取前的空闲类状态（或调用方指定的状态）。
    pub(crate) fn claim(&self, operation: &'static str) -> Result<Claim<'_>> {
        for from in [StreamState::Idle, StreamState::WaitingForInnerRemainder] {
            if self
                .0
                .compare_exchange(
                    from as u8,
                    StreamState::Busy as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(Claim {
                    gate: self,
                    release_to: from,
                });
            }
        }
        Err(StreamError::Busy {
            operation,
            state: self.load(),
        })
    }
}

/// 独占凭证。
#[derive(Debug)]
pub(crate) struct Claim<'g> {
    gate: &'g Gate,
    release_to: StreamState,
}

impl Claim<'_> {
    /// 领取前的状态。
    pub(crate) fn claimed_from(&self) -> StreamState {
        self.release_to
    }

    /// 指定释放后的状态。
    pub(crate) fn release_to(&mut self, state: StreamState) {
        self.release_to = state;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.gate.store(self.release_to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_reports_busy_until_release() {
        let gate = Gate::new();
        let claim = gate.claim("first").expect("idle gate");
        let rejected = gate.claim("second").expect_err("gate is held");
        assert!(matches!(
            rejected,
            StreamError::Busy {
                operation: "second",
                state: StreamState::Busy
            }
        ));
        drop(claim);
        assert_eq!(gate.load(), StreamState::Idle);
    }

    #[test]
    fn waiting_state_is_restored_unless_overridden() {
        let gate = Gate::new();
        gate.store(StreamState::WaitingForInnerRemainder);
        drop(gate.claim("peek").expect("waiting gate is claimable"));
        assert_eq!(gate.load(), StreamState::WaitingForInnerRemainder);

        let mut claim = gate.claim("read").expect("claim");
        claim.release_to(StreamState::Idle);
        drop(claim);
        assert_eq!(gate.load(), StreamState::Idle);
    }
}
