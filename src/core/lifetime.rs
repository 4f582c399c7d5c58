//! 生命周期令牌
//!
//! 任意对象都可以持有一个 [`Lifetime`]，外部持有者通过轻量的
//! [`LifetimeFlag`] 查询"主体是否仍处于某个状态"，而不会延长主体的生命周期。
//! 状态只能单调前进：`Creating -> Alive -> Destroying -> Destroyed`，
//! 其中 `Alive` 只能从 `Creating` 到达，`Destroyed` 之后不再允许任何变化。

use crate::{FoundryError, Result};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifetimeState {
    /// 创建中
    Creating = 0,
    /// 存活
    Alive = 1,
    /// 销毁中
    Destroying = 2,
    /// 已销毁
    Destroyed = 3,
}

impl LifetimeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Creating,
            1 => Self::Alive,
            2 => Self::Destroying,
            _ => Self::Destroyed,
        }
    }
}

/// 生命周期令牌，由主体对象独占持有
///
/// 令牌被丢弃时强制进入 `Destroyed`，因此所有未完成的标志都能观察到主体的消亡。
pub struct Lifetime {
    state: Arc<AtomicU8>,
}

impl Lifetime {
    /// 创建处于 `Creating` 状态的令牌
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(LifetimeState::Creating as u8)),
        }
    }

    /// 创建直接处于 `Alive` 状态的令牌
    pub fn new_alive() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(LifetimeState::Alive as u8)),
        }
    }

    /// 当前状态
    pub fn state(&self) -> LifetimeState {
        LifetimeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_creating(&self) -> bool {
        self.state() == LifetimeState::Creating
    }

    pub fn is_alive(&self) -> bool {
        self.state() == LifetimeState::Alive
    }

    pub fn is_destroying(&self) -> bool {
        self.state() == LifetimeState::Destroying
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == LifetimeState::Destroyed
    }

    /// `Creating -> Alive`
    pub fn set_alive(&self) -> Result<()> {
        self.state
            .compare_exchange(
                LifetimeState::Creating as u8,
                LifetimeState::Alive as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|current| FoundryError::InvalidLifetimeTransition {
                from: LifetimeState::from_u8(current),
                to: LifetimeState::Alive,
            })
    }

    /// 进入 `Destroying`；已处于 `Destroying` 时为空操作
    pub fn set_destroying(&self) -> Result<()> {
        self.advance_to(LifetimeState::Destroying)
    }

    /// 进入 `Destroyed`；已处于 `Destroyed` 时为空操作
    pub fn set_destroyed(&self) -> Result<()> {
        self.advance_to(LifetimeState::Destroyed)
    }

    fn advance_to(&self, target: LifetimeState) -> Result<()> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = LifetimeState::from_u8(current);
            if from == target {
                return Ok(());
            }
            if from > target {
                return Err(FoundryError::InvalidLifetimeTransition { from, to: target });
            }
            match self.state.compare_exchange_weak(
                current,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// 获取一个观察本令牌的标志
    pub fn flag(&self) -> LifetimeFlag {
        LifetimeFlag {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Lifetime {
    fn drop(&mut self) {
        self.state
            .store(LifetimeState::Destroyed as u8, Ordering::Release);
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifetime").field("state", &self.state()).finish()
    }
}

/// 生命周期标志：只读观察者，不持有主体
#[derive(Clone)]
pub struct LifetimeFlag {
    state: Arc<AtomicU8>,
}

impl LifetimeFlag {
    /// 当前观察到的状态
    pub fn state(&self) -> LifetimeState {
        LifetimeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_creating(&self) -> bool {
        self.state() == LifetimeState::Creating
    }

    pub fn is_alive(&self) -> bool {
        self.state() == LifetimeState::Alive
    }

    pub fn is_destroying(&self) -> bool {
        self.state() == LifetimeState::Destroying
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == LifetimeState::Destroyed
    }

    /// 主体已进入销毁流程（`Destroying` 或 `Destroyed`）
    pub fn is_going(&self) -> bool {
        self.state() >= LifetimeState::Destroying
    }
}

impl fmt::Debug for LifetimeFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifetimeFlag").field("state", &self.state()).finish()
    }
}
