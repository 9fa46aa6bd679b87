//! # context 模块说明
//!
//! ## 设计动机（Why）
//! - 每条物理连接、每个客户端会话都恰好由一个取消上下文管理生命周期；
//!   任何跨任务交接都表达为“数据操作”与“取消信号”之间的竞争，而非无条件阻塞。
//! - 会话时长是硬截止：从接受/打开时刻起计时，流量不会续期。
//!
//! ## 核心契约（What）
//! - [`SessionContext`] = 取消令牌 + 可选截止时间；令牌被取消或截止时间到达即视为“已结束”；
//! - [`SessionContext::run`] 是可取消 Future 的统一入口：先结束者胜出，
//!   上下文胜出时返回 [`BindError::Closed`]；
//! - 子上下文继承父级取消，并取父子截止时间中较早者。
//!
//! ## 实现策略（How）
//! - 取消令牌采用 `tokio_util::sync::CancellationToken`，截止时间使用 Tokio 单调时钟，
//!   以便测试中通过 `tokio::time::pause` 精确推进。

use std::{future::Future, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::BindError;

/// 连接/会话级取消上下文。
#[derive(Clone, Debug, Default)]
pub struct SessionContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl SessionContext {
    /// 创建没有截止时间的根上下文。
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建从当前时刻起 `timeout` 后自动结束的根上下文。
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// 派生子上下文：父级取消会传播到子级，反之不会。
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// 派生带独立超时的子上下文，截止时间取父子中较早者。
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(own, |parent| parent.min(own))),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 取消上下文；重复调用无副作用。
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 令牌已取消或截止时间已过。
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| d <= Instant::now())
    }

    /// 等待上下文结束。
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// 让 `future` 与上下文结束竞争。
    ///
    /// # 教案式注释
    ///
    /// ## 逻辑 (How)
    /// - 已结束的上下文直接返回 [`BindError::Closed`]，不轮询 `future`；
    /// - 否则以 `biased` 方式优先检查上下文，保证结束后不会再有操作“抢先成功”。
    ///
    /// ## 契约 (What)
    /// - 返回时 `future` 要么已完成，要么已被丢弃，调用方不会越过上下文生命周期阻塞。
    pub async fn run<F, T>(&self, future: F) -> Result<T, BindError>
    where
        F: Future<Output = Result<T, BindError>>,
    {
        if self.is_done() {
            return Err(BindError::Closed);
        }
        tokio::pin!(future);
        tokio::select! {
            biased;
            _ = self.done() => Err(BindError::Closed),
            result = &mut future => result,
        }
    }
}
