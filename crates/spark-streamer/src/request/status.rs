use std::fmt;

/// 请求生命周期状态。
///
/// # 契约说明（What）
/// - 合法路径：`Pending → Processing → {Completed | Failed | Canceled}`，允许跳过 `Processing`；
/// - 终态不可再迁移，非终态不可回退；
/// - 同一非终态重复设置视为幂等。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl RequestStatus {
    const fn rank(self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Processing => 1,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Canceled => 2,
        }
    }

    pub const fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// 状态机是否允许 `self → next`。
    pub const fn can_transition_to(self, next: RequestStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.rank() <= next.rank()
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
