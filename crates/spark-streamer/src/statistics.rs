//! 统计样本与滚动平均窗口。
//!
//! 每个栈层与调度器通过 `collect_statistics(&mut Vec<Statistic>)` 输出“名称 + 数值”记录，
//! 外部遥测或 UI 可直接消费；[`to_json`] 提供无二进制协议的导出格式。

use std::borrow::Cow;

use serde::Serialize;

/// 单条统计样本。
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Statistic {
    owner: Cow<'static, str>,
    name: Cow<'static, str>,
    value: StatisticValue,
}

/// 统计数值。整数用于计数，浮点用于平均值与比率。
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatisticValue {
    Integer(i64),
    Float(f64),
}

impl Statistic {
    pub fn integer(
        owner: impl Into<Cow<'static, str>>,
        name: impl Into<Cow<'static, str>>,
        value: i64,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            value: StatisticValue::Integer(value),
        }
    }

    /// 计数类样本的便捷构造，超出 `i64` 的值饱和到上限。
    pub fn count(
        owner: impl Into<Cow<'static, str>>,
        name: impl Into<Cow<'static, str>>,
        value: u64,
    ) -> Self {
        Self::integer(owner, name, i64::try_from(value).unwrap_or(i64::MAX))
    }

    pub fn float(
        owner: impl Into<Cow<'static, str>>,
        name: impl Into<Cow<'static, str>>,
        value: f64,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            value: StatisticValue::Float(value),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn value(&self) -> StatisticValue {
        self.value
    }
}

impl StatisticValue {
    pub fn as_f64(self) -> f64 {
        match self {
            StatisticValue::Integer(value) => value as f64,
            StatisticValue::Float(value) => value,
        }
    }

    pub const fn as_i64(self) -> Option<i64> {
        match self {
            StatisticValue::Integer(value) => Some(value),
            StatisticValue::Float(_) => None,
        }
    }
}

/// 按所属者与名称查找样本。
pub fn find<'a>(statistics: &'a [Statistic], owner: &str, name: &str) -> Option<&'a Statistic> {
    statistics
        .iter()
        .find(|statistic| statistic.owner() == owner && statistic.name() == name)
}

/// 将样本序列化为 JSON 数组。
pub fn to_json(statistics: &[Statistic]) -> serde_json::Result<String> {
    serde_json::to_string(statistics)
}

/// 固定窗口的滚动平均。
///
/// # 契约说明（What）
/// - 最多保留最近 `N` 个样本，新样本覆盖最旧样本；
/// - 空窗口的平均值为 `0.0`，调用方可先用 [`AverageWindow::is_empty`] 区分“无样本”。
#[derive(Clone, Debug)]
pub struct AverageWindow<const N: usize> {
    samples: [u64; N],
    next: usize,
    len: usize,
    total: u128,
}

impl<const N: usize> Default for AverageWindow<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> AverageWindow<N> {
    pub const fn new() -> Self {
        Self {
            samples: [0; N],
            next: 0,
            len: 0,
            total: 0,
        }
    }

    pub fn push(&mut self, sample: u64) {
        if N == 0 {
            return;
        }
        if self.len == N {
            self.total -= u128::from(self.samples[self.next]);
        } else {
            self.len += 1;
        }
        self.samples[self.next] = sample;
        self.total += u128::from(sample);
        self.next = (self.next + 1) % N;
    }

    pub fn average(&self) -> f64 {
        if self.len == 0 {
            0.0
        } else {
            self.total as f64 / self.len as f64
        }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}
