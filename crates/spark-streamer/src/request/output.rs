use std::{any::Any, fmt};

use bytes::Bytes;

use crate::{error::RequestFailure, statistics::Statistic};

use super::{RequestId, RequestStatus};

/// 请求完成后交给回调的数据。失败或取消的请求输出为 [`RequestOutput::None`]。
#[derive(Default)]
pub enum RequestOutput {
    #[default]
    None,
    Read(Bytes),
    ReadBatch(Vec<Bytes>),
    Exists(bool),
    FileSize(u64),
    Statistics(Vec<Statistic>),
    Custom(Box<dyn Any + Send>),
}

impl RequestOutput {
    pub fn bytes_transferred(&self) -> u64 {
        match self {
            RequestOutput::Read(data) => data.len() as u64,
            RequestOutput::ReadBatch(parts) => parts.iter().map(|part| part.len() as u64).sum(),
            _ => 0,
        }
    }
}

impl fmt::Debug for RequestOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutput::None => f.write_str("None"),
            RequestOutput::Read(data) => f.debug_tuple("Read").field(&data.len()).finish(),
            RequestOutput::ReadBatch(parts) => f.debug_tuple("ReadBatch").field(&parts.len()).finish(),
            RequestOutput::Exists(found) => f.debug_tuple("Exists").field(found).finish(),
            RequestOutput::FileSize(size) => f.debug_tuple("FileSize").field(size).finish(),
            RequestOutput::Statistics(stats) => {
                f.debug_tuple("Statistics").field(&stats.len()).finish()
            }
            RequestOutput::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// 完成回调的入参：请求标识、终态、输出与失败详情。
#[derive(Debug)]
pub struct CompletedRequest {
    pub id: RequestId,
    pub status: RequestStatus,
    pub output: RequestOutput,
    pub failure: Option<RequestFailure>,
}

impl CompletedRequest {
    pub fn is_success(&self) -> bool {
        self.status == RequestStatus::Completed
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.output.bytes_transferred()
    }

    /// 单次读取的数据；其他输出返回 `None`。
    pub fn data(&self) -> Option<&Bytes> {
        match &self.output {
            RequestOutput::Read(data) => Some(data),
            _ => None,
        }
    }
}
