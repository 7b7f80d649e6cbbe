//! 端到端场景：以内存文件系统驱动完整的调度器与栈。
//!
//! - `reads`：基本读取、缺失文件、短读、批量读取、存在性与元数据查询、读取拆分；
//! - `cache`：刷新后透明重开、LRU 淘汰；
//! - `cancellation`：执行前取消、挂起期间的控制命令、重排优先级；
//! - `threaded`：真实驱动线程与多生产者提交。

mod support;

mod cache;
mod cancellation;
mod reads;
mod threaded;
