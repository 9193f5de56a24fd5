//! 工作流模块
//!
//! 在会话核心之上封装完整的设备操作：读取/写入配置、读取日志、LED 测试。

pub mod device;

pub use device::{DeviceWorkflow, LogCallback, WorkflowCallback, WorkflowOptions};
