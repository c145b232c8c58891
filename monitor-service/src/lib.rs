pub mod monitor;
pub mod service;


pub use monitor::{
    LoopSettings, MonitorDeps, MonitorLoop, MonitorReport, MonitorState, MonitorStats, StopReason,
};
pub use service::MonitorService;
