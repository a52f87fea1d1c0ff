pub mod device;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod metrics;
pub mod ndrange;
pub mod ops;
pub mod plugin;
pub mod program;
pub mod samples;
pub mod scheduler;
pub mod value;
pub mod workgroup;
pub mod workitem;
