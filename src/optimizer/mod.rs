pub mod adam;

pub use adam::{AdamConfig, CpuAdam, ParamGroup, ParamState};
