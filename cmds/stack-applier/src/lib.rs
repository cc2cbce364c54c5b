pub mod config;
pub mod debounce;
pub mod k8s;
pub mod labels;
pub mod latest;
pub mod leaderelection;
pub mod manager;
pub mod manifest;
pub mod merge_patch;
pub mod stack;
pub mod stack_applier;
pub mod telemetry;
