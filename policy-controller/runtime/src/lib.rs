#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use netpol_controller_core as core;
pub use netpol_controller_k8s_api as k8s;
pub use netpol_controller_k8s_index as index;
pub use netpol_controller_ovn as ovn;
pub use netpol_controller_queue as queue;

mod args;
mod events;
mod lease;
mod leadership;

pub use self::args::Args;
