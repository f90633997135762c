#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use dynamic_principals_core as core;
pub use dynamic_principals_k8s_api as k8s;
pub use dynamic_principals_k8s_index as index;
pub use dynamic_principals_k8s_status as status;

mod admission;
mod args;
mod validation;

mod lease;
pub use self::args::Args;
