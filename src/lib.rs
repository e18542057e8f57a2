pub mod apk;
pub mod core;

pub use crate::core::config::{parse_config, PipelineConfig};
pub use crate::core::error::{Outcome, PipelineError, SigningError};
pub use crate::core::pipeline::{ApkReverseEngineer, AppNamePatch, Job, SigningCredentials};
