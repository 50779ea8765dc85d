use opal_cmd::ShaderType;
use thiserror::Error;

use crate::resource::BindFlags;

/// Errors surfaced synchronously by the binding API. Every failure leaves
/// device state completely unchanged and emits no command.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("binding index {index} out of range (limit {limit})")]
    InvalidIndex { index: u32, limit: u32 },
    #[error("resource is missing required bind flags {required:?} (has {actual:?})")]
    InvalidBindFlags {
        required: BindFlags,
        actual: BindFlags,
    },
    #[error("shader was created for stage {actual:?}, not {expected:?}")]
    ShaderStageMismatch {
        expected: ShaderType,
        actual: ShaderType,
    },
    #[error("invalid stream frequency {0:#x}")]
    InvalidStreamFrequency(u32),
    #[error("invalid light parameters: {0}")]
    InvalidLightParams(&'static str),
    #[error("transform state addresses a nonexistent matrix slot")]
    InvalidTransform,
    #[error("{count} viewports requested but the device supports at most {limit}")]
    TooManyViewports { count: usize, limit: usize },
    #[error("{count} scissor rects requested but the device supports at most {limit}")]
    TooManyScissorRects { count: usize, limit: usize },
    #[error("operation requires feature level {required:?}")]
    FeatureLevelTooLow {
        required: crate::device::FeatureLevel,
    },
    #[error("view format {0:?} is not valid for this binding")]
    InvalidViewFormat(crate::format::Format),
    #[error("backend initialization failed: {0}")]
    Backend(String),
}
