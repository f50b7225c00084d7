//! Script conversion seam for simplified → traditional Chinese output

use std::sync::Arc;

/// Converts page text between Chinese scripts.
///
/// Implementations must be cheap to share across worker threads; the
/// pipeline holds one behind an `Arc` and calls it from blocking tasks.
pub trait ScriptConverter: Send + Sync {
    fn convert(&self, text: &str) -> String;
}

/// Converter that returns its input unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughConverter;

impl ScriptConverter for PassthroughConverter {
    fn convert(&self, text: &str) -> String {
        text.to_string()
    }
}

impl<F> ScriptConverter for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn convert(&self, text: &str) -> String {
        self(text)
    }
}

pub fn passthrough() -> Arc<dyn ScriptConverter> {
    Arc::new(PassthroughConverter)
}
