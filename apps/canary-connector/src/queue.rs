pub mod checkpoint;
pub mod cursor;
pub mod reader;
pub mod store;

pub use checkpoint::CheckpointStore;
pub use cursor::Cursor;
pub use reader::QueueReader;
pub use store::QueueStore;

use crate::config::GeneralConfig;
use crate::error::SourceReadError;
use crate::telemetry::{PollWindow, TagSample};
use serde::Serialize;

/// Optional, separately priced read features of the device queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCapabilities {
    pub string_history: bool,
    pub utf8_tag_names: bool,
}

impl QueueCapabilities {
    pub fn from_config(general: &GeneralConfig) -> Self {
        Self {
            string_history: general.queue_enable_string_history,
            utf8_tag_names: general.utf8_string_support,
        }
    }
}

/// Window-bounded read access to the device's historical queue.
pub trait QueueSource: Send + Sync {
    /// Samples with `window.start <= ts < window.end`, in timestamp order.
    fn read_window(
        &self,
        window: &PollWindow,
        capabilities: QueueCapabilities,
    ) -> Result<Vec<TagSample>, SourceReadError>;
}
