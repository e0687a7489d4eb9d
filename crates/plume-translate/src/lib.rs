//! Consumer-side translation of the plume command stream, plus the
//! producer-facing recorder.
//!
//! The [`Translator`] drains a [`plume_stream::StreamReader`], dispatches
//! records to a [`CommandExecutor`], and keeps the [`ResourceTable`]
//! consistent, including best-effort rehoming after device loss. The
//! [`TranslatorWorker`] wraps it in the typed task queue the embedder's
//! event loop drives. On the producer side, [`Recorder`] is the whole API
//! surface the enclosing application sees.

mod executor;
mod recorder;
mod recovery;
mod resources;
mod translator;

pub use executor::{CommandExecutor, ExecutorError, NullExecutor, SoftwareExecutor};
pub use recorder::{Recorder, ResumeHook};
pub use recovery::{ContextRegistry, SharedContext};
pub use resources::{ResourceEntry, ResourceError, ResourceTable, TableOp};
pub use translator::{TranslateError, TranslateTask, Translator, TranslatorWorker};
