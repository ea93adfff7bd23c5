//! reprise data models.
//!
//! Typed where the engine needs to reason about values (clip windows, loop
//! counting, download states); everything crossing the method or event
//! channel stays plain JSON.

pub mod args;
pub mod clip;
pub mod download;
pub mod event;
pub mod looping;

pub use args::{ArgsExt, MethodCall};
pub use clip::ClipRange;
pub use download::{ClientDownloadState, Download, DownloadRequest, DownloadState};
pub use event::{PlayerEvent, SinkMessage};
pub use looping::{LoopAction, LoopCounter, Looping};
