//! Asynchronous media transcoding engine.
//!
//! One [`session::TranscodeSession`] moves the selected tracks of a single
//! source into a single destination, either copying compressed samples
//! unchanged (passthrough) or decoding and re-encoding them with per-track
//! target parameters. Every track runs its own pipeline; demuxing, codecs
//! and muxing are collaborator traits so any container/codec stack can be
//! plugged in. Lifecycle outcomes arrive on an ordered event stream and a
//! one-shot completion handle; exactly one terminal notification is ever
//! delivered per session.

pub mod arbiter;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod events;
pub mod format;
pub mod frame;
pub mod pipeline;
pub mod sample;
pub mod session;
pub mod sink;
pub mod source;
pub mod testing;
pub mod track;

pub use arbiter::{PauseToken, ResourceBroker};
pub use error::{ErrorCode, Result, TranscodeError};
pub use events::{Completion, Events, Outcome, TranscodeEvent};
pub use format::{FormatValue, TrackFormat};
pub use session::{SessionConfig, SessionState, TranscodeSession};
pub use track::{TrackDescriptor, TrackInfo, TrackKind};
