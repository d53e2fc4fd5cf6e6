//! asciinema-v2-compatible cast recording: event types, the append-only
//! writer, and the incremental tailer.

pub mod event;
pub mod tailer;
pub mod writer;

pub use event::{exit_record, parse_exit_record, Event, EventType, Header};
pub use tailer::Tailer;
pub use writer::CastWriter;
