//! Change-feed consumer.
//!
//! Turns the raw bytes of a continuous change feed into ordered events:
//! - [`LineFramer`] reassembles lines split across transport reads
//! - [`decode_line`] classifies each line (event, terminal, heartbeat, malformed)
//! - [`ChangeReceiver`] dispatches events to subscribers one line at a time
//!
//! # Example
//!
//! ```ignore
//! let mut framer = LineFramer::new();
//! let mut receiver = ChangeReceiver::new();
//! receiver.subscribe(listener);
//!
//! for line in framer.push(chunk) {
//!     match receiver.line_received(&line)? {
//!         LineOutcome::Terminal { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

mod decoder;
mod framer;
mod receiver;

pub use decoder::{decode_line, DecodedLine};
pub use framer::LineFramer;
pub use receiver::{ChangeReceiver, LineOutcome, TerminalPolicy};
