//! # Coders
//!
//! Byte-level handling of the portable encodings the engine has to see
//! through: windowed-value headers, windows, pane info and enough of the
//! element coders to find element boundaries and extract keys.
//!
//! Element values are never materialised; an [`ElementDecoder`] only measures
//! how many bytes one element occupies.

use std::collections::HashMap;

use crate::error::EngineError;
use crate::pipeline::{self, urns};
use crate::types::{Element, EventTime};
use crate::window::{PaneInfo, PaneTiming, Window};

mod codec;
mod decoder;
mod registry;

pub use codec::*;
pub use decoder::*;
pub use registry::*;

#[cfg(test)]
#[path = "tests/coder_tests.rs"]
mod tests;

type CodecResult<T> = std::result::Result<T, EngineError>;
