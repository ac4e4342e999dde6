//! Window assembly
//!
//! Pure logic turning an ordered, source-filtered slice of the interaction
//! log into the input windows of an extractor invocation. Never mutates
//! state; the caller is responsible for scoping (per user, or per agent
//! version for feedback) and for skipping deleted interactions.

use crate::models::{Interaction, Request};
use serde::{Deserialize, Serialize};

/// How the window was requested, which decides the status of its outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// Triggered by new interaction writes; outputs are `current`
    Incremental,
    /// Batch regeneration over all history; outputs are `pending`
    Rerun,
    /// Single-window regeneration on demand; outputs are `current`
    Manual,
}

/// One interaction plus its parent request metadata
#[derive(Debug, Clone)]
pub struct WindowItem {
    pub interaction: Interaction,
    pub request: Request,
}

/// An assembled extractor input
#[derive(Debug, Clone)]
pub struct Window {
    pub mode: WindowMode,
    /// Ordered by `interaction_id` ascending
    pub items: Vec<WindowItem>,
}

impl Window {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The newest request covered by this window
    pub fn latest_request(&self) -> Option<&Request> {
        self.items.last().map(|item| &item.request)
    }
}

/// Assemble the incremental window, if one is due
///
/// `items` is the scope's full filtered history, ascending. With `n` live
/// interactions a window fires when `n >= window_size` and
/// `(n - window_size) % stride == 0`; the window is the newest
/// `window_size` items. Because triggers fire on every write, consecutive
/// windows overlap by `window_size - stride` without any stored cursor.
pub fn incremental_window(items: &[WindowItem], window_size: usize, stride: usize) -> Option<Window> {
    if window_size == 0 || stride == 0 {
        return None;
    }
    let n = items.len();
    if n < window_size || (n - window_size) % stride != 0 {
        return None;
    }
    Some(Window {
        mode: WindowMode::Incremental,
        items: items[n - window_size..].to_vec(),
    })
}

/// Chunk the full matching history for a rerun
///
/// Stride is ignored: every interaction appears in exactly one chunk,
/// ascending, each at most `window_size` long.
pub fn rerun_chunks(items: &[WindowItem], window_size: usize) -> Vec<Window> {
    if window_size == 0 {
        return Vec::new();
    }
    items
        .chunks(window_size)
        .map(|chunk| Window {
            mode: WindowMode::Rerun,
            items: chunk.to_vec(),
        })
        .collect()
}

/// Assemble a manual window: the newest `window_size` interactions, short
/// windows allowed
pub fn manual_window(items: &[WindowItem], window_size: usize) -> Option<Window> {
    if items.is_empty() || window_size == 0 {
        return None;
    }
    let start = items.len().saturating_sub(window_size);
    Some(Window {
        mode: WindowMode::Manual,
        items: items[start..].to_vec(),
    })
}
