/// Within this many pixels of the bottom the view counts as pinned.
pub const AT_BOTTOM_THRESHOLD: f64 = 100.0;

/// Scroll geometry of the message list as the UI reports it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollState {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ScrollState {
    pub fn distance_from_bottom(&self) -> f64 {
        self.scroll_height - self.scroll_top - self.client_height
    }

    pub fn is_at_bottom(&self) -> bool {
        self.distance_from_bottom() < AT_BOTTOM_THRESHOLD
    }

    /// Captures what must survive a re-render.
    pub fn anchor(&self) -> ScrollAnchor {
        if self.is_at_bottom() {
            ScrollAnchor::PinnedToBottom
        } else {
            ScrollAnchor::Offset {
                scroll_top: self.scroll_top,
                scroll_height: self.scroll_height,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScrollAnchor {
    PinnedToBottom,
    /// Reader was looking at older messages.
    Offset { scroll_top: f64, scroll_height: f64 },
}

impl ScrollAnchor {
    /// New `scroll_top` once the list has been re-rendered at
    /// `new_scroll_height`.
    pub fn restore(&self, new_scroll_height: f64, client_height: f64) -> f64 {
        match *self {
            ScrollAnchor::PinnedToBottom => (new_scroll_height - client_height).max(0.0),
            ScrollAnchor::Offset {
                scroll_top,
                scroll_height,
            } => (scroll_top + (new_scroll_height - scroll_height)).max(0.0),
        }
    }
}
