pub mod chromium;
pub mod error;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use crate::job::CapturedUrl;

pub use chromium::ChromiumSession;
pub use error::{SessionError, SessionResult};

/// How the selector tries to activate a source button on the player page.
/// Strategies are tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Click the source element and wait for the player to react.
    DirectControl,
    /// Click, then hold on for slow player initialization.
    ExtendedWait,
    /// Navigate to the source link target instead of clicking in place.
    AlternateRoute,
}

impl SelectionStrategy {
    pub const ORDER: [SelectionStrategy; 3] = [
        SelectionStrategy::DirectControl,
        SelectionStrategy::ExtendedWait,
        SelectionStrategy::AlternateRoute,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            SelectionStrategy::DirectControl => "direct_control",
            SelectionStrategy::ExtendedWait => "extended_wait",
            SelectionStrategy::AlternateRoute => "alternate_route",
        }
    }
}

/// A source button discovered in the player menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSource {
    pub label: String,
    pub href: Option<String>,
}

/// Opens player pages. One implementation drives a real browser; tests
/// substitute scripted fakes.
#[async_trait]
pub trait PageSession: Send + Sync {
    async fn open(&self, url: &Url) -> SessionResult<Box<dyn PageHandle>>;
}

/// A live player page. All waits inside these calls are bounded by the
/// timeouts the caller passes in.
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Source buttons currently present in the player menu, in page order.
    async fn available_sources(&self) -> SessionResult<Vec<VideoSource>>;

    /// Attempts to activate `source`. Returns `true` when the player
    /// visibly switched within `timeout`, `false` when nothing happened.
    async fn select_source(
        &self,
        source: &VideoSource,
        strategy: SelectionStrategy,
        timeout: Duration,
    ) -> SessionResult<bool>;

    /// Playlist URLs observed on the page since it was opened.
    async fn captured_urls(&self) -> SessionResult<Vec<CapturedUrl>>;

    async fn close(self: Box<Self>) -> SessionResult<()>;
}
