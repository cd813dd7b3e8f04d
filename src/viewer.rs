use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::events::Signal;
use crate::lifecycle::PlaceholderId;
use crate::model::MessageId;
use crate::render::{AppendOutcome, RenderEngine, RenderOutcome, Surface};
use crate::storage::Store;

/// What the next `DataUpdated` should do to an open viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingUpdate {
    /// Background data; picked up on the next full render.
    #[default]
    Absorb,
    Append,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
    Shown(RenderOutcome),
    Hidden,
    Appended(AppendOutcome),
    Rerendered(RenderOutcome),
    Ignored,
}

/// Visibility controller around the render engine.
pub struct Viewer {
    store: Store,
    engine: RenderEngine,
    visible: bool,
    pending: PendingUpdate,
}

impl Viewer {
    pub fn new(store: Store, engine: RenderEngine) -> Self {
        Self {
            store,
            engine,
            visible: false,
            pending: PendingUpdate::Absorb,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn engine(&self) -> &RenderEngine {
        &self.engine
    }

    /// Reopens the viewer when it was visible in the previous session.
    pub fn restore(&mut self, surface: &mut dyn Surface) -> Result<Option<RenderOutcome>> {
        if self.store.viewer_visible().context("viewer: read visibility")? {
            return self.show(surface).map(Some);
        }
        Ok(None)
    }

    /// Marks how the next data update should be applied.
    pub fn expect_update(&mut self, pending: PendingUpdate) {
        self.pending = pending;
    }

    pub fn handle(&mut self, signal: Signal, surface: &mut dyn Surface) -> Result<ViewerEvent> {
        match signal {
            Signal::ToggleViewer => {
                if self.visible {
                    self.hide(surface)?;
                    Ok(ViewerEvent::Hidden)
                } else {
                    Ok(ViewerEvent::Shown(self.show(surface)?))
                }
            }
            Signal::DataUpdated => {
                let pending = std::mem::take(&mut self.pending);
                if !self.visible {
                    return Ok(ViewerEvent::Ignored);
                }
                match pending {
                    PendingUpdate::Absorb => {
                        debug!("background update absorbed");
                        Ok(ViewerEvent::Ignored)
                    }
                    PendingUpdate::Append => {
                        Ok(ViewerEvent::Appended(self.engine.append_new(surface)?))
                    }
                    PendingUpdate::Full => {
                        Ok(ViewerEvent::Rerendered(self.engine.full_render(surface)?))
                    }
                }
            }
        }
    }

    pub fn show(&mut self, surface: &mut dyn Surface) -> Result<RenderOutcome> {
        self.visible = true;
        self.store
            .set_viewer_visible(true)
            .context("viewer: persist visibility")?;
        self.engine.full_render(surface)
    }

    pub fn hide(&mut self, surface: &mut dyn Surface) -> Result<()> {
        self.visible = false;
        self.engine.release(surface);
        self.store
            .set_viewer_visible(false)
            .context("viewer: persist visibility")
    }

    pub fn select(&mut self, surface: &mut dyn Surface, id: MessageId) -> Result<Option<MessageId>> {
        if !self.visible {
            return Ok(self.store.selected_message()?);
        }
        self.engine.toggle_selection(surface, id)
    }

    pub fn activate_embed(&mut self, id: PlaceholderId) -> bool {
        self.visible && self.engine.lifecycle_mut().activate(id)
    }

    /// Drives embed loading. Returns true when the view should be redrawn.
    pub fn tick(&mut self, surface: &dyn Surface, wait: Duration) -> bool {
        self.visible && self.engine.refresh_embeds(surface, wait)
    }
}
