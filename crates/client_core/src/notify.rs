use crate::cache::CachedMessage;

/// Whether the client surface is currently in front of the user. Drives the
/// delivery side effect for live messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Foreground,
    Background,
}

/// Delivery side-effect seam. `Background` means an OS-level notification
/// must be requested; `Foreground` delivery is silent (the message auto-reads
/// shortly after instead). Rendering is out of scope here.
pub trait Notifier: Send + Sync {
    fn message_received(&self, message: &CachedMessage, surface: Surface);
}

pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn message_received(&self, _message: &CachedMessage, _surface: Surface) {}
}
