use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Visible,
    Hidden,
    /// Final; no later signal changes it.
    Unloaded,
}

/// Host lifecycle signals the connection manager subscribes to.
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<Visibility>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Visibility::Visible);
        Self { tx }
    }

    pub fn on_visible(&self) {
        self.set(Visibility::Visible);
    }

    pub fn on_hidden(&self) {
        self.set(Visibility::Hidden);
    }

    pub fn on_unload(&self) {
        self.set(Visibility::Unloaded);
    }

    pub fn current(&self) -> Visibility {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Visibility> {
        self.tx.subscribe()
    }

    fn set(&self, next: Visibility) {
        self.tx.send_if_modified(|current| {
            if *current == Visibility::Unloaded || *current == next {
                return false;
            }
            tracing::debug!("Lifecycle {:?} -> {:?}", current, next);
            *current = next;
            true
        });
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
