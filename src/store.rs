use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::action::Action;
use crate::error::{AppError, ErrorKind};
use crate::model::AppState;
use crate::reducer;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Validation(String),

    /// Not a failure: the action was postponed until local work settles.
    #[error("deferred: {0}")]
    Deferred(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::Validation(msg) => AppError::new(ErrorKind::Validation, msg.clone()),
            StoreError::Deferred(msg) => AppError::new(ErrorKind::Conflict, msg.clone())
                .with_internal(err.to_string()),
        }
    }
}

/// Owner of the single [`AppState`]. Dispatches are serialized by the watch
/// channel's lock and subscribers are only woken when the state changed.
#[derive(Clone)]
pub struct Store {
    tx: Arc<watch::Sender<Arc<AppState>>>,
}

impl Store {
    #[must_use]
    pub fn new(initial: AppState) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    /// Applies the action. Returns whether the state changed.
    pub fn dispatch(&self, action: Action) -> bool {
        self.tx.send_if_modified(|current| {
            let next = reducer::reduce(Arc::clone(current), action);
            if Arc::ptr_eq(&next, current) {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    /// Applies the action and reports a rejection or deferral to the caller.
    pub fn try_dispatch(&self, action: Action) -> Result<bool, StoreError> {
        let mut outcome = Ok(false);
        self.tx.send_if_modified(|current| match reducer::transition(current, action) {
            Ok(next) if Arc::ptr_eq(&next, current) => false,
            Ok(next) => {
                *current = next;
                outcome = Ok(true);
                true
            }
            Err(err) => {
                outcome = Err(err);
                false
            }
        });
        outcome
    }

    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.tx.borrow())
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<AppState>> {
        self.tx.subscribe()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(AppState::default())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("version", &self.tx.borrow().version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dimensions, Image, ImageId};

    fn image(id: &str) -> Image {
        Image::placeholder(ImageId::new(id), id, Dimensions::new(1, 1), None, None)
    }

    #[tokio::test]
    async fn subscribers_wake_only_on_change() {
        let store = Store::default();
        let mut rx = store.subscribe();
        rx.borrow_and_update();

        assert!(store.dispatch(Action::AddImages(vec![image("a")])));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        assert!(!store.dispatch(Action::AddImages(vec![image("a")])));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(store.state().version.get(), 1);
    }

    #[test]
    fn try_dispatch_surfaces_rejection() {
        let store = Store::default();
        let err = store
            .try_dispatch(Action::RemoveImage(ImageId::new("ghost")))
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(store.state().version.get(), 0);
    }
}
