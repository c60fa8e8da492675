//! Infinitely repeating minibatch cursors.
//!
//! [`InfiniteLoader`] wraps any cloneable iterator of minibatches and
//! restarts it when exhausted, so sampling never observes end-of-data.
//! [`DataCursors`] holds the two independent cursors an estimator uses: one
//! for training and one reserved for estimation work.

use tracing::debug;

use crate::error::{EstimError, Result};

/// Wraps a finite minibatch source into an endless cursor.
///
/// The pristine source is kept aside and cloned whenever the live cursor
/// runs dry, which starts a new epoch.
#[derive(Debug, Clone)]
pub struct InfiniteLoader<S> {
    source: S,
    current: S,
    epoch: usize,
    position: usize,
    served: usize,
}

impl<S: Iterator + Clone> InfiniteLoader<S> {
    /// Create a cursor positioned at the start of `source`.
    pub fn new(source: S) -> Self {
        Self {
            current: source.clone(),
            source,
            epoch: 0,
            position: 0,
            served: 0,
        }
    }

    /// Next minibatch, restarting the source on exhaustion.
    ///
    /// # Errors
    ///
    /// Returns [`EstimError::EmptyInput`] if the source yields nothing even
    /// right after a restart.
    pub fn next_batch(&mut self) -> Result<S::Item> {
        if let Some(batch) = self.current.next() {
            self.position += 1;
            self.served += 1;
            return Ok(batch);
        }

        self.current = self.source.clone();
        self.epoch += 1;
        self.position = 0;
        debug!("data cursor wrapped, starting epoch {}", self.epoch);

        match self.current.next() {
            Some(batch) => {
                self.position = 1;
                self.served += 1;
                Ok(batch)
            }
            None => Err(EstimError::empty_input("data source yields no minibatches")),
        }
    }

    /// Rewind to the first minibatch of the source.
    pub fn reset(&mut self) {
        self.current = self.source.clone();
        self.epoch = 0;
        self.position = 0;
        self.served = 0;
    }

    /// Number of completed passes over the source.
    #[must_use]
    pub const fn epoch(&self) -> usize {
        self.epoch
    }

    /// Minibatches yielded in the current epoch.
    #[must_use]
    pub const fn position_in_epoch(&self) -> usize {
        self.position
    }

    /// Minibatches yielded since creation or the last reset.
    #[must_use]
    pub const fn batches_served(&self) -> usize {
        self.served
    }
}

/// Yields `None` only when the underlying source is empty.
impl<S: Iterator + Clone> Iterator for InfiniteLoader<S> {
    type Item = S::Item;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().ok()
    }
}

/// Which cursor `grad` currently reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveCursor {
    /// The primary training cursor.
    #[default]
    Training,
    /// The cursor reserved for estimation.
    Estimation,
}

/// The training and estimation cursors plus the active-cursor flag.
#[derive(Debug, Clone)]
pub struct DataCursors<S> {
    source: S,
    data_iter: InfiniteLoader<S>,
    estim_iter: InfiniteLoader<S>,
    active: ActiveCursor,
}

impl<S: Iterator + Clone> DataCursors<S> {
    /// Build two independent cursors over the same source.
    pub fn new(source: S) -> Self {
        Self {
            data_iter: InfiniteLoader::new(source.clone()),
            estim_iter: InfiniteLoader::new(source.clone()),
            source,
            active: ActiveCursor::Training,
        }
    }

    /// Recreate both cursors from the start of the source.
    pub fn init_data_iter(&mut self) {
        self.data_iter = InfiniteLoader::new(self.source.clone());
        self.estim_iter = InfiniteLoader::new(self.source.clone());
        self.active = ActiveCursor::Training;
    }

    /// Currently active cursor kind.
    #[must_use]
    pub const fn active(&self) -> ActiveCursor {
        self.active
    }

    /// Make `cursor` active and return the previously active one.
    pub fn activate(&mut self, cursor: ActiveCursor) -> ActiveCursor {
        std::mem::replace(&mut self.active, cursor)
    }

    /// The active cursor.
    pub fn active_mut(&mut self) -> &mut InfiniteLoader<S> {
        match self.active {
            ActiveCursor::Training => &mut self.data_iter,
            ActiveCursor::Estimation => &mut self.estim_iter,
        }
    }

    /// Next minibatch from the active cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is empty.
    pub fn next_batch(&mut self) -> Result<S::Item> {
        self.active_mut().next_batch()
    }

    /// The training cursor, regardless of which one is active.
    #[must_use]
    pub const fn data_iter(&self) -> &InfiniteLoader<S> {
        &self.data_iter
    }

    /// The estimation cursor, regardless of which one is active.
    #[must_use]
    pub const fn estim_iter(&self) -> &InfiniteLoader<S> {
        &self.estim_iter
    }
}
