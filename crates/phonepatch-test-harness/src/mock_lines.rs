//! Mock [`LineDriver`] recording every line write.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use phonepatch_core::error::{Error, Result};
use phonepatch_core::lines::{LineDriver, PhysicalLine};

#[derive(Debug)]
struct LinesState<L> {
    writes: Vec<(L, bool)>,
    inputs: Vec<(L, bool)>,
    closed: bool,
}

/// Scripted control lines for any [`PhysicalLine`] vocabulary.
///
/// Input lines read `false` until set with [`set_input()`](MockLines::set_input).
#[derive(Debug)]
pub struct MockLines<L> {
    state: Arc<Mutex<LinesState<L>>>,
    _line: PhantomData<L>,
}

impl<L> Clone for MockLines<L> {
    fn clone(&self) -> Self {
        MockLines {
            state: Arc::clone(&self.state),
            _line: PhantomData,
        }
    }
}

impl<L: PhysicalLine> MockLines<L> {
    pub fn new() -> Self {
        MockLines {
            state: Arc::new(Mutex::new(LinesState {
                writes: Vec::new(),
                inputs: Vec::new(),
                closed: false,
            })),
            _line: PhantomData,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinesState<L>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Electrical level the next `get_line(line)` returns.
    pub fn set_input(&self, line: L, level: bool) {
        let mut state = self.lock();
        state.inputs.retain(|(l, _)| *l != line);
        state.inputs.push((line, level));
    }

    /// Every `set_line` call so far, in order.
    pub fn writes(&self) -> Vec<(L, bool)> {
        self.lock().writes.clone()
    }

    /// Last level written to `line`.
    pub fn level(&self, line: L) -> Option<bool> {
        self.lock()
            .writes
            .iter()
            .rev()
            .find(|(l, _)| *l == line)
            .map(|(_, level)| *level)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl<L: PhysicalLine> Default for MockLines<L> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<L: PhysicalLine> LineDriver for MockLines<L> {
    type Line = L;

    async fn set_line(&mut self, line: L, level: bool) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::NotConnected);
        }
        state.writes.push((line, level));
        Ok(())
    }

    async fn get_line(&mut self, line: L) -> Result<bool> {
        let state = self.lock();
        if state.closed {
            return Err(Error::NotConnected);
        }
        Ok(state
            .inputs
            .iter()
            .find(|(l, _)| *l == line)
            .map(|(_, level)| *level)
            .unwrap_or(false))
    }

    async fn close(&mut self) -> Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}
