//! IRQ dispatch: a table of top-half handlers keyed by vector.
//!
//! Handlers run in IRQ context; they may take spinlocks but never a
//! sleeping primitive. At most one handler per vector.

use alloc::sync::Arc;
use hashbrown::HashMap;

use crate::errno::{ErrorCode, Result};
use crate::sync::Spinlock;

/// Highest vector number the platform can deliver.
pub const MAX_IRQS: u32 = 256;

pub trait IrqHandler: Send + Sync {
    fn on_irq(&self);
}

pub struct IrqTable {
    handlers: Spinlock<HashMap<u32, Arc<dyn IrqHandler>>>,
}

impl IrqTable {
    pub fn new() -> Self {
        IrqTable {
            handlers: Spinlock::new(HashMap::new()),
        }
    }

    /// Claim `vector`. Fails with `Busy` if another handler owns it.
    pub fn register(&self, vector: u32, handler: Arc<dyn IrqHandler>) -> Result<()> {
        assert!(vector < MAX_IRQS, "irq vector {} out of range", vector);
        let mut h = self.handlers.lock();
        if h.contains_key(&vector) {
            return Err(ErrorCode::Busy);
        }
        h.insert(vector, handler);
        Ok(())
    }

    pub fn unregister(&self, vector: u32) {
        self.handlers.lock().remove(&vector);
    }

    /// Entry point from the MD trap path.
    pub fn dispatch(&self, vector: u32) {
        if vector >= MAX_IRQS {
            panic!("impossible irq {} fired", vector);
        }
        let handler = self.handlers.lock().get(&vector).cloned();
        match handler {
            Some(h) => h.on_irq(),
            None => log::warn!("unhandled irq {}, ignored", vector),
        }
    }
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}

static IRQ_TABLE: spin::Once<IrqTable> = spin::Once::new();

/// The system IRQ table.
pub fn table() -> &'static IrqTable {
    IRQ_TABLE.call_once(IrqTable::new)
}
