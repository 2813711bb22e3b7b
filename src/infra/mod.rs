//! Storage backends.

pub mod ledger;

pub use ledger::memory::InMemoryLedger;
pub use ledger::sqlite::SqliteLedger;
pub use ledger::{EntryUpdate, EtlStep, FlowEntry, FlowStatus, LedgerStore, LostEntries, PeriodRange};
