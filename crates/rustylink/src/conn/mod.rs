//! Connection management
//!
//! This module tracks every link to a remote device, runs the connection
//! state machine and moves data between the upper layers and the
//! controller under its credit-based flow control.

pub mod flow;
pub mod frag;
pub mod manager;
pub mod observer;
pub mod sniff;
pub mod table;
pub mod tx;
pub mod types;
pub mod upper;


pub use flow::{CreditPool, FlowController};
pub use frag::{Fragmenter, Reassembler, RxOutcome};
pub use manager::ConnManager;
pub use observer::{ConnectionObserver, ObserverRegistry};
pub use table::{ConnRef, ConnTable, SlotFamily};
pub use tx::{TxCallback, TxPool};
pub use types::*;
pub use upper::{IsoHandler, KeyStore, LtkInfo, UpperLayer};
