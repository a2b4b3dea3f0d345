//! Provider sessions
//!
//! This module handles:
//! - The uniform [`ProviderSession`] contract and its outbound event queue
//! - The single-slot input mailbox and pending-approval tables
//! - Per-turn tool activity counters
//! - The two session variants: JSON-RPC app-server and SDK delegate

mod approvals;
mod delegate_session;
mod images;
mod mailbox;
mod permission;
mod provider;
mod rpc_session;
mod usage;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use approvals::{ApprovalDecision, PendingEntry, PendingPermission, PendingTable};
pub use delegate_session::{DelegateSession, DelegateSessionConfig};
pub use images::materialize_images;
pub use mailbox::{Delivery, InputMailbox};
pub use permission::{GateCheck, PermissionMode, check_tool, is_forwarded_tool};
pub use provider::{
    EventEmitter, EventReceiver, EventSender, ProviderSession, TurnInput, event_channel,
};
pub use rpc_session::{RpcSession, RpcSessionConfig};
pub use usage::{TurnActivity, TurnCounters};

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
