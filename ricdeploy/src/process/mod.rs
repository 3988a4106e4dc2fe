//! Host process management: reclaiming ports and scoping helper processes.

pub mod background;
pub mod ports;

pub use background::{run_scoped, run_scoped_until, BackgroundHandle, BackgroundSession, ScopeEnd};
pub use ports::{
    AbortReason, PortReclaimer, PortReservation, ProcessTable, ProcfsProcessTable, ReclaimOutcome,
    ReservationState, TermSignal,
};
