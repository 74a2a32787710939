//! Metrics and log events emitted by the limiter.

mod bbr;

pub use self::bbr::*;

/// An observable occurrence inside the limiter.
///
/// Emitting records the event's metrics through the `metrics` facade and logs it through
/// `tracing`; both are no-ops until the application installs a recorder or subscriber.
pub trait InternalEvent: Sized {
    fn emit(self);
}
