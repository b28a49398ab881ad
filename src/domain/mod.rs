//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! transport implementations, protocols, or infrastructure concerns.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod envelope;
mod identity;
mod status;
mod transport;

// --- Envelope domain re-exports ---

pub use envelope::{
    //
    now_timestamp,
    EnvelopeKind,
    NotificationEnvelope,
    NotificationEvent,
    NotificationPayload,
};

pub use identity::{UserIdentity, BROADCAST_TOPIC};

pub use status::{ConnectionStatus, StatusListener, StatusSubscription};

pub(crate) use status::{lock_ignore_poison, StatusCell, StatusNotice};

// --- Transport domain re-exports ---

pub use transport::{
    //
    Connector,
    Inbound,
    Link,
    Listener,
    Routing,
    Topic,
};

pub(crate) use transport::deliver;
