//! # Kronos
//!
//! Lobby and session orchestration over heterogeneous platform session
//! backends.
//!
//! ## Features
//!
//! - **Backend Adapters**: one [`SessionBackend`] per platform, all calls non-blocking
//! - **Session Registry**: process-wide view of the sessions the local player is in
//! - **Membership Reconciliation**: sequence-ordered folding of backend events
//! - **Lifecycle**: `Idle → Creating → Advertised → Filling → Locked → InProgress → TearingDown → Closed`
//! - **Host Migration**: deterministic promotion when the host departs
//! - **Matchmaking**: search, join or host in one cancellable request, plus reconnect
//! - **Events**: per-session or global listeners for lifecycle, membership and attribute changes
//!
//! ## Example
//!
//! ```rust,ignore
//! use kronos::{Identity, LobbyBuilder, LoopbackPlatform, SessionParams};
//!
//! let platform = LoopbackPlatform::new();
//! let lobby = LobbyBuilder::new()
//!     .operation_timeout_ms(5_000)
//!     .build(platform.backend(Identity::new("alice")))?;
//!
//! let id = lobby.request_create(SessionParams::new(4).attribute("map", "Dune")).await?;
//! lobby.request_lock(&id).await?;
//! lobby.request_start(&id).await?;
//! ```

// Tracing macros - no-op when feature disabled
#[cfg(feature = "tracing")]
macro_rules! trace_debug { ($($arg:tt)*) => { tracing::debug!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_debug { ($($arg:tt)*) => { trace_fields!($($arg)*) } }

#[cfg(feature = "tracing")]
macro_rules! trace_info { ($($arg:tt)*) => { tracing::info!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_info { ($($arg:tt)*) => { trace_fields!($($arg)*) } }

#[cfg(feature = "tracing")]
macro_rules! trace_warn { ($($arg:tt)*) => { tracing::warn!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_warn { ($($arg:tt)*) => { trace_fields!($($arg)*) } }

// Borrow every field value of a disabled log point and discard it.
#[cfg(not(feature = "tracing"))]
macro_rules! trace_fields {
    () => {{}};
    ($msg:literal $(, $arg:expr)* $(,)?) => {{ $( let _ = &$arg; )* }};
    ($key:ident = % $val:expr $(, $($rest:tt)*)?) => {{ let _ = &$val; $( trace_fields!($($rest)*); )? }};
    ($key:ident = ? $val:expr $(, $($rest:tt)*)?) => {{ let _ = &$val; $( trace_fields!($($rest)*); )? }};
    ($key:ident = $val:expr $(, $($rest:tt)*)?) => {{ let _ = &$val; $( trace_fields!($($rest)*); )? }};
    (% $val:ident $(, $($rest:tt)*)?) => {{ let _ = &$val; $( trace_fields!($($rest)*); )? }};
    (? $val:ident $(, $($rest:tt)*)?) => {{ let _ = &$val; $( trace_fields!($($rest)*); )? }};
    ($val:ident $(, $($rest:tt)*)?) => {{ let _ = &$val; $( trace_fields!($($rest)*); )? }};
}

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod inspect;
pub mod lifecycle;
pub mod matchmaking;
pub mod migration;
pub mod orchestrator;
pub mod query;
pub mod reconciler;
pub mod registry;
pub mod types;
mod worker;

#[cfg(feature = "telemetry")]
pub mod telemetry;

// Re-exports
pub use backend::{
    BackendCapabilities, BackendCompletion, BackendEvent, BackendFailure, BackendHandle,
    CompletionPayload, EventSink, LoopbackBackend, LoopbackPlatform, MembershipEvent,
    MembershipEventKind, OpKind, SessionBackend, SessionSnapshot,
};
pub use config::{ConfigError, LobbyConfig};
pub use dispatcher::{EventDispatcher, ListenerId, ListenerScope, LobbyEvent, TerminalReason};
pub use error::{KronosError, Result};
pub use inspect::{MemberView, SessionView};
pub use lifecycle::{LifecycleRequest, LifecycleState};
pub use matchmaking::{
    LastSession, MatchmakingHandle, MatchmakingMode, MatchmakingOutcome, MatchmakingState,
};
pub use migration::{select_host, HostMigration};
pub use orchestrator::{Lobby, LobbyBuilder, PendingOperation};
pub use query::{QueryOp, SearchFilter, SearchResults};
pub use reconciler::{MembershipReconciler, Reconciled};
pub use registry::{Session, SessionRegistry};
pub use types::{
    AttributeMap, AttributeValue, ConnectionState, Identity, Member, MemberRole, SessionDescriptor,
    SessionId, SessionKind, SessionParams, Visibility,
};

#[cfg(feature = "telemetry")]
pub use telemetry::{init_tracing, TracingConfig};

#[cfg(test)]
mod tests {
    #[derive(Debug)]
    struct Failure;

    #[test]
    fn test_trace_macros_accept_every_field_form() {
        let session = "s-1";
        let attempt = 2u32;
        let err = Failure;
        trace_debug!(session = %session, attempt, ?err, "attempt failed");
        trace_info!(%session, backoff_ms = u64::from(attempt) * 50, "retrying");
        trace_warn!("giving up on {} after {}", session, attempt);

        // Usable in expression position, with and without the feature.
        let () = match attempt {
            0 => trace_debug!("first"),
            _ => trace_warn!(session = ?session, attempts = attempt, "exhausted"),
        };
    }
}
