//! graphrecon-core: idempotent provisioning against directory and cloud
//! management APIs (Microsoft Graph, Azure Resource Manager).
//!
//! Layers, leaf first:
//! - `transport`: one HTTP call, failures normalized into `ErrorInfo`
//! - `retry`: bounded fixed-delay retry, permanent errors short-circuit
//! - `api`: per-kind find/create/update on top of the transport
//! - `reconciler`: look up by natural key, create if absent, never guess
//!   between duplicates
//! - `propagation`: sleep-then-probe until a change is visible or the
//!   budget runs out
//!
//! Everything is synchronous and blocking; one resource is reconciled at a
//! time.

pub mod api;
pub mod clock;
pub mod descriptor;
pub mod error;
pub mod outcome;
pub mod propagation;
pub mod reconciler;
pub mod retry;
pub mod session;
pub mod transport;

pub use api::{CreateStyle, KindConfig, KindRegistry, KindSpec, RemoteResource, ResourceApi, RestResourceApi};
pub use clock::{Clock, ManualClock, SystemClock};
pub use descriptor::ResourceDescriptor;
pub use error::{Cancelled, Classification, ConfigError, ErrorInfo, RequestError};
pub use outcome::{OperationOutcome, OutcomeStatus};
pub use propagation::{
    CancelToken, HttpProbe, Probe, PropagationCheck, PropagationState, PropagationWaiter,
    VisibleProbe,
};
pub use reconciler::{Lookup, Reconciler, UpdateMode};
pub use retry::{Retried, RetryExecutor, RetryPolicy};
pub use session::Session;
pub use transport::{HttpTransport, Method, Request, Response, ResponseBody, Transport};
