//! Email delivery: provider transports, the per-job dispatcher and the
//! webhook event reconciler.

pub mod dispatcher;
pub mod reconciler;
pub mod smtp;
pub mod transport;

pub use dispatcher::{DeliveryDispatcher, DispatchError, DispatchOutcome, DispatchSettings};
pub use reconciler::{EventReconciler, ReconcileOutcome, ReconcileSettings, ReconcileSummary};
pub use smtp::SmtpTransport;
pub use transport::{LogTransport, OutboundMessage, RecordingTransport, Transport, TransportError};
