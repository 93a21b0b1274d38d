pub mod payments;
pub mod reconciliation;

pub use payments::{InitiateRequest, PaymentError, PaymentService};
pub use reconciliation::ReconciliationService;
