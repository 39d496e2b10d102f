//! Correlation ID generation for request/response matching.

use uuid::Uuid;

/// Generate a new correlation ID (UUID v4).
///
/// Ids must be unique across concurrent in-flight requests within one page;
/// v4 randomness covers that without a global counter.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
