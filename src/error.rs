use thiserror::Error;

use crate::types::{ContactID, EndpointID, NodeID, Volume};

/// Errors raised by the engine.
///
/// All of these are local and recoverable: none aborts the engine, and every
/// error path produces exactly one analytics event on the node that hit it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The scheduler could not produce a task for a request: no
    /// (target contact, delivery route) pair passed the feasibility filters.
    #[error("no feasible (pickup, delivery) pair for the request")]
    NoFeasibleTask,

    /// A bundle does not fit in the receiving buffer. The sender retains the
    /// bundle until the contact closes.
    #[error("buffer overflow: {needed} needed, {available} available")]
    BufferOverflow { needed: Volume, available: Volume },

    /// A contact closed (or was truncated) while a transfer was in flight.
    #[error("contact {contact} expired mid-transmission")]
    ContactExpired { contact: ContactID },

    /// A booking was attempted past the residual volume of a contact.
    #[error("insufficient residual volume on contact {contact}")]
    InsufficientVolume { contact: ContactID },

    /// Route search yielded no route towards the endpoint.
    #[error("endpoint {0} is unreachable")]
    UnreachableDestination(EndpointID),

    /// An operation referenced a node unknown to the engine.
    #[error("unknown node {0}")]
    UnknownNode(NodeID),

    /// A contact record failed validation on plan ingestion.
    #[error("invalid contact: {0}")]
    InvalidContact(String),

    /// The contact plan input could not be parsed.
    #[error("malformed contact plan: {0}")]
    PlanFormat(String),
}
