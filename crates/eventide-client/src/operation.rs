//! Operation model shared by the scheduler and the concrete operations.
//!
//! An operation owns the caller's completion channel and all command-specific
//! response handling; the scheduler owns its lifecycle (correlation id, retry
//! count, deadline) and acts on the inspection it returns per response.

use std::time::{Duration, Instant};

use eventide_wire::{Credentials, Package, TcpCommand};
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::messages::{decode_payload, NotHandledBody, NotHandledReason};
use crate::node::NodeEndpoints;

/// What the scheduler should do with an operation after inspecting a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InspectionDecision {
    /// Informational push; no state change.
    DoNothing,
    /// The operation resolved or failed its caller; remove it.
    EndOperation,
    /// Re-send the same request, subject to the retry budget.
    Retry,
    /// Tear down the connection and reconnect to the given endpoints,
    /// keeping the operation tracked.
    Reconnect(NodeEndpoints),
    /// The operation is a confirmed subscription; keep it until dropped.
    Subscribed,
}

/// Decision plus a short description for diagnostics.
#[derive(Debug)]
pub(crate) struct Inspection {
    /// What to do.
    pub decision: InspectionDecision,
    /// Why, for logging.
    pub description: String,
}

impl Inspection {
    pub(crate) fn do_nothing(description: impl Into<String>) -> Self {
        Self {
            decision: InspectionDecision::DoNothing,
            description: description.into(),
        }
    }

    pub(crate) fn end(description: impl Into<String>) -> Self {
        Self {
            decision: InspectionDecision::EndOperation,
            description: description.into(),
        }
    }

    pub(crate) fn retry(description: impl Into<String>) -> Self {
        Self {
            decision: InspectionDecision::Retry,
            description: description.into(),
        }
    }

    pub(crate) fn reconnect(endpoints: NodeEndpoints, description: impl Into<String>) -> Self {
        Self {
            decision: InspectionDecision::Reconnect(endpoints),
            description: description.into(),
        }
    }

    pub(crate) fn subscribed(description: impl Into<String>) -> Self {
        Self {
            decision: InspectionDecision::Subscribed,
            description: description.into(),
        }
    }
}

/// Command-specific request building and response handling.
///
/// Implementations resolve or fail their caller's channel themselves; the
/// scheduler only follows the returned decisions.
pub(crate) trait ClientOperation: Send {
    /// Operation name for diagnostics.
    fn name(&self) -> &'static str;

    /// Builds the request package. Called again verbatim on every retry and
    /// resend, with the same correlation id.
    fn request(
        &self,
        correlation_id: Uuid,
        default_credentials: Option<&Credentials>,
    ) -> Result<Package>;

    /// Inspects a response routed to this operation's correlation id.
    fn inspect(&mut self, package: &Package) -> Inspection;

    /// Fails the operation with a terminal error, e.g. on final close.
    fn fail(&mut self, error: ClientError);
}

/// Lifecycle state of a tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationState {
    /// Admitted but not yet written to a connection.
    Created,
    /// Request written; awaiting a terminal response.
    Active,
    /// Confirmed subscription; lives until an explicit drop.
    Subscribed,
    /// Resolved successfully; about to leave the table.
    Completed,
    /// Failed terminally; about to leave the table.
    Failed,
}

/// A tracked operation: the scheduler's bookkeeping around a [`ClientOperation`].
pub(crate) struct OperationItem {
    /// Correlation id tying responses to this operation.
    pub correlation_id: Uuid,
    /// The command-specific logic.
    pub op: Box<dyn ClientOperation>,
    /// Lifecycle state.
    pub state: OperationState,
    /// Retries performed so far.
    pub retry_count: i32,
    /// Retry budget; negative means unlimited.
    pub max_retries: i32,
    /// Per-attempt response timeout.
    pub timeout: Duration,
    /// When the current attempt expires.
    pub deadline: Instant,
}

impl OperationItem {
    /// Creates a freshly admitted operation.
    pub(crate) fn new(
        correlation_id: Uuid,
        op: Box<dyn ClientOperation>,
        max_retries: i32,
        timeout: Duration,
    ) -> Self {
        Self {
            correlation_id,
            op,
            state: OperationState::Created,
            retry_count: 0,
            max_retries,
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    /// Whether the retry budget is spent.
    pub(crate) fn retries_exhausted(&self) -> bool {
        self.max_retries >= 0 && self.retry_count >= self.max_retries
    }

    /// Total attempts made so far, the initial send included.
    pub(crate) fn attempts(&self) -> i32 {
        self.retry_count + 1
    }

    /// Starts the next attempt: bumps the retry count and resets the deadline.
    pub(crate) fn begin_retry(&mut self, now: Instant) {
        self.retry_count += 1;
        self.deadline = now + self.timeout;
    }
}

/// Responses every operation handles the same way.
pub(crate) enum CommonResponse {
    /// Terminal failure to surface to the caller.
    Fail(ClientError),
    /// Transient server condition; retry the request.
    Retry(String),
    /// The node cannot serve the request; reconnect to the leader.
    Reconnect(NodeEndpoints, String),
}

/// Classifies the command-independent responses: BadRequest,
/// NotAuthenticatedException, and NotHandled. Returns `None` for anything
/// command-specific.
pub(crate) fn inspect_common(package: &Package) -> Option<CommonResponse> {
    match package.command {
        TcpCommand::BadRequest => Some(CommonResponse::Fail(ClientError::BadRequest {
            message: String::from_utf8_lossy(&package.data).into_owned(),
        })),
        TcpCommand::NotAuthenticatedException => {
            Some(CommonResponse::Fail(ClientError::NotAuthenticated {
                message: String::from_utf8_lossy(&package.data).into_owned(),
            }))
        }
        TcpCommand::NotHandled => Some(classify_not_handled(&package.data)),
        _ => None,
    }
}

fn classify_not_handled(data: &[u8]) -> CommonResponse {
    let body: NotHandledBody = match decode_payload(data) {
        Ok(body) => body,
        Err(e) => return CommonResponse::Retry(format!("undecodable NotHandled body: {e}")),
    };
    match body.reason {
        NotHandledReason::NotReady => CommonResponse::Retry("server not ready".to_string()),
        NotHandledReason::TooBusy => CommonResponse::Retry("server too busy".to_string()),
        NotHandledReason::NotLeader => match body.leader.and_then(parse_leader) {
            Some(endpoints) => CommonResponse::Reconnect(
                endpoints,
                "server is not the leader".to_string(),
            ),
            None => CommonResponse::Retry(
                "server is not the leader and named no usable endpoint".to_string(),
            ),
        },
    }
}

fn parse_leader(leader: crate::messages::LeaderEndpoints) -> Option<NodeEndpoints> {
    let tcp = format!(
        "{}:{}",
        leader.external_tcp_address, leader.external_tcp_port
    )
    .parse()
    .ok()?;
    let secure = match (
        leader.external_secure_tcp_address,
        leader.external_secure_tcp_port,
    ) {
        (Some(addr), Some(port)) => format!("{addr}:{port}").parse().ok(),
        _ => None,
    };
    Some(NodeEndpoints {
        tcp_endpoint: tcp,
        secure_tcp_endpoint: secure,
    })
}
