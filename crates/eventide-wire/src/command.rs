//! Command opcodes for the Eventide TCP protocol.
//!
//! The opcode space is a single byte. Both the symbolic name and the numeric
//! wire value are part of the protocol contract.

use crate::error::{Result, WireError};

/// Operations in the TCP protocol, one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TcpCommand {
    /// Heartbeat probe sent by either side while a connection is idle.
    HeartbeatRequest = 0x01,
    /// Reply to a heartbeat probe, echoing its correlation id.
    HeartbeatResponse = 0x02,
    /// Application-level ping.
    Ping = 0x03,
    /// Reply to a ping, echoing its payload.
    Pong = 0x04,

    /// Append a batch of events to a stream.
    WriteEvents = 0x82,
    /// Result of an append.
    WriteEventsCompleted = 0x83,
    /// Soft- or hard-delete a stream.
    DeleteStream = 0x8A,
    /// Result of a stream deletion.
    DeleteStreamCompleted = 0x8B,

    /// Read a single event from a stream.
    ReadEvent = 0xB0,
    /// Result of a single-event read.
    ReadEventCompleted = 0xB1,
    /// Read a forward slice of a stream.
    ReadStreamEventsForward = 0xB2,
    /// Result of a forward stream read.
    ReadStreamEventsForwardCompleted = 0xB3,
    /// Read a backward slice of a stream.
    ReadStreamEventsBackward = 0xB4,
    /// Result of a backward stream read.
    ReadStreamEventsBackwardCompleted = 0xB5,
    /// Read a forward slice of the $all stream.
    ReadAllEventsForward = 0xB6,
    /// Result of a forward $all read.
    ReadAllEventsForwardCompleted = 0xB7,
    /// Read a backward slice of the $all stream.
    ReadAllEventsBackward = 0xB8,
    /// Result of a backward $all read.
    ReadAllEventsBackwardCompleted = 0xB9,

    /// Open a volatile subscription on a stream (or $all).
    SubscribeToStream = 0xC0,
    /// Server confirmation that a subscription is live.
    SubscriptionConfirmation = 0xC1,
    /// An event pushed to a volatile subscription.
    StreamEventAppeared = 0xC2,
    /// Caller-initiated teardown of a subscription.
    UnsubscribeFromStream = 0xC3,
    /// Server notice that a subscription has ended.
    SubscriptionDropped = 0xC4,
    /// Join a persistent subscription consumer group.
    ConnectToPersistentSubscription = 0xC5,
    /// Server confirmation for a persistent subscription.
    PersistentSubscriptionConfirmation = 0xC6,
    /// An event pushed to a persistent subscription.
    PersistentSubscriptionStreamEventAppeared = 0xC7,
    /// Create a persistent subscription group.
    CreatePersistentSubscription = 0xC8,
    /// Result of a persistent subscription creation.
    CreatePersistentSubscriptionCompleted = 0xC9,
    /// Delete a persistent subscription group.
    DeletePersistentSubscription = 0xCA,
    /// Result of a persistent subscription deletion.
    DeletePersistentSubscriptionCompleted = 0xCB,
    /// Acknowledge processed events on a persistent subscription.
    PersistentSubscriptionAckEvents = 0xCC,
    /// Negatively acknowledge events on a persistent subscription.
    PersistentSubscriptionNakEvents = 0xCD,
    /// Update a persistent subscription group.
    UpdatePersistentSubscription = 0xCE,
    /// Result of a persistent subscription update.
    UpdatePersistentSubscriptionCompleted = 0xCF,

    /// Server rejection of a malformed request.
    BadRequest = 0xF0,
    /// Server notice that it did not handle a request (busy, not ready, not leader).
    NotHandled = 0xF1,
    /// Validate credentials against the server.
    Authenticate = 0xF2,
    /// Credentials accepted.
    Authenticated = 0xF3,
    /// Credentials rejected.
    NotAuthenticatedException = 0xF4,
}

impl TcpCommand {
    /// Returns the wire value of this command.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a wire value into a command.
    pub fn from_u8(raw: u8) -> Result<Self> {
        let command = match raw {
            0x01 => TcpCommand::HeartbeatRequest,
            0x02 => TcpCommand::HeartbeatResponse,
            0x03 => TcpCommand::Ping,
            0x04 => TcpCommand::Pong,
            0x82 => TcpCommand::WriteEvents,
            0x83 => TcpCommand::WriteEventsCompleted,
            0x8A => TcpCommand::DeleteStream,
            0x8B => TcpCommand::DeleteStreamCompleted,
            0xB0 => TcpCommand::ReadEvent,
            0xB1 => TcpCommand::ReadEventCompleted,
            0xB2 => TcpCommand::ReadStreamEventsForward,
            0xB3 => TcpCommand::ReadStreamEventsForwardCompleted,
            0xB4 => TcpCommand::ReadStreamEventsBackward,
            0xB5 => TcpCommand::ReadStreamEventsBackwardCompleted,
            0xB6 => TcpCommand::ReadAllEventsForward,
            0xB7 => TcpCommand::ReadAllEventsForwardCompleted,
            0xB8 => TcpCommand::ReadAllEventsBackward,
            0xB9 => TcpCommand::ReadAllEventsBackwardCompleted,
            0xC0 => TcpCommand::SubscribeToStream,
            0xC1 => TcpCommand::SubscriptionConfirmation,
            0xC2 => TcpCommand::StreamEventAppeared,
            0xC3 => TcpCommand::UnsubscribeFromStream,
            0xC4 => TcpCommand::SubscriptionDropped,
            0xC5 => TcpCommand::ConnectToPersistentSubscription,
            0xC6 => TcpCommand::PersistentSubscriptionConfirmation,
            0xC7 => TcpCommand::PersistentSubscriptionStreamEventAppeared,
            0xC8 => TcpCommand::CreatePersistentSubscription,
            0xC9 => TcpCommand::CreatePersistentSubscriptionCompleted,
            0xCA => TcpCommand::DeletePersistentSubscription,
            0xCB => TcpCommand::DeletePersistentSubscriptionCompleted,
            0xCC => TcpCommand::PersistentSubscriptionAckEvents,
            0xCD => TcpCommand::PersistentSubscriptionNakEvents,
            0xCE => TcpCommand::UpdatePersistentSubscription,
            0xCF => TcpCommand::UpdatePersistentSubscriptionCompleted,
            0xF0 => TcpCommand::BadRequest,
            0xF1 => TcpCommand::NotHandled,
            0xF2 => TcpCommand::Authenticate,
            0xF3 => TcpCommand::Authenticated,
            0xF4 => TcpCommand::NotAuthenticatedException,
            other => return Err(WireError::UnknownCommand(other)),
        };
        Ok(command)
    }
}

impl TryFrom<u8> for TcpCommand {
    type Error = WireError;

    fn try_from(raw: u8) -> Result<Self> {
        TcpCommand::from_u8(raw)
    }
}
