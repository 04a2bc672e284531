use courier_core::{ChannelError, ContractError, Token};

/// Errors from client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// `disconnect()` while a connect is in flight. Rejected rather than
    /// queued so calls already sent are not lost.
    #[error("currently connecting")]
    CurrentlyConnecting,
    /// The operation needs a bound contract.
    #[error("not connected")]
    NotConnected,
    /// The host disconnected before accepting the client.
    #[error("host disconnected while connecting")]
    ConnectFailed,
    /// The call does not match the contract.
    #[error(transparent)]
    Contract(#[from] ContractError),
    /// A response arrived for an id with no running call.
    #[error("no running call for response {0}")]
    UnknownResponse(Token),
    /// The host sent a request packet to a client.
    #[error("unexpected request packet {0} from host")]
    UnexpectedRequest(Token),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// The client was dropped.
    #[error("client closed")]
    Closed,
}
