//! Connection header exchange and verification.
//!
//! The initiating side walks `Init -> SentHeader -> AwaitingPeerHeader ->
//! Verified -> Streaming`. The accepting side reads first and goes `Init ->
//! AwaitingPeerHeader -> Verified -> Streaming`, sending its own header on
//! the way into `Streaming`. Any failure moves to `Closed`.

use crate::frame::{read_header, write_header};
use crate::header::{ConnectionHeader, ERROR, MD5_CHECKSUM, TYPE, WILDCARD};
use rosgraph_types::{RosError, RosResult};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    SentHeader,
    AwaitingPeerHeader,
    Verified,
    Streaming,
    Closed,
}

/// Check the peer's `type` and `md5sum` against ours.
///
/// `*` on either side matches anything. A peer header carrying `error`
/// fails verification with that reason.
pub fn verify(local: &ConnectionHeader, remote: &ConnectionHeader) -> RosResult<()> {
    if let Some(reason) = remote.get(ERROR) {
        return Err(RosError::mismatch(ERROR, "", reason));
    }
    for field in [TYPE, MD5_CHECKSUM] {
        let Some(ours) = local.get(field) else {
            continue;
        };
        let theirs = remote.get(field).unwrap_or("");
        if ours != WILDCARD && theirs != WILDCARD && ours != theirs {
            return Err(RosError::mismatch(field, ours, theirs));
        }
    }
    Ok(())
}

async fn with_timeout<T, F>(operation: &str, timeout: Duration, fut: F) -> RosResult<T>
where
    F: Future<Output = RosResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RosError::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// One side of a header exchange.
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    timeout: Duration,
}

impl Handshake {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: HandshakeState::Init,
            timeout,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Send `local`, wait for the peer's header and verify it.
    pub async fn initiate<S>(
        &mut self,
        stream: &mut S,
        local: &ConnectionHeader,
    ) -> RosResult<ConnectionHeader>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.run_initiate(stream, local).await;
        if result.is_err() {
            self.state = HandshakeState::Closed;
        }
        result
    }

    async fn run_initiate<S>(
        &mut self,
        stream: &mut S,
        local: &ConnectionHeader,
    ) -> RosResult<ConnectionHeader>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        with_timeout("send connection header", self.timeout, write_header(stream, local)).await?;
        self.state = HandshakeState::SentHeader;

        self.state = HandshakeState::AwaitingPeerHeader;
        let remote =
            with_timeout("read connection header", self.timeout, read_header(stream)).await?;
        verify(local, &remote)?;
        self.state = HandshakeState::Verified;
        debug!(state = ?self.state, "Peer header verified");
        self.state = HandshakeState::Streaming;
        Ok(remote)
    }

    /// Read the peer's header and let `respond` build our reply.
    ///
    /// `respond` returns the local header to verify against and send, or an
    /// error; on error a header carrying `error=<reason>` is sent before the
    /// connection is given up.
    pub async fn accept<S, F>(&mut self, stream: &mut S, respond: F) -> RosResult<ConnectionHeader>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        F: FnOnce(&ConnectionHeader) -> RosResult<ConnectionHeader>,
    {
        self.state = HandshakeState::AwaitingPeerHeader;
        let remote =
            match with_timeout("read connection header", self.timeout, read_header(stream)).await {
                Ok(header) => header,
                Err(e) => {
                    self.state = HandshakeState::Closed;
                    return Err(e);
                }
            };

        let local = match respond(&remote).and_then(|local| {
            verify(&local, &remote)?;
            Ok(local)
        }) {
            Ok(local) => local,
            Err(e) => {
                self.state = HandshakeState::Closed;
                let reply = ConnectionHeader::error(e.to_string());
                // The peer may already be gone; the original error is what matters.
                let _ = with_timeout("send error header", self.timeout, write_header(stream, &reply))
                    .await;
                return Err(e);
            }
        };
        self.state = HandshakeState::Verified;

        if let Err(e) =
            with_timeout("send connection header", self.timeout, write_header(stream, &local)).await
        {
            self.state = HandshakeState::Closed;
            return Err(e);
        }
        self.state = HandshakeState::Streaming;
        Ok(remote)
    }
}
