//! # tcp
//!
//! why: carry raft rpcs between processes and let clients reach a running node
//! relations: implements transport::Transport for the binary; serve() feeds a RaftHandle and reads a Ledger
//! what: RpcRequest/RpcResponse wire types, length-prefixed json framing, TcpTransport, TcpClient, Service, serve
//!
//! One connection per call. Each frame is a 4-byte big-endian length followed
//! by that many bytes of json.

use async_trait::async_trait;
use raft_core::{
    AppendEntriesReply, AppendEntriesRequest, Command, EntryStatus, NodeId, VoteReply, VoteRequest,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::ledger::Ledger;
use crate::node::{NodeStatus, RaftHandle, SubmitReply};
use crate::queue::QueuedCommand;
use crate::transport::Transport;

/// Largest frame either side will read
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rpc", content = "body", rename_all = "snake_case")]
pub enum RpcRequest {
    RequestVote(VoteRequest),
    AppendEntries(AppendEntriesRequest),
    /// Client command for the leader's queue
    Submit {
        command: Command,
        correlation_id: Option<String>,
    },
    LookupEntry {
        correlation_id: String,
    },
    Status,
    Balance {
        wallet_id: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rpc", content = "body", rename_all = "snake_case")]
pub enum RpcResponse {
    Vote(VoteReply),
    Append(AppendEntriesReply),
    Submitted(SubmitReply),
    Entry(Option<EntryStatus>),
    Status(NodeStatus),
    Balance(Option<i64>),
    /// The receiving node failed to handle the call
    Error(String),
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(bytes.len()));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, RpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Transport dialing peers by address
#[derive(Debug, Default)]
pub struct TcpTransport {
    peers: HashMap<NodeId, String>,
}

impl TcpTransport {
    pub fn new(peers: impl IntoIterator<Item = (NodeId, String)>) -> Self {
        Self {
            peers: peers.into_iter().collect(),
        }
    }

    async fn call(&self, target: &NodeId, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        let addr = self
            .peers
            .get(target)
            .cloned()
            .ok_or_else(|| RpcError::Unreachable(target.clone()))?;

        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|_| RpcError::Unreachable(target.clone()))?;
        exchange(&mut stream, &request).await
    }
}

async fn exchange(stream: &mut TcpStream, request: &RpcRequest) -> Result<RpcResponse, RpcError> {
    write_frame(stream, request).await?;
    read_frame(stream).await
}

fn unexpected(response: RpcResponse) -> RpcError {
    match response {
        RpcResponse::Error(message) => RpcError::Remote(message),
        other => RpcError::Remote(format!("unexpected response {other:?}")),
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request_vote(&self, target: &NodeId, request: VoteRequest) -> Result<VoteReply, RpcError> {
        match self.call(target, RpcRequest::RequestVote(request)).await? {
            RpcResponse::Vote(reply) => Ok(reply),
            other => Err(unexpected(other)),
        }
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, RpcError> {
        match self.call(target, RpcRequest::AppendEntries(request)).await? {
            RpcResponse::Append(reply) => Ok(reply),
            other => Err(unexpected(other)),
        }
    }
}

/// Client side of the command rpcs, one connection per call
#[derive(Debug, Clone)]
pub struct TcpClient {
    addr: String,
}

impl TcpClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub async fn submit(&self, command: Command, correlation_id: Option<String>) -> Result<SubmitReply, RpcError> {
        match self.call(RpcRequest::Submit { command, correlation_id }).await? {
            RpcResponse::Submitted(reply) => Ok(reply),
            other => Err(unexpected(other)),
        }
    }

    pub async fn entry_status(&self, correlation_id: impl Into<String>) -> Result<Option<EntryStatus>, RpcError> {
        let correlation_id = correlation_id.into();
        match self.call(RpcRequest::LookupEntry { correlation_id }).await? {
            RpcResponse::Entry(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&self) -> Result<NodeStatus, RpcError> {
        match self.call(RpcRequest::Status).await? {
            RpcResponse::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn balance(&self, wallet_id: u64) -> Result<Option<i64>, RpcError> {
        match self.call(RpcRequest::Balance { wallet_id }).await? {
            RpcResponse::Balance(balance) => Ok(balance),
            other => Err(unexpected(other)),
        }
    }

    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        exchange(&mut stream, &request).await
    }
}

/// What a listener answers with: the node, and optionally the ledger it
/// applies to for balance queries
#[derive(Clone)]
pub struct Service {
    handle: RaftHandle,
    ledger: Option<Ledger>,
}

impl Service {
    pub fn new(handle: RaftHandle) -> Self {
        Self { handle, ledger: None }
    }

    pub fn with_ledger(mut self, ledger: Ledger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    async fn answer(&self, request: RpcRequest) -> RpcResponse {
        let handle = &self.handle;
        let answered = match request {
            RpcRequest::RequestVote(request) => handle.request_vote(request).await.map(RpcResponse::Vote),
            RpcRequest::AppendEntries(request) => handle.append_entries(request).await.map(RpcResponse::Append),
            RpcRequest::Submit { command, correlation_id } => {
                let queued = QueuedCommand { command, correlation_id };
                handle.submit(queued).await.map(RpcResponse::Submitted)
            }
            RpcRequest::LookupEntry { correlation_id } => {
                handle.entry_status(correlation_id).await.map(RpcResponse::Entry)
            }
            RpcRequest::Status => handle.status().await.map(RpcResponse::Status),
            RpcRequest::Balance { wallet_id } => {
                return match &self.ledger {
                    Some(ledger) => RpcResponse::Balance(ledger.balance(wallet_id)),
                    None => RpcResponse::Error("no ledger attached to this listener".into()),
                };
            }
        };
        answered.unwrap_or_else(|err| RpcResponse::Error(err.to_string()))
    }
}

impl From<RaftHandle> for Service {
    fn from(handle: RaftHandle) -> Self {
        Self::new(handle)
    }
}

/// Accept connections forever, one task per connection, each answering a single rpc
pub async fn serve(listener: TcpListener, service: impl Into<Service>) -> io::Result<()> {
    let service = service.into();
    info!(node = %service.handle.id(), addr = %listener.local_addr()?, "accepting rpcs");
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = answer(stream, &service).await {
                warn!(node = %service.handle.id(), peer = %peer_addr, error = %err, "rpc connection failed");
            }
        });
    }
}

async fn answer(mut stream: TcpStream, service: &Service) -> Result<(), RpcError> {
    let request: RpcRequest = read_frame(&mut stream).await?;
    let response = service.answer(request).await;
    debug!(node = %service.handle.id(), "answered rpc");
    write_frame(&mut stream, &response).await
}
