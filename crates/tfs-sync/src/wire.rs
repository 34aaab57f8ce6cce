//! Sync protocol over TCP.
//!
//! Every message is a little-endian `u32` length followed by a bincode
//! encoded [`SyncRequest`] or [`SyncResponse`]. A connection carries any
//! number of request/response pairs in turn.

use std::io::{Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tfs_btree::BlockId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

use crate::{Result, SyncBlock, SyncEndpoint, SyncError};

/// Largest message either side accepts
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub enum SyncRequest {
    GetBlockIdByName {
        name: String,
    },
    GetBlockById {
        id: BlockId,
        want_data: bool,
        want_missing: bool,
    },
    StoreBlock {
        name: String,
        block: SyncBlock,
    },
    SetNameToBlockId {
        name: String,
        id: BlockId,
    },
    MergeBlockNameTo {
        from: String,
        to: String,
    },
    ClearBlocksInName {
        name: String,
    },
    UpgradeBlockNonWeak {
        id: BlockId,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum SyncResponse {
    BlockId(Option<BlockId>),
    Block(Option<SyncBlock>),
    Done,
    Error(String),
}

/// Run one request against a local endpoint
pub fn dispatch(endpoint: &dyn SyncEndpoint, request: SyncRequest) -> SyncResponse {
    let result = match request {
        SyncRequest::GetBlockIdByName { name } => endpoint
            .get_block_id_by_name(&name)
            .map(SyncResponse::BlockId),
        SyncRequest::GetBlockById {
            id,
            want_data,
            want_missing,
        } => endpoint
            .get_block_by_id(&id, want_data, want_missing)
            .map(SyncResponse::Block),
        SyncRequest::StoreBlock { name, block } => endpoint
            .store_block(&name, block)
            .map(|b| SyncResponse::Block(Some(b))),
        SyncRequest::SetNameToBlockId { name, id } => endpoint
            .set_name_to_block_id(&name, &id)
            .map(|()| SyncResponse::Done),
        SyncRequest::MergeBlockNameTo { from, to } => endpoint
            .merge_block_name_to(&from, &to)
            .map(|()| SyncResponse::Done),
        SyncRequest::ClearBlocksInName { name } => endpoint
            .clear_blocks_in_name(&name)
            .map(|()| SyncResponse::Done),
        SyncRequest::UpgradeBlockNonWeak { id } => endpoint
            .upgrade_block_non_weak(&id)
            .map(SyncResponse::Block),
    };
    result.unwrap_or_else(|err| {
        warn!(%err, "sync request failed");
        SyncResponse::Error(err.to_string())
    })
}

fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(message)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(SyncError::TooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn frame_len(header: [u8; 4]) -> Result<usize> {
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(SyncError::TooLarge(len));
    }
    Ok(len)
}

async fn handle_connection(mut stream: TcpStream, endpoint: Arc<dyn SyncEndpoint>) {
    loop {
        let mut header = [0u8; 4];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let len = match frame_len(header) {
            Ok(len) => len,
            Err(err) => {
                warn!(%err, "rejecting sync message");
                return;
            }
        };
        let mut buf = vec![0u8; len];
        if stream.read_exact(&mut buf).await.is_err() {
            return;
        }

        let response = match bincode::deserialize::<SyncRequest>(&buf) {
            Ok(request) => {
                let endpoint = endpoint.clone();
                tokio::task::spawn_blocking(move || dispatch(endpoint.as_ref(), request))
                    .await
                    .unwrap_or_else(|err| SyncResponse::Error(err.to_string()))
            }
            Err(err) => SyncResponse::Error(format!("undecodable request: {err}")),
        };
        let frame = match encode_frame(&response) {
            Ok(frame) => frame,
            Err(err) => {
                error!(%err, "failed to encode sync response");
                return;
            }
        };
        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

/// Accept sync connections on `listener` forever.
///
/// Requests run on the blocking pool since endpoints do storage I/O.
pub async fn serve(listener: TcpListener, endpoint: Arc<dyn SyncEndpoint>) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "sync server listening");
    }
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "sync connection");
                let _ = stream.set_nodelay(true);
                tokio::spawn(handle_connection(stream, endpoint.clone()));
            }
            Err(err) => error!(%err, "sync accept failed"),
        }
    }
}

/// Blocking client for a remote [`serve`] loop.
///
/// Keeps a pool of idle connections so that concurrent callers each get a
/// stream of their own.
#[derive(Debug)]
pub struct TcpEndpoint {
    addr: SocketAddr,
    idle: Mutex<Vec<std::net::TcpStream>>,
}

impl TcpEndpoint {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SyncError::Protocol("address resolves to nothing".into()))?;
        let endpoint = Self {
            addr,
            idle: Mutex::new(Vec::new()),
        };
        let stream = endpoint.open()?;
        endpoint.idle.lock().push(stream);
        Ok(endpoint)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn open(&self) -> Result<std::net::TcpStream> {
        let stream = std::net::TcpStream::connect(self.addr)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn call(&self, request: SyncRequest) -> Result<SyncResponse> {
        let pooled = self.idle.lock().pop();
        let mut stream = match pooled {
            Some(stream) => stream,
            None => self.open()?,
        };
        stream.write_all(&encode_frame(&request)?)?;
        let mut header = [0u8; 4];
        stream.read_exact(&mut header)?;
        let mut buf = vec![0u8; frame_len(header)?];
        stream.read_exact(&mut buf)?;
        let response = bincode::deserialize(&buf)?;
        // Only streams that completed an exchange go back to the pool
        self.idle.lock().push(stream);
        match response {
            SyncResponse::Error(msg) => Err(SyncError::Remote(msg)),
            other => Ok(other),
        }
    }

    fn call_block(&self, request: SyncRequest) -> Result<Option<SyncBlock>> {
        match self.call(request)? {
            SyncResponse::Block(block) => Ok(block),
            other => Err(unexpected(other)),
        }
    }

    fn call_done(&self, request: SyncRequest) -> Result<()> {
        match self.call(request)? {
            SyncResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: SyncResponse) -> SyncError {
    SyncError::Protocol(format!("unexpected response {response:?}"))
}

impl SyncEndpoint for TcpEndpoint {
    fn get_block_id_by_name(&self, name: &str) -> Result<Option<BlockId>> {
        match self.call(SyncRequest::GetBlockIdByName {
            name: name.to_string(),
        })? {
            SyncResponse::BlockId(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    fn get_block_by_id(
        &self,
        id: &BlockId,
        want_data: bool,
        want_missing: bool,
    ) -> Result<Option<SyncBlock>> {
        self.call_block(SyncRequest::GetBlockById {
            id: id.clone(),
            want_data,
            want_missing,
        })
    }

    fn store_block(&self, name: &str, block: SyncBlock) -> Result<SyncBlock> {
        let id = block.id.clone();
        self.call_block(SyncRequest::StoreBlock {
            name: name.to_string(),
            block,
        })?
        .ok_or(SyncError::MissingBlock { id })
    }

    fn set_name_to_block_id(&self, name: &str, id: &BlockId) -> Result<()> {
        self.call_done(SyncRequest::SetNameToBlockId {
            name: name.to_string(),
            id: id.clone(),
        })
    }

    fn merge_block_name_to(&self, from: &str, to: &str) -> Result<()> {
        self.call_done(SyncRequest::MergeBlockNameTo {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    fn clear_blocks_in_name(&self, name: &str) -> Result<()> {
        self.call_done(SyncRequest::ClearBlocksInName {
            name: name.to_string(),
        })
    }

    fn upgrade_block_non_weak(&self, id: &BlockId) -> Result<Option<SyncBlock>> {
        self.call_block(SyncRequest::UpgradeBlockNonWeak { id: id.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tfs_storage::BlockStatus;

    #[test]
    fn test_frame_layout() {
        let request = SyncRequest::ClearBlocksInName {
            name: "r1".to_string(),
        };
        let frame = encode_frame(&request).unwrap();
        let mut header = [0u8; 4];
        header.copy_from_slice(&frame[..4]);
        assert_eq!(frame_len(header).unwrap(), frame.len() - 4);
        let decoded: SyncRequest = bincode::deserialize(&frame[4..]).unwrap();
        assert!(matches!(decoded, SyncRequest::ClearBlocksInName { name } if name == "r1"));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let header = ((MAX_MESSAGE_SIZE + 1) as u32).to_le_bytes();
        assert!(matches!(frame_len(header), Err(SyncError::TooLarge(_))));
    }

    #[test]
    fn test_block_response_keeps_payload() {
        let block = SyncBlock {
            id: BlockId::for_content(b"x"),
            status: BlockStatus::Weak,
            data: Some(b"encoded".to_vec()),
            missing: vec![BlockId::for_content(b"y")],
        };
        let frame = encode_frame(&SyncResponse::Block(Some(block.clone()))).unwrap();
        match bincode::deserialize(&frame[4..]).unwrap() {
            SyncResponse::Block(Some(decoded)) => assert_eq!(decoded, block),
            other => panic!("unexpected {other:?}"),
        }
    }
}
