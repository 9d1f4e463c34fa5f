//! Process-group rendezvous over TCP.
//!
//! Rank 0 listens on the agreed port; every other rank connects, announces itself
//! and waits until the whole group has arrived. Nothing here times out: a worker
//! that never shows up keeps the group waiting, and it's up to whoever supervises
//! the processes to notice.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, net::Ipv4Addr, time::Duration};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed rendezvous message: {0}")]
    Codec(#[from] postcard::Error),

    #[error("rank {rank} is outside a world of size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },

    #[error("a worker announced world size {got}, expected {expected}")]
    WorldSizeMismatch { expected: usize, got: usize },

    #[error("rank {0} joined twice")]
    DuplicateRank(usize),

    #[error("rejected by the group leader: {0}")]
    Rejected(String),

    #[error("connection closed before rendezvous completed")]
    ConnectionClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum RendezvousMessage {
    Join { rank: usize, world_size: usize },
    Welcome { rank: usize, world_size: usize },
    Reject { reason: String },
}

/// A collective-communication group this process can join.
#[async_trait]
pub trait ProcessGroup: Send + Sync {
    /// Blocks until all `world_size` members have joined, then returns this
    /// process's rank as confirmed by the group.
    async fn join(&self, rank: usize, world_size: usize) -> Result<usize, RendezvousError>;
}

#[derive(Debug, Clone)]
pub struct TcpRendezvous {
    master_addr: String,
    master_port: u16,
    retry_interval: Duration,
}

impl TcpRendezvous {
    pub fn new(master_addr: impl Into<String>, master_port: u16) -> Self {
        Self {
            master_addr: master_addr.into(),
            master_port,
            retry_interval: CONNECT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    async fn host(&self, world_size: usize) -> Result<usize, RendezvousError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.master_port)).await?;
        info!(
            port = self.master_port,
            world_size, "Waiting for process group to assemble"
        );

        let mut joined: BTreeMap<usize, Framed<TcpStream, LengthDelimitedCodec>> =
            BTreeMap::new();
        while joined.len() + 1 < world_size {
            let (stream, peer) = listener.accept().await?;
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            // a peer that never announces itself only costs its own connection
            let message = match recv(&mut framed).await {
                Ok(message) => message,
                Err(err) => {
                    warn!(%peer, "Dropping peer that failed to join: {err}");
                    continue;
                }
            };
            let (rank, their_world_size) = match message {
                RendezvousMessage::Join { rank, world_size } => (rank, world_size),
                other => {
                    warn!(%peer, ?other, "Unexpected message during rendezvous, dropping peer");
                    continue;
                }
            };
            debug!(%peer, rank, "Worker joined");

            let rejection = if their_world_size != world_size {
                Some(RendezvousError::WorldSizeMismatch {
                    expected: world_size,
                    got: their_world_size,
                })
            } else if rank == 0 || joined.contains_key(&rank) {
                Some(RendezvousError::DuplicateRank(rank))
            } else if rank >= world_size {
                Some(RendezvousError::RankOutOfRange { rank, world_size })
            } else {
                None
            };
            if let Some(err) = rejection {
                let reason = err.to_string();
                send(&mut framed, &RendezvousMessage::Reject { reason: reason.clone() }).await?;
                for mut other in joined.into_values() {
                    let _ = send(&mut other, &RendezvousMessage::Reject { reason: reason.clone() })
                        .await;
                }
                return Err(err);
            }
            joined.insert(rank, framed);
        }

        for (rank, framed) in joined.iter_mut() {
            send(
                framed,
                &RendezvousMessage::Welcome {
                    rank: *rank,
                    world_size,
                },
            )
            .await?;
        }
        info!(world_size, "Process group assembled");
        Ok(0)
    }

    async fn connect(&self, rank: usize, world_size: usize) -> Result<usize, RendezvousError> {
        let stream = loop {
            match TcpStream::connect((self.master_addr.as_str(), self.master_port)).await {
                Ok(stream) => break stream,
                Err(err) => {
                    debug!(
                        rank,
                        addr = %self.master_addr,
                        port = self.master_port,
                        "Group leader not reachable yet: {err}"
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        };
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        send(&mut framed, &RendezvousMessage::Join { rank, world_size }).await?;
        match recv(&mut framed).await? {
            RendezvousMessage::Welcome {
                rank,
                world_size: confirmed,
            } if confirmed == world_size => Ok(rank),
            RendezvousMessage::Welcome {
                world_size: confirmed,
                ..
            } => Err(RendezvousError::WorldSizeMismatch {
                expected: world_size,
                got: confirmed,
            }),
            RendezvousMessage::Reject { reason } => Err(RendezvousError::Rejected(reason)),
            RendezvousMessage::Join { .. } => Err(RendezvousError::Rejected(
                "leader answered with a join request".to_string(),
            )),
        }
    }
}

#[async_trait]
impl ProcessGroup for TcpRendezvous {
    async fn join(&self, rank: usize, world_size: usize) -> Result<usize, RendezvousError> {
        if rank >= world_size {
            return Err(RendezvousError::RankOutOfRange { rank, world_size });
        }
        if rank == 0 {
            self.host(world_size).await
        } else {
            self.connect(rank, world_size).await
        }
    }
}

async fn send(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    message: &RendezvousMessage,
) -> Result<(), RendezvousError> {
    let bytes = postcard::to_stdvec(message)?;
    framed.send(Bytes::from(bytes)).await?;
    Ok(())
}

async fn recv(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
) -> Result<RendezvousMessage, RendezvousError> {
    match framed.next().await {
        Some(frame) => Ok(postcard::from_bytes(&frame?)?),
        None => Err(RendezvousError::ConnectionClosed),
    }
}
