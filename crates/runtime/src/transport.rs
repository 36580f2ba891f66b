//! All-to-all TCP mesh transport.
//!
//! Every worker listens on its own address and keeps one outbound connection
//! per peer. Outbound messages queue per peer and are delivered once the
//! connection exists (and in FIFO order per peer pair); inbound frames are
//! decoded and forwarded into the event aggregator.

use crate::codec::{decode_frame, encode_frame, MAX_FRAME_SIZE};
use crate::monitor::TransportMonitor;
use satswarm_core::Event;
use satswarm_messages::Message;
use satswarm_types::WorkerRank;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// One fleet member's address book entry.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PeerConfig {
    pub rank: WorkerRank,
    pub address: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no address known for rank {0}")]
    UnknownPeer(WorkerRank),
}

/// Handle for sending messages into the mesh.
pub struct MeshTransport {
    own_rank: WorkerRank,
    outboxes: HashMap<WorkerRank, UnboundedSender<Message>>,
    /// Loopback for self-sends: delivered like any other message.
    events: UnboundedSender<Event>,
}

impl MeshTransport {
    /// Bind the listen address, start per-peer connector tasks, and wire
    /// inbound frames into `events`.
    pub async fn start(
        own_rank: WorkerRank,
        listen_addr: &str,
        peers: &[PeerConfig],
        events: UnboundedSender<Event>,
        monitor: Arc<TransportMonitor>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!(rank = own_rank, listen_addr, "transport listening");

        // Accept loop: read frames from whoever connects.
        let accept_events = events.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!(%addr, "inbound connection");
                        let events = accept_events.clone();
                        tokio::spawn(async move {
                            if let Err(e) = read_frames(stream, events).await {
                                debug!(%addr, error = %e, "inbound connection closed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        // One connector + outbox drainer per peer.
        let mut outboxes = HashMap::new();
        for peer in peers {
            if peer.rank == own_rank {
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            outboxes.insert(peer.rank, tx);
            tokio::spawn(drain_outbox(
                own_rank,
                peer.clone(),
                rx,
                monitor.clone(),
            ));
        }

        Ok(Self {
            own_rank,
            outboxes,
            events,
        })
    }

    /// Queue a message for a peer (FIFO per pair, deferred until connected).
    pub fn send(&self, to: WorkerRank, message: Message) -> Result<(), TransportError> {
        if to == self.own_rank {
            let _ = self.events.send(Event::MessageReceived {
                from: self.own_rank,
                message,
            });
            return Ok(());
        }
        let outbox = self
            .outboxes
            .get(&to)
            .ok_or(TransportError::UnknownPeer(to))?;
        // A closed outbox means the connector task died with the runtime.
        let _ = outbox.send(message);
        Ok(())
    }
}

/// Connect (with retry) and push queued frames to one peer.
async fn drain_outbox(
    own_rank: WorkerRank,
    peer: PeerConfig,
    mut outbox: UnboundedReceiver<Message>,
    monitor: Arc<TransportMonitor>,
) {
    let mut stream: Option<TcpStream> = None;
    while let Some(message) = outbox.recv().await {
        // (Re)connect lazily, keeping the message queued semantics.
        while stream.is_none() {
            let guard = monitor.enter("connect");
            match TcpStream::connect(&peer.address).await {
                Ok(s) => {
                    debug!(peer = peer.rank, address = %peer.address, "connected");
                    stream = Some(s);
                }
                Err(e) => {
                    drop(guard);
                    debug!(peer = peer.rank, error = %e, "connect failed, retrying");
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    continue;
                }
            }
            drop(guard);
        }

        let frame = match encode_frame(own_rank, &message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping unencodable message");
                continue;
            }
        };

        let s = stream.as_mut().expect("connected above");
        let guard = monitor.enter("send");
        let result = async {
            s.write_all(&(frame.len() as u32).to_le_bytes()).await?;
            s.write_all(&frame).await?;
            s.flush().await
        }
        .await;
        drop(guard);

        if let Err(e) = result {
            warn!(peer = peer.rank, error = %e, "send failed, reconnecting");
            stream = None;
            // The message is lost; the protocols tolerate that.
        }
    }
}

/// Read length-prefixed frames from a stream and forward decoded messages.
async fn read_frames(
    mut stream: TcpStream,
    events: UnboundedSender<Event>,
) -> Result<(), std::io::Error> {
    loop {
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len == 0 || len > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad frame length {len}"),
            ));
        }
        let mut frame = vec![0u8; len];
        stream.read_exact(&mut frame).await?;

        match decode_frame(&frame) {
            Ok((from, message)) => {
                if events
                    .send(Event::MessageReceived { from, message })
                    .is_err()
                {
                    // Runner shut down.
                    return Ok(());
                }
            }
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
            }
        }
    }
}
