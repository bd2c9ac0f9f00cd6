//! WebSocket transport joining brokers in different processes.
//!
//! [`WsBridge`] listens for peers and [`WsLink`] dials one. Either end relays
//! every frame its local broker sees to the peer and republishes every frame
//! received from the peer locally, so publishers, subscribers, and RPC calls
//! work across the connection without knowing it exists.
//!
//! Each frame is one text message, `"<topic>\n<json body>"`. Frames that
//! arrived through a connection are stamped with that connection's id and
//! never sent back through it.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use xiron_types::{BusError, TransportError};

use crate::broker::Broker;
use crate::frame::Frame;

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Accepts WebSocket peers and bridges each one to the local broker.
pub struct WsBridge {
    broker: Broker,
    listener: TcpListener,
}

impl WsBridge {
    /// Bind the listening socket. Port `0` picks a free port; see
    /// [`local_addr`](Self::local_addr).
    pub async fn bind(broker: Broker, addr: SocketAddr) -> Result<Self, BusError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Connect(format!("bind error on {addr}: {e}")))?;
        Ok(Self { broker, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BusError> {
        self.listener
            .local_addr()
            .map_err(|e| TransportError::Connect(e.to_string()).into())
    }

    /// Serve peers until this future is dropped, which also closes every
    /// open peer connection.
    pub async fn run(self) -> Result<(), BusError> {
        // Never sent: dropping it with this future tells peers to close.
        let (_shutdown, shutdown_rx) = watch::channel(false);
        info!(addr = ?self.listener.local_addr().ok(), "bridge listening");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let broker = self.broker.clone();
                    let cancel = shutdown_rx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_peer(stream, peer, broker, cancel).await {
                            error!(peer = %peer, error = %e, "bridge peer error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "bridge accept error");
                }
            }
        }
    }
}

async fn handle_peer(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Broker,
    cancel: watch::Receiver<bool>,
) -> Result<(), BusError> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| TransportError::Connect(format!("ws handshake from {peer}: {e}")))?;

    let id = Uuid::new_v4();
    let tap = broker.tap();
    info!(peer = %peer, %id, "bridge peer connected");
    let result = relay(ws, broker, id, tap, cancel).await;
    info!(peer = %peer, %id, "bridge peer disconnected");
    result
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Client end of a bridge connection. Dropping it closes the link.
pub struct WsLink {
    id: Uuid,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<Result<(), BusError>>>,
}

impl WsLink {
    /// Dial `url` (e.g. `"ws://127.0.0.1:8081"`) and start relaying.
    ///
    /// Local frames published after this returns are forwarded.
    pub async fn connect(url: &str, broker: Broker) -> Result<Self, BusError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(format!("{url}: {e}")))?;

        let id = Uuid::new_v4();
        let tap = broker.tap();
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(relay(ws, broker, id, tap, cancel_rx));
        info!(url, %id, "bridge link up");

        Ok(Self {
            id,
            cancel,
            task: Some(task),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// `false` once the peer hung up or the relay hit an error.
    pub fn is_connected(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Send a close frame and wait for the relay to finish.
    pub async fn close(mut self) -> Result<(), BusError> {
        self.cancel.send_replace(true);
        match self.task.take() {
            Some(task) => task.await.map_err(|e| TransportError::Receive(e.to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// Relay loop shared by both ends
// ---------------------------------------------------------------------------

async fn relay<S>(
    ws: WebSocketStream<S>,
    broker: Broker,
    id: Uuid,
    mut tap: broadcast::Receiver<Frame>,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), BusError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            // Closing on sender drop as well as on an explicit signal.
            _ = cancel.changed() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            // Forward local frames to the peer.
            result = tap.recv() => {
                match result {
                    Ok(frame) if frame.origin == Some(id) => {}
                    Ok(frame) => {
                        ws_tx
                            .send(Message::Text(frame.to_wire().into()))
                            .await
                            .map_err(|e| TransportError::Send(e.to_string()))?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(%id, lagged_by = n, "bridge lagged, frames not forwarded");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            // Republish peer frames locally.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match Frame::from_wire(text.as_str()) {
                        Ok(frame) => {
                            let delivered = broker.publish(frame.with_origin(id));
                            debug!(%id, delivered, "frame from peer");
                        }
                        Err(e) => warn!(%id, error = %e, "dropping malformed frame from peer"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => return Err(TransportError::Receive(e.to_string()).into()),
                    _ => {}
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{DeliveryMode, Dispatcher};
    use crate::facade::CommandClient;
    use crate::publisher::Publisher;
    use crate::rpc::{GET_POSE, RpcClient, RpcResponder};
    use std::time::Duration;
    use xiron_types::{Pose, PoseRequest, RobotId, Topic, VelocityCommand};

    async fn start_bridge() -> Result<(Broker, SocketAddr, JoinHandle<Result<(), BusError>>), BusError> {
        let broker = Broker::default();
        let bridge = WsBridge::bind(broker.clone(), "127.0.0.1:0".parse().expect("addr")).await?;
        let addr = bridge.local_addr()?;
        let task = tokio::spawn(bridge.run());
        Ok((broker, addr, task))
    }

    #[tokio::test]
    async fn link_forwards_commands_to_bridge() -> Result<(), Box<dyn std::error::Error>> {
        let (server, addr, server_task) = start_bridge().await?;
        let topic = Topic::new("vel")?;
        let mut rx = server.subscribe(&topic);

        let client = Broker::default();
        let link = WsLink::connect(&format!("ws://{addr}"), client.clone()).await?;
        assert!(link.is_connected());

        let cmd = VelocityCommand::unicycle(RobotId::new("robot0")?, 0.25, 0.3);
        Publisher::new(client).publish(&topic, &cmd)?;

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await??;
        assert_eq!(serde_json::from_str::<VelocityCommand>(&frame.body)?, cmd);

        link.close().await?;
        server_task.abort();
        Ok(())
    }

    #[tokio::test]
    async fn rpc_works_across_the_bridge() -> Result<(), Box<dyn std::error::Error>> {
        let (server, addr, server_task) = start_bridge().await?;
        let _sim = RpcResponder::serve(server, GET_POSE, |req: PoseRequest| {
            Ok::<_, String>(Pose {
                robot_id: req.id,
                position: (5.0, 6.0),
                orientation: 0.1,
            })
        })?;

        let client = Broker::default();
        let _link = WsLink::connect(&format!("ws://{addr}"), client.clone()).await?;
        let facade = CommandClient::new(client, Topic::new("vel")?).with_timeout(Duration::from_secs(2));

        let pose = facade.get_pose(&RobotId::new("robot0")?).await?;
        assert_eq!(pose.position, (5.0, 6.0));

        server_task.abort();
        Ok(())
    }

    /// Link `broker` to the bridge at `addr` and return once the bridge's side
    /// of the link is relaying: an RPC reply can only come back through it.
    async fn link_ready(addr: SocketAddr, broker: &Broker) -> Result<WsLink, Box<dyn std::error::Error>> {
        let link = WsLink::connect(&format!("ws://{addr}"), broker.clone()).await?;
        let request = PoseRequest { id: RobotId::new("robot0")? };
        let _: Pose = RpcClient::new(broker.clone())
            .call(GET_POSE, &request, Duration::from_secs(2))
            .await?;
        Ok(link)
    }

    fn pose_responder(broker: &Broker) -> Result<RpcResponder, BusError> {
        RpcResponder::serve(broker.clone(), GET_POSE, |req: PoseRequest| {
            Ok::<_, String>(Pose {
                robot_id: req.id,
                position: (0.0, 0.0),
                orientation: 0.0,
            })
        })
    }

    /// Drain `rx` for `window` and return how many frames arrived.
    async fn count_frames(rx: &mut crate::broker::TopicReceiver, window: Duration) -> usize {
        let mut n = 0;
        while tokio::time::timeout(window, rx.recv()).await.is_ok_and(|r| r.is_ok()) {
            n += 1;
        }
        n
    }

    #[tokio::test]
    async fn frame_is_not_echoed_back_to_its_sender() -> Result<(), Box<dyn std::error::Error>> {
        let (server, addr, server_task) = start_bridge().await?;
        let _sim = pose_responder(&server)?;
        let topic = Topic::new("vel")?;
        let mut server_rx = server.subscribe(&topic);

        let client = Broker::default();
        let _link = link_ready(addr, &client).await?;
        let mut client_rx = client.subscribe(&topic);

        let cmd = VelocityCommand::unicycle(RobotId::new("robot0")?, 1.0, 0.0);
        assert_eq!(Publisher::new(client).publish(&topic, &cmd)?, 1);

        let frame = tokio::time::timeout(Duration::from_secs(2), server_rx.recv()).await??;
        assert_eq!(serde_json::from_str::<VelocityCommand>(&frame.body)?, cmd);
        // The local delivery only; nothing comes back over the link.
        assert_eq!(count_frames(&mut client_rx, Duration::from_millis(200)).await, 1);

        server_task.abort();
        Ok(())
    }

    #[tokio::test]
    async fn frame_from_one_peer_reaches_the_other_once() -> Result<(), Box<dyn std::error::Error>> {
        let (server, addr, server_task) = start_bridge().await?;
        let _sim = pose_responder(&server)?;
        let topic = Topic::new("vel")?;

        let peer_a = Broker::default();
        let peer_b = Broker::default();
        let _link_a = link_ready(addr, &peer_a).await?;
        let _link_b = link_ready(addr, &peer_b).await?;
        let mut rx_a = peer_a.subscribe(&topic);
        let mut rx_b = peer_b.subscribe(&topic);

        let cmd = VelocityCommand::unicycle(RobotId::new("robot1")?, 0.5, 0.5);
        Publisher::new(peer_a).publish(&topic, &cmd)?;

        let frame = tokio::time::timeout(Duration::from_secs(2), rx_b.recv()).await??;
        assert_eq!(serde_json::from_str::<VelocityCommand>(&frame.body)?, cmd);
        assert_eq!(count_frames(&mut rx_b, Duration::from_millis(200)).await, 0);
        assert_eq!(count_frames(&mut rx_a, Duration::from_millis(50)).await, 1);

        server_task.abort();
        Ok(())
    }

    #[tokio::test]
    async fn server_telemetry_reaches_client_subscription() -> Result<(), Box<dyn std::error::Error>> {
        let (server, addr, server_task) = start_bridge().await?;
        let _sim = pose_responder(&server)?;

        let client = Broker::default();
        let _link = link_ready(addr, &client).await?;
        let dispatcher = Dispatcher::new(client);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _handle = dispatcher.subscribe(
            RobotId::new("robot0")?,
            Topic::new("pose")?,
            DeliveryMode::Push,
            move |pose: Pose| {
                let _ = tx.send(pose);
            },
        )?;

        let pose = Pose {
            robot_id: RobotId::new("robot0")?,
            position: (3.0, -1.0),
            orientation: 0.25,
        };
        Publisher::new(server).publish(&Topic::new("pose")?, &pose)?;

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await?
            .ok_or("callback channel closed")?;
        assert_eq!(got, pose);

        server_task.abort();
        Ok(())
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let result = WsLink::connect("ws://127.0.0.1:1", Broker::default()).await;
        assert!(matches!(result, Err(BusError::Transport(TransportError::Connect(_)))));
    }

    #[test]
    fn malformed_wire_text_is_rejected() {
        assert!(Frame::from_wire("no separator").is_err());
    }
}
