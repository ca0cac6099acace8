#![allow(clippy::collapsible_match)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    gossipsub, mdns, noise,
    swarm::{Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, SwarmBuilder,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError, Consumer};

/// Largest message the mesh will carry.
const MAX_TRANSMIT_SIZE: usize = 1024 * 1024;

/// Messages held per queue while no peer has declared it for consuming.
pub const MAX_HELD_PER_QUEUE: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Multiaddrs to listen on, e.g. `/ip4/0.0.0.0/udp/4001/quic-v1`.
    pub listen: Vec<String>,
    /// Peers dialled at startup in addition to mDNS discovery.
    pub bootstrap: Vec<String>,
    pub mdns: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen: vec![
                "/ip4/0.0.0.0/udp/0/quic-v1".to_string(),
                "/ip4/0.0.0.0/tcp/0".to_string(),
            ],
            bootstrap: Vec::new(),
            mdns: true,
        }
    }
}

#[derive(libp2p::swarm::NetworkBehaviour)]
struct MeshBehaviour {
    gossipsub: gossipsub::Behaviour,
    mdns: libp2p::swarm::behaviour::toggle::Toggle<mdns::tokio::Behaviour>,
}

enum MeshRequest {
    Declare {
        queue: String,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    Publish {
        queue: String,
        body: Vec<u8>,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    Consume {
        queue: String,
        reply: oneshot::Sender<Result<Consumer, BrokerError>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Result<Vec<Multiaddr>, BrokerError>>,
    },
    Mailboxes {
        reply: oneshot::Sender<Result<Vec<String>, BrokerError>>,
    },
}

struct Mailbox {
    queue: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

/// Broker carried over a libp2p gossipsub mesh. Each queue is one topic.
///
/// `declare_queue` subscribes to the topic and opens a local mailbox, so
/// messages that arrive before a consumer attaches are kept. Gossipsub fans
/// a message out to every subscriber, so only the one peer that consumes a
/// queue may declare it that way; publishers use `declare_outbound`, which
/// does not subscribe.
///
/// A publish to a topic no peer has subscribed to yet is held in memory, up
/// to [`MAX_HELD_PER_QUEUE`] per queue, and sent once a subscriber appears.
#[derive(Clone)]
pub struct MeshBroker {
    requests: mpsc::UnboundedSender<MeshRequest>,
    local_peer_id: PeerId,
}

impl MeshBroker {
    pub async fn start(config: &MeshConfig) -> anyhow::Result<Self> {
        let id_keys = libp2p::identity::Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(id_keys.public());

        let gossip_config = gossipsub::ConfigBuilder::default()
            .max_transmit_size(MAX_TRANSMIT_SIZE)
            .build()?;
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(id_keys.clone()),
            gossip_config,
        )
        .map_err(|e| anyhow!(e))?;

        let mdns = if config.mdns {
            Some(mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?)
        } else {
            None
        };

        let behaviour = MeshBehaviour {
            gossipsub,
            mdns: mdns.into(),
        };

        let mut swarm = SwarmBuilder::with_existing_identity(id_keys)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_quic()
            .with_dns()?
            .with_behaviour(|_| Ok(behaviour))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        for addr in &config.listen {
            let ma: Multiaddr = addr
                .parse()
                .with_context(|| format!("invalid listen multiaddr '{addr}'"))?;
            Swarm::listen_on(&mut swarm, ma)?;
        }
        for addr in &config.bootstrap {
            match addr.parse::<Multiaddr>() {
                Ok(ma) => {
                    if let Err(e) = swarm.dial(ma) {
                        warn!(peer=%addr, error=%e, "bootstrap dial failed");
                    }
                }
                Err(e) => warn!(peer=%addr, error=%e, "ignoring invalid bootstrap multiaddr"),
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(swarm, rx));
        info!(peer=%local_peer_id, "mesh broker started");

        Ok(Self {
            requests: tx,
            local_peer_id,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Addresses the swarm is currently listening on.
    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>, BrokerError> {
        self.request(|reply| MeshRequest::ListenAddrs { reply }).await
    }

    /// Queues this peer has declared for consuming, sorted.
    pub async fn mailbox_queues(&self) -> Result<Vec<String>, BrokerError> {
        self.request(|reply| MeshRequest::Mailboxes { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, BrokerError>>) -> MeshRequest,
    ) -> Result<T, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(make(reply))
            .map_err(|_| BrokerError::Closed)?;
        rx.await.map_err(|_| BrokerError::Closed)?
    }
}

#[async_trait]
impl Broker for MeshBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let queue = queue.to_string();
        self.request(|reply| MeshRequest::Declare { queue, reply }).await
    }

    async fn declare_outbound(&self, _queue: &str) -> Result<(), BrokerError> {
        if self.requests.is_closed() {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let queue = queue.to_string();
        self.request(|reply| MeshRequest::Publish { queue, body, reply })
            .await
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        let queue = queue.to_string();
        self.request(|reply| MeshRequest::Consume { queue, reply }).await
    }
}

fn declare(
    swarm: &mut Swarm<MeshBehaviour>,
    mailboxes: &mut HashMap<gossipsub::TopicHash, Mailbox>,
    queue: &str,
) -> Result<(), BrokerError> {
    let topic = gossipsub::IdentTopic::new(queue);
    swarm
        .behaviour_mut()
        .gossipsub
        .subscribe(&topic)
        .map_err(|e| BrokerError::Declare {
            queue: queue.to_string(),
            reason: e.to_string(),
        })?;
    mailboxes.entry(topic.hash()).or_insert_with(|| {
        let (tx, rx) = mpsc::unbounded_channel();
        Mailbox {
            queue: queue.to_string(),
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    });
    Ok(())
}

/// Publish `body`, holding it when no peer has subscribed to the topic yet.
/// Held messages go out first so a queue keeps its publish order.
fn publish(
    swarm: &mut Swarm<MeshBehaviour>,
    held: &mut HashMap<gossipsub::TopicHash, VecDeque<Vec<u8>>>,
    queue: String,
    body: Vec<u8>,
) -> Result<(), BrokerError> {
    let topic = gossipsub::IdentTopic::new(queue.as_str());
    let hash = topic.hash();
    flush_held(swarm, held, &hash);

    let waiting = held.get(&hash).map_or(0, VecDeque::len);
    if waiting == 0 {
        match swarm.behaviour_mut().gossipsub.publish(topic, body.clone()) {
            Ok(_) => return Ok(()),
            Err(gossipsub::PublishError::InsufficientPeers) => {}
            Err(e) => {
                return Err(BrokerError::Publish {
                    queue,
                    reason: e.to_string(),
                })
            }
        }
    }
    if waiting >= MAX_HELD_PER_QUEUE {
        return Err(BrokerError::Publish {
            queue,
            reason: format!("no subscriber and {MAX_HELD_PER_QUEUE} messages already held"),
        });
    }
    debug!(queue=%queue, held=waiting + 1, "no subscriber yet; holding message");
    held.entry(hash).or_default().push_back(body);
    Ok(())
}

fn flush_held(
    swarm: &mut Swarm<MeshBehaviour>,
    held: &mut HashMap<gossipsub::TopicHash, VecDeque<Vec<u8>>>,
    topic: &gossipsub::TopicHash,
) {
    let Some(queue) = held.get_mut(topic) else {
        return;
    };
    while let Some(body) = queue.pop_front() {
        match swarm.behaviour_mut().gossipsub.publish(topic.clone(), body.clone()) {
            Ok(_) => {}
            Err(gossipsub::PublishError::InsufficientPeers) => {
                queue.push_front(body);
                return;
            }
            Err(e) => warn!(topic=%topic, error=%e, "dropping held message"),
        }
    }
    held.remove(topic);
    info!(topic=%topic, "held messages delivered");
}

async fn drive(mut swarm: Swarm<MeshBehaviour>, mut requests: mpsc::UnboundedReceiver<MeshRequest>) {
    let mut mailboxes: HashMap<gossipsub::TopicHash, Mailbox> = HashMap::new();
    let mut held: HashMap<gossipsub::TopicHash, VecDeque<Vec<u8>>> = HashMap::new();
    loop {
        tokio::select! {
            req = requests.recv() => {
                let Some(req) = req else {
                    debug!("mesh broker handle dropped; stopping swarm");
                    return;
                };
                match req {
                    MeshRequest::Declare { queue, reply } => {
                        let _ = reply.send(declare(&mut swarm, &mut mailboxes, &queue));
                    }
                    MeshRequest::Publish { queue, body, reply } => {
                        let _ = reply.send(publish(&mut swarm, &mut held, queue, body));
                    }
                    MeshRequest::Consume { queue, reply } => {
                        let res = declare(&mut swarm, &mut mailboxes, &queue).and_then(|_| {
                            let topic = gossipsub::IdentTopic::new(queue.as_str());
                            mailboxes
                                .get(&topic.hash())
                                .map(|mb| Consumer::new(mb.queue.clone(), mb.rx.clone()))
                                .ok_or_else(|| BrokerError::UnknownQueue(queue.clone()))
                        });
                        let _ = reply.send(res);
                    }
                    MeshRequest::ListenAddrs { reply } => {
                        let _ = reply.send(Ok(swarm.listeners().cloned().collect()));
                    }
                    MeshRequest::Mailboxes { reply } => {
                        let mut names: Vec<String> =
                            mailboxes.values().map(|mb| mb.queue.clone()).collect();
                        names.sort();
                        let _ = reply.send(Ok(names));
                    }
                }
            }
            event = swarm.select_next_some() => match event {
                SwarmEvent::Behaviour(MeshBehaviourEvent::Gossipsub(ev)) => {
                    match ev {
                        gossipsub::Event::Message { message, .. } => {
                            match mailboxes.get(&message.topic) {
                                Some(mb) => {
                                    if mb.tx.send(message.data).is_err() {
                                        warn!(queue=%mb.queue, "mailbox closed; dropping message");
                                    }
                                }
                                None => debug!(topic=%message.topic, "message on undeclared topic"),
                            }
                        }
                        gossipsub::Event::Subscribed { peer_id, topic } => {
                            debug!(peer=%peer_id, topic=%topic, "peer subscribed");
                            flush_held(&mut swarm, &mut held, &topic);
                        }
                        _ => {}
                    }
                }
                SwarmEvent::Behaviour(MeshBehaviourEvent::Mdns(ev)) => match ev {
                    mdns::Event::Discovered(list) => {
                        for (peer, _addr) in list {
                            swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer);
                        }
                    }
                    mdns::Event::Expired(list) => {
                        for (peer, _addr) in list {
                            swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer);
                        }
                    }
                },
                SwarmEvent::NewListenAddr { address, .. } => {
                    let local = *swarm.local_peer_id();
                    info!(address=%format!("{address}/p2p/{local}"), "mesh listening");
                }
                SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                    swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                    debug!(peer=%peer_id, "mesh peer connected");
                }
                SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                    warn!(peer=?peer_id, error=%error, "mesh dial failed");
                }
                _ => {}
            }
        }
    }
}
