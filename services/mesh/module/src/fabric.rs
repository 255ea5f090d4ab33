//! In-memory link layer connecting simulated nodes.
//!
//! The fabric stands in for the BLE radio: a node opens a link through its
//! [`FabricPort`], the link comes up on the next [`LinkFabric::poll`] if the
//! target device is online, and chunks sent on an up link are delivered on
//! the following poll. Each link accepts `chunk_budget` chunks per poll and
//! reports [`SendResult::Busy`] beyond that.

use bytes::Bytes;
use mesh_session::{LinkHandle, LinkTransport, SendResult, TransportError};
use mesh_wire::BleAddress;
use std::collections::{HashMap, HashSet};
use tracing::trace;

/// Something a node has to be told about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricEvent {
    /// Link established
    LinkUp {
        /// Node the event is for
        node: BleAddress,
        /// Link handle on that node
        link: LinkHandle,
        /// Address of the other end
        peer: BleAddress,
        /// The other end opened the link
        incoming: bool,
    },
    /// Link gone
    LinkDown {
        /// Node the event is for
        node: BleAddress,
        /// Link handle on that node
        link: LinkHandle,
    },
    /// Chunk arrived
    Data {
        /// Node the event is for
        node: BleAddress,
        /// Link it arrived on
        link: LinkHandle,
        /// Raw chunk
        data: Bytes,
    },
}

#[derive(Debug)]
struct FabricLink {
    initiator: BleAddress,
    acceptor: BleAddress,
    up: bool,
    sent_this_round: usize,
}

impl FabricLink {
    fn other_end(&self, node: BleAddress) -> Option<BleAddress> {
        if node == self.initiator {
            Some(self.acceptor)
        } else if node == self.acceptor {
            Some(self.initiator)
        } else {
            None
        }
    }
}

/// Shared medium of all simulated nodes
#[derive(Debug)]
pub struct LinkFabric {
    online: HashSet<BleAddress>,
    links: HashMap<u32, FabricLink>,
    next_link: u32,
    pending: Vec<FabricEvent>,
    chunk_budget: usize,
}

impl Default for LinkFabric {
    fn default() -> Self {
        Self::new(8)
    }
}

impl LinkFabric {
    /// Fabric accepting `chunk_budget` chunks per link and poll
    pub fn new(chunk_budget: usize) -> Self {
        Self {
            online: HashSet::new(),
            links: HashMap::new(),
            next_link: 1,
            pending: Vec::new(),
            chunk_budget,
        }
    }

    /// Make a device reachable
    pub fn add_device(&mut self, address: BleAddress) {
        self.online.insert(address);
    }

    /// Switch a device on or off; switching off drops its links
    pub fn set_online(&mut self, address: BleAddress, online: bool) {
        if online {
            self.online.insert(address);
            return;
        }
        self.online.remove(&address);
        let dropped: Vec<u32> = self
            .links
            .iter()
            .filter(|(_, l)| l.initiator == address || l.acceptor == address)
            .map(|(id, _)| *id)
            .collect();
        for id in dropped {
            self.drop_link(id, Some(address));
        }
    }

    /// Transport view of one device
    pub fn port(&mut self, address: BleAddress) -> FabricPort<'_> {
        FabricPort {
            fabric: self,
            address,
        }
    }

    /// Number of links, up or pending
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Bring up pending links and hand out everything that happened
    pub fn poll(&mut self) -> Vec<FabricEvent> {
        let mut events = std::mem::take(&mut self.pending);
        for (id, link) in self.links.iter_mut() {
            link.sent_this_round = 0;
            if link.up || !self.online.contains(&link.acceptor) {
                continue;
            }
            link.up = true;
            events.push(FabricEvent::LinkUp {
                node: link.initiator,
                link: LinkHandle(*id),
                peer: link.acceptor,
                incoming: false,
            });
            events.push(FabricEvent::LinkUp {
                node: link.acceptor,
                link: LinkHandle(*id),
                peer: link.initiator,
                incoming: true,
            });
        }
        events
    }

    fn drop_link(&mut self, id: u32, closed_by: Option<BleAddress>) {
        let Some(link) = self.links.remove(&id) else {
            return;
        };
        if !link.up {
            return;
        }
        for node in [link.initiator, link.acceptor] {
            if Some(node) != closed_by {
                self.pending.push(FabricEvent::LinkDown {
                    node,
                    link: LinkHandle(id),
                });
            }
        }
        // Chunks still in flight on a dead link are lost
        self.pending.retain(|e| {
            !matches!(e, FabricEvent::Data { link, .. } if link.0 == id)
        });
    }
}

/// One device's access to the fabric
#[derive(Debug)]
pub struct FabricPort<'a> {
    fabric: &'a mut LinkFabric,
    address: BleAddress,
}

impl LinkTransport for FabricPort<'_> {
    fn open_link(&mut self, address: BleAddress) -> Result<LinkHandle, TransportError> {
        if address == self.address {
            return Err(TransportError::Unreachable(address));
        }
        let id = self.fabric.next_link;
        self.fabric.next_link += 1;
        self.fabric.links.insert(
            id,
            FabricLink {
                initiator: self.address,
                acceptor: address,
                up: false,
                sent_this_round: 0,
            },
        );
        trace!("{} opening link {} to {}", self.address, id, address);
        Ok(LinkHandle(id))
    }

    fn send(&mut self, link: LinkHandle, data: &[u8]) -> SendResult {
        let budget = self.fabric.chunk_budget;
        let Some(entry) = self.fabric.links.get_mut(&link.0) else {
            return SendResult::Failed;
        };
        let Some(peer) = entry.other_end(self.address) else {
            return SendResult::Failed;
        };
        if !entry.up {
            return SendResult::Failed;
        }
        if entry.sent_this_round >= budget {
            return SendResult::Busy;
        }
        entry.sent_this_round += 1;
        self.fabric.pending.push(FabricEvent::Data {
            node: peer,
            link,
            data: Bytes::copy_from_slice(data),
        });
        SendResult::Success
    }

    fn close_link(&mut self, link: LinkHandle) {
        let address = self.address;
        self.fabric.drop_link(link.0, Some(address));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: BleAddress = BleAddress([0, 0, 0, 1, 0, 0]);
    const B: BleAddress = BleAddress([0, 0, 0, 2, 0, 0]);

    #[test]
    fn test_link_comes_up_when_peer_online() {
        let mut fabric = LinkFabric::new(2);
        fabric.add_device(A);
        let link = fabric.port(A).open_link(B).unwrap();
        assert!(fabric.poll().is_empty());

        fabric.add_device(B);
        let events = fabric.poll();
        assert_eq!(events.len(), 2);
        assert!(events.contains(&FabricEvent::LinkUp {
            node: B,
            link,
            peer: A,
            incoming: true
        }));
    }

    #[test]
    fn test_send_budget_and_delivery() {
        let mut fabric = LinkFabric::new(2);
        fabric.add_device(A);
        fabric.add_device(B);
        let link = fabric.port(A).open_link(B).unwrap();
        fabric.poll();

        let mut port = fabric.port(A);
        assert_eq!(port.send(link, b"one"), SendResult::Success);
        assert_eq!(port.send(link, b"two"), SendResult::Success);
        assert_eq!(port.send(link, b"three"), SendResult::Busy);

        let events = fabric.poll();
        assert_eq!(
            events[0],
            FabricEvent::Data {
                node: B,
                link,
                data: Bytes::from_static(b"one")
            }
        );
        assert_eq!(fabric.port(B).send(link, b"back"), SendResult::Success);
    }

    #[test]
    fn test_close_notifies_other_end() {
        let mut fabric = LinkFabric::default();
        fabric.add_device(A);
        fabric.add_device(B);
        let link = fabric.port(A).open_link(B).unwrap();
        fabric.poll();
        fabric.port(A).send(link, b"lost");
        fabric.port(A).close_link(link);

        assert_eq!(fabric.poll(), vec![FabricEvent::LinkDown { node: B, link }]);
        assert_eq!(fabric.port(B).send(link, b"x"), SendResult::Failed);
        assert_eq!(fabric.link_count(), 0);
    }

    #[test]
    fn test_switching_off_drops_links() {
        let mut fabric = LinkFabric::default();
        fabric.add_device(A);
        fabric.add_device(B);
        let link = fabric.port(A).open_link(B).unwrap();
        fabric.poll();
        fabric.set_online(B, false);
        assert_eq!(fabric.poll(), vec![FabricEvent::LinkDown { node: A, link }]);
    }
}
