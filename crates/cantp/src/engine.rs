//! The registry of live nodes and the task handler that drives them
use crate::node::Node;

/// Stable identity of a node registered with an [Engine]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

/// Owns every registered [Node] and advances them all on each tick
///
/// The engine is an explicit value rather than process-wide state: create
/// one, register nodes into it, and call [Engine::tick] from a periodic
/// scheduler (nominally every 5 ms). Each tick gives every node one
/// cooperative pass in registration order.
///
/// Nodes must not be deregistered from inside their own callbacks; the
/// registry is iterated while the callbacks run.
#[derive(Default)]
pub struct Engine {
    nodes: Vec<(NodeId, Node)>,
    next_id: u64,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node to the registry
    pub fn register(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        tracing::debug!("[{}] registered as {id:?}", node.name());
        self.nodes.push((id, node));
        id
    }

    /// Remove a node by identity, handing it back to the caller
    ///
    /// Dropping the returned node tears its port down.
    pub fn deregister(&mut self, id: NodeId) -> Option<Node> {
        let index = self.nodes.iter().position(|(node_id, _)| *node_id == id)?;
        let (_, node) = self.nodes.remove(index);
        tracing::debug!("[{}] deregistered", node.name());
        Some(node)
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|(node_id, _)| *node_id == id)
            .map(|(_, node)| node)
    }

    #[must_use]
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes
            .iter_mut()
            .find(|(node_id, _)| *node_id == id)
            .map(|(_, node)| node)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// One pass of the task handler: every node advances its transport
    /// session, drains its TX FIFO, and polls its received frames
    pub fn tick(&mut self) {
        for (_, node) in &mut self.nodes {
            node.task();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vbus::VirtualBus;

    fn node(bus: &VirtualBus, name: &str, address: u8) -> Node {
        Node::new(name, address, 4, Box::new(bus.port()), Box::new(())).unwrap()
    }

    #[test]
    fn test_register_deregister() {
        let bus = VirtualBus::new();
        let mut engine = Engine::new();

        let a = engine.register(node(&bus, "a", 0x00));
        let b = engine.register(node(&bus, "b", 0x01));
        assert_eq!(engine.len(), 2);
        assert_ne!(a, b);

        let removed = engine.deregister(a).unwrap();
        assert_eq!(removed.name(), "a");
        assert_eq!(engine.len(), 1);
        assert!(engine.deregister(a).is_none());

        // Identities stay valid across removals
        assert_eq!(engine.node(b).unwrap().name(), "b");
    }

    #[test]
    fn test_deregistered_node_leaves_the_bus() {
        let bus = VirtualBus::new();
        let mut engine = Engine::new();

        let a = engine.register(node(&bus, "a", 0x00));
        let _b = engine.register(node(&bus, "b", 0x01));
        assert_eq!(bus.ports(), 2);

        drop(engine.deregister(a));
        assert_eq!(bus.ports(), 1);
    }

    #[test]
    fn test_tick_drives_every_node() {
        let bus = VirtualBus::new();
        let mut engine = Engine::new();

        let a = engine.register(node(&bus, "a", 0x00));
        let b = engine.register(node(&bus, "b", 0x01));

        engine
            .node_mut(a)
            .unwrap()
            .send_bytes(0x18F00400, &[0xAA])
            .unwrap();
        engine
            .node_mut(b)
            .unwrap()
            .send_bytes(0x18F00400, &[0xBB])
            .unwrap();
        engine.tick();
        engine.tick();

        assert!(!engine.node(a).unwrap().is_busy());
        assert!(!engine.node(b).unwrap().is_busy());
    }
}
