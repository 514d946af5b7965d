//! End-to-end transport protocol scenarios on the virtual bus
use std::sync::{Arc, Mutex};

use cantp::{
    AbortReason, CanFrame, CanMessage, Engine, Node, NodeHandler, NodeId, SendError, VirtualBus,
};
use pretty_assertions::assert_eq;

/// A payload that never contains 0x00 or 0xFF, so zero fill and pad bytes
/// stand out
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}

/// Everything a node's callbacks observed, stamped with the bus clock
#[derive(Default)]
struct SpyState {
    decoded: Vec<(u64, CanMessage)>,
    timeouts: Vec<(u64, CanMessage)>,
    read: Vec<(u64, CanFrame)>,
    sent: Vec<(u64, CanFrame)>,
}

#[derive(Clone)]
struct Spy {
    bus: VirtualBus,
    state: Arc<Mutex<SpyState>>,
}

impl Spy {
    fn new(bus: &VirtualBus) -> Self {
        Self {
            bus: bus.clone(),
            state: Arc::default(),
        }
    }

    fn decoded(&self) -> Vec<(u64, CanMessage)> {
        self.state.lock().unwrap().decoded.clone()
    }

    fn timeouts(&self) -> Vec<(u64, CanMessage)> {
        self.state.lock().unwrap().timeouts.clone()
    }

    /// Frames this node read from the bus, filtered to the given PGN
    fn read_with_pgn(&self, pgn: u32) -> Vec<(u64, CanFrame)> {
        self.state
            .lock()
            .unwrap()
            .read
            .iter()
            .filter(|(_, frame)| frame.pgn() == pgn)
            .copied()
            .collect()
    }

    /// Frames this node transmitted, filtered by TP.CM control byte
    fn sent_with_control(&self, control: u8) -> Vec<(u64, CanFrame)> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(_, frame)| frame.pgn() == cantp::tp::PGN_TP_CM && frame.data()[0] == control)
            .copied()
            .collect()
    }

    fn sent(&self) -> Vec<(u64, CanFrame)> {
        self.state.lock().unwrap().sent.clone()
    }
}

impl NodeHandler for Spy {
    fn decode(&mut self, msg: CanMessage) {
        let now = self.bus.now();
        self.state.lock().unwrap().decoded.push((now, msg));
    }

    fn timeout(&mut self, msg: CanMessage) {
        let now = self.bus.now();
        self.state.lock().unwrap().timeouts.push((now, msg));
    }

    fn reading(&mut self, frame: &CanFrame) {
        let now = self.bus.now();
        self.state.lock().unwrap().read.push((now, *frame));
    }

    fn sending(&mut self, frame: &CanFrame) {
        let now = self.bus.now();
        self.state.lock().unwrap().sent.push((now, *frame));
    }
}

struct Net {
    bus: VirtualBus,
    engine: Engine,
}

impl Net {
    /// Advance the bus clock by 5 ms per engine tick
    fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.bus.advance(5);
            self.engine.tick();
        }
    }

    /// Tick until every listed node is out of its transport session
    fn run_until_idle(&mut self, ids: &[NodeId]) {
        for _ in 0..10_000 {
            self.bus.advance(5);
            self.engine.tick();
            if ids
                .iter()
                .all(|id| !self.engine.node(*id).unwrap().is_busy())
            {
                return;
            }
        }
        panic!("the bus never went idle");
    }
}

fn two_nodes() -> (Net, NodeId, Spy, NodeId, Spy) {
    let bus = VirtualBus::new();
    let mut engine = Engine::new();
    let spy_a = Spy::new(&bus);
    let spy_b = Spy::new(&bus);
    let a = engine.register(
        Node::new("a", 0x00, 32, Box::new(bus.port()), Box::new(spy_a.clone())).unwrap(),
    );
    let b = engine.register(
        Node::new("b", 0x01, 32, Box::new(bus.port()), Box::new(spy_b.clone())).unwrap(),
    );
    (Net { bus, engine }, a, spy_a, b, spy_b)
}

#[test]
fn test_short_send_reaches_peer() {
    let (mut net, a, spy_a, b, spy_b) = two_nodes();
    let payload = [1, 2, 3, 4, 5, 6, 7, 8];

    net.engine
        .node_mut(a)
        .unwrap()
        .send_bytes(0x18F00400, &payload)
        .unwrap();
    net.run(2);

    // Exactly one frame went out, unchanged
    let sent = spy_a.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.canid, 0x18F00400);
    assert_eq!(sent[0].1.data(), &payload);

    let decoded = spy_b.decoded();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].1, CanMessage::new(0x18F00400, payload.to_vec()));

    // Neither session ever left ready
    assert!(!net.engine.node(a).unwrap().is_busy());
    assert!(!net.engine.node(b).unwrap().is_busy());
}

#[test]
fn test_bam_broadcast() {
    let (mut net, a, _spy_a, b, spy_b) = two_nodes();
    let payload = pattern(16);

    net.engine
        .node_mut(a)
        .unwrap()
        .send(CanMessage::new(0x18F00400, payload.clone()))
        .unwrap();
    net.run_until_idle(&[a, b]);

    // One announcement: 16 bytes in 3 packets
    let cms = spy_b.read_with_pgn(cantp::tp::PGN_TP_CM);
    assert_eq!(cms.len(), 1);
    assert_eq!(
        cms[0].1.data(),
        &[0x20, 0x10, 0x00, 0x03, 0xFF, 0x04, 0xF0, 0x00]
    );

    // Three data transfers, in order, at least 50 ms apart
    let dts = spy_b.read_with_pgn(cantp::tp::PGN_TP_DT);
    assert_eq!(dts.len(), 3);
    let seqs: Vec<u8> = dts.iter().map(|(_, frame)| frame.data()[0]).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    for pair in dts.windows(2) {
        assert!(pair[1].0 - pair[0].0 >= 50);
    }

    // The last packet carries two payload bytes and five pads
    assert_eq!(
        dts[2].1.data(),
        &[0x03, payload[14], payload[15], 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
    );

    let decoded = spy_b.decoded();
    assert_eq!(decoded.len(), 1);
    let msg = &decoded[0].1;
    assert_eq!(msg.data, payload);
    assert_eq!(msg.pgn(), 0xF004);
    assert_eq!(msg.src(), 0x00);
}

#[test]
fn test_bam_reaches_every_listener() {
    let bus = VirtualBus::new();
    let mut engine = Engine::new();
    let spies: Vec<Spy> = (0..3).map(|_| Spy::new(&bus)).collect();
    let ids: Vec<NodeId> = spies
        .iter()
        .enumerate()
        .map(|(i, spy)| {
            engine.register(
                Node::new(
                    format!("ecu{i}"),
                    i as u8,
                    32,
                    Box::new(bus.port()),
                    Box::new(spy.clone()),
                )
                .unwrap(),
            )
        })
        .collect();
    let mut net = Net { bus, engine };

    let payload = pattern(100);
    net.engine
        .node_mut(ids[0])
        .unwrap()
        .send(CanMessage::new(0x18F00400, payload.clone()))
        .unwrap();
    net.run_until_idle(&ids);

    assert!(spies[0].decoded().is_empty());
    for spy in &spies[1..] {
        let decoded = spy.decoded();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].1.data, payload);
    }
}

#[test]
fn test_cmdt_peer_transfer() {
    let (mut net, a, spy_a, b, spy_b) = two_nodes();
    let payload = pattern(16);

    net.engine
        .node_mut(a)
        .unwrap()
        .send(CanMessage::new(0x18E00100, payload.clone()))
        .unwrap();
    net.run_until_idle(&[a, b]);

    // The handshake: RTS from a, CTS then ACK from b
    let rts = spy_a.sent_with_control(0x10);
    assert_eq!(rts.len(), 1);
    assert_eq!(
        rts[0].1.data(),
        &[0x10, 0x10, 0x00, 0x03, 0xFF, 0x00, 0xE0, 0x00]
    );

    let cts = spy_b.sent_with_control(0x11);
    assert_eq!(cts.len(), 1);
    assert_eq!(
        cts[0].1.data(),
        &[0x11, 0x03, 0x01, 0xFF, 0xFF, 0x00, 0xE0, 0x00]
    );

    let dts = spy_b.read_with_pgn(cantp::tp::PGN_TP_DT);
    assert_eq!(dts.len(), 3);

    let ack = spy_b.sent_with_control(0x13);
    assert_eq!(ack.len(), 1);
    assert_eq!(
        ack[0].1.data(),
        &[0x13, 0x10, 0x00, 0x03, 0xFF, 0x00, 0xE0, 0x00]
    );

    let decoded = spy_b.decoded();
    assert_eq!(decoded.len(), 1);
    let msg = &decoded[0].1;
    assert_eq!(msg.data, payload);
    assert_eq!(msg.pgn(), 0xE000);
    assert_eq!(msg.src(), 0x00);
    assert_eq!(msg.dst(), 0x01);

    assert!(!net.engine.node(a).unwrap().is_busy());
    assert!(!net.engine.node(b).unwrap().is_busy());
}

#[test]
fn test_cmdt_max_size_uses_cts_windows() {
    let (mut net, a, _spy_a, b, spy_b) = two_nodes();
    let payload = pattern(1785);

    net.engine
        .node_mut(a)
        .unwrap()
        .send(CanMessage::new(0x18E00100, payload.clone()))
        .unwrap();
    net.run_until_idle(&[a, b]);

    // 255 packets granted in windows of 4: 63 full windows and a final 3
    let dts = spy_b.read_with_pgn(cantp::tp::PGN_TP_DT);
    assert_eq!(dts.len(), 255);
    let seqs: Vec<u8> = dts.iter().map(|(_, frame)| frame.data()[0]).collect();
    let expected_seqs: Vec<u8> = (1..=255).collect();
    assert_eq!(seqs, expected_seqs);

    let cts = spy_b.sent_with_control(0x11);
    assert_eq!(cts.len(), 64);
    for (_, frame) in &cts[..63] {
        assert_eq!(frame.data()[1], 4);
    }
    assert_eq!(cts[63].1.data()[1], 3);
    assert_eq!(cts[63].1.data()[2], 253);

    // 1785 = 255 * 7 exactly: the last packet is full, with no padding
    assert_eq!(&dts[254].1.data()[1..], &payload[1778..]);

    let ack = spy_b.sent_with_control(0x13);
    assert_eq!(ack.len(), 1);
    assert_eq!(
        ack[0].1.data(),
        &[0x13, 0xF9, 0x06, 0xFF, 0xFF, 0x00, 0xE0, 0x00]
    );

    let decoded = spy_b.decoded();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].1.data, payload);
}

#[test]
fn test_cmdt_times_out_without_a_peer() {
    let (mut net, a, spy_a, _b, spy_b) = two_nodes();
    let payload = pattern(16);

    // Nobody is listening at 0x05
    net.engine
        .node_mut(a)
        .unwrap()
        .send(CanMessage::new(0x18E00500, payload.clone()))
        .unwrap();
    // T3 = 1250 ms at 5 ms per tick
    net.run(260);

    let timeouts = spy_a.timeouts();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].1, CanMessage::new(0x18E00500, payload));
    assert!(!net.engine.node(a).unwrap().is_busy());

    // The other node never saw anything worth processing
    assert!(spy_b.decoded().is_empty());
    assert!(spy_b.timeouts().is_empty());

    // And the sender is usable again
    net.engine
        .node_mut(a)
        .unwrap()
        .send_bytes(0x18F00400, &[0xAA])
        .unwrap();
}

#[test]
fn test_busy_sender_rejects_until_complete() {
    let (mut net, a, _spy_a, b, _spy_b) = two_nodes();

    net.engine
        .node_mut(a)
        .unwrap()
        .send(CanMessage::new(0x18E00100, pattern(64)))
        .unwrap();
    net.run(1);

    assert_eq!(
        net.engine
            .node_mut(a)
            .unwrap()
            .send_bytes(0x18F00400, &[0xAA]),
        Err(SendError::Busy)
    );

    net.run_until_idle(&[a, b]);
    net.engine
        .node_mut(a)
        .unwrap()
        .send_bytes(0x18F00400, &[0xAA])
        .unwrap();
}

#[test]
fn test_receiver_abort_cancels_the_transfer() {
    let (mut net, a, spy_a, b, spy_b) = two_nodes();

    net.engine
        .node_mut(a)
        .unwrap()
        .send(CanMessage::new(0x18E00100, pattern(64)))
        .unwrap();
    // One tick: the RTS is out and the receiver has opened its session
    net.run(1);
    assert!(net.engine.node(b).unwrap().is_busy());

    assert!(
        net.engine
            .node_mut(b)
            .unwrap()
            .abort(AbortReason::SystemResources)
    );
    net.run(5);

    // The abort frame tears the sender down without a timeout
    assert!(!net.engine.node(a).unwrap().is_busy());
    assert!(!net.engine.node(b).unwrap().is_busy());
    assert!(spy_a.timeouts().is_empty());
    assert!(spy_b.decoded().is_empty());

    net.engine
        .node_mut(a)
        .unwrap()
        .send_bytes(0x18F00400, &[0xAA])
        .unwrap();
}
