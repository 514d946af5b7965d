//! Exercise the transport protocol on an in-process virtual bus
//!
//! Spins up a handful of nodes, sends one message from the first node, and
//! prints every frame that crossed the bus as candump lines on stdout (or as
//! CSV rows with --csv), followed by each reassembled message.
use std::io::{BufWriter, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use cantp::{CanFrame, CanMessage, Engine, Node, NodeHandler, VirtualBus, frame};
use clap::Parser;

#[derive(Debug, Parser)]
#[clap(version, verbatim_doc_comment)]
struct Args {
    #[clap(short, long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,

    /// Number of nodes on the bus (a silent monitor is added on top)
    #[clap(short, long, default_value_t = 2)]
    nodes: u8,

    /// Message size in bytes (1..=1785); more than 8 engages the transport protocol
    #[clap(short, long, default_value_t = 64)]
    size: usize,

    /// Send connection-mode (RTS/CTS) to the second node instead of broadcast
    #[clap(long)]
    cmdt: bool,

    /// Write the frame trace as CSV to the given path instead of candump lines
    #[clap(long)]
    csv: Option<PathBuf>,
}

/// The simulated interface name used in the trace output
const INTERFACE: &str = "vcan0";

/// Records every frame on the bus without taking part in the traffic
#[derive(Clone)]
struct Monitor {
    bus: VirtualBus,
    rows: Arc<Mutex<Vec<(u64, CanFrame)>>>,
}

impl NodeHandler for Monitor {
    fn filter(&mut self, _: u8, _: &CanFrame) -> bool {
        false
    }

    fn reading(&mut self, frame: &CanFrame) {
        self.rows.lock().unwrap().push((self.bus.now(), *frame));
    }
}

/// Collects the messages a node decoded
#[derive(Clone, Default)]
struct Sink {
    decoded: Arc<Mutex<Vec<(u64, CanMessage)>>>,
    bus: Option<VirtualBus>,
}

impl NodeHandler for Sink {
    fn decode(&mut self, msg: CanMessage) {
        let now = self.bus.as_ref().map_or(0, VirtualBus::now);
        self.decoded.lock().unwrap().push((now, msg));
    }
}

#[derive(serde::Serialize)]
struct TraceRow {
    timestamp: f64,
    interface: &'static str,
    canid: String,
    dlc: usize,
    priority: u8,
    src: String,
    dst: String,
    pgn: String,
    data: String,
}

impl TraceRow {
    fn new(timestamp: u64, frame: &CanFrame) -> Self {
        Self {
            timestamp: timestamp as f64 / 1000.0,
            interface: INTERFACE,
            canid: format!("{:#X}", frame.canid),
            dlc: frame.dlc,
            priority: frame.priority(),
            src: format!("{:#X}", frame.src()),
            dst: format!("{:#X}", frame.dst()),
            pgn: format!("{:#X}", frame.pgn()),
            data: hex::encode_upper(frame.data()),
        }
    }
}

fn main() -> eyre::Result<()> {
    let use_color = std::io::stderr().is_terminal();
    if use_color {
        color_eyre::install()?;
    }

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(args.log_level.into())
        .with_env_var("CANTP_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .init();

    eyre::ensure!(
        (1..=1785).contains(&args.size),
        "message size must be 1..=1785 bytes, got {}",
        args.size
    );
    eyre::ensure!(args.nodes >= 2, "a conversation takes at least 2 nodes");

    let start = Instant::now();

    let bus = VirtualBus::new();
    let mut engine = Engine::new();
    let sink = Sink {
        decoded: Arc::default(),
        bus: Some(bus.clone()),
    };
    let mut ids = Vec::new();
    for i in 0..args.nodes {
        let node = Node::new(
            format!("ecu{i}"),
            i,
            32,
            Box::new(bus.port()),
            Box::new(sink.clone()),
        )?;
        ids.push(engine.register(node));
    }
    let monitor = Monitor {
        bus: bus.clone(),
        rows: Arc::default(),
    };
    engine.register(Node::new(
        "monitor",
        frame::ADDRESS_NULL,
        4,
        Box::new(bus.port()),
        Box::new(monitor.clone()),
    )?);

    let canid = if args.cmdt {
        // Proprietary A, peer-directed to the second node
        frame::assemble(6, cantp::tp::PGN_PROPRIETARY_A, 0x01, 0x00)
    } else {
        // An arbitrary PDU2 group, broadcast
        frame::assemble(6, 0xF004, frame::ADDRESS_GLOBAL, 0x00)
    };
    let payload: Vec<u8> = (0..args.size).map(|i| (i % 251) as u8 + 1).collect();
    // Broadcasts land on every other data node; connection mode only on its peer
    let expected_deliveries = if args.cmdt {
        1
    } else {
        usize::from(args.nodes) - 1
    };

    engine
        .node_mut(ids[0])
        .expect("sender was just registered")
        .send(CanMessage::new(canid, payload))?;

    let mut ticks = 0u32;
    loop {
        bus.advance(5);
        engine.tick();
        ticks += 1;

        let busy = ids.iter().any(|id| engine.node(*id).is_some_and(Node::is_busy));
        let delivered = sink.decoded.lock().unwrap().len();
        if !busy && delivered >= expected_deliveries {
            break;
        }
        eyre::ensure!(ticks < 20_000, "simulation stalled after {ticks} ticks");
    }

    tracing::info!(
        "{} bytes delivered to {expected_deliveries} node(s) in {ticks} ticks ({} ms of bus time)",
        args.size,
        bus.now()
    );

    let rows = monitor.rows.lock().unwrap();
    if let Some(path) = &args.csv {
        let mut writer = csv::Writer::from_path(path)?;
        for (timestamp, frame) in rows.iter() {
            writer.serialize(TraceRow::new(*timestamp, frame))?;
        }
        writer.flush()?;
        tracing::info!("Wrote {} frames to {path:?}", rows.len());
    } else {
        let stdout = std::io::stdout();
        let mut writer = BufWriter::new(stdout.lock());
        for (timestamp, frame) in rows.iter() {
            frame.write(&mut writer, *timestamp as f64 / 1000.0, INTERFACE)?;
        }
        for (timestamp, msg) in sink.decoded.lock().unwrap().iter() {
            msg.write(&mut writer, *timestamp as f64 / 1000.0, INTERFACE)?;
        }
        writer.flush()?;
    }

    tracing::info!("Finished in {:?}", start.elapsed());

    Ok(())
}
