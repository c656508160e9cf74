//! Prometheus metrics owned by one engine instance

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};

/// Engine metrics
pub struct EngineMetrics {
    registry: Registry,

    // Counters
    pub handshakes: IntCounter,
    pub handshake_failures: IntCounter,
    pub frames_received: IntCounter,
    pub frames_sent: IntCounter,
    pub evictions: IntCounter,

    // Gauges
    pub active_connections: IntGauge,

    // Histograms
    pub frame_size: Histogram,
}

impl EngineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let handshakes = IntCounter::with_opts(Opts::new(
            "edgews_handshakes_total",
            "Total number of completed handshakes",
        ))?;

        let handshake_failures = IntCounter::with_opts(Opts::new(
            "edgews_handshake_failures_total",
            "Total number of rejected handshakes",
        ))?;

        let frames_received = IntCounter::with_opts(Opts::new(
            "edgews_frames_received_total",
            "Total number of frames decoded",
        ))?;

        let frames_sent = IntCounter::with_opts(Opts::new(
            "edgews_frames_sent_total",
            "Total number of frames written",
        ))?;

        let evictions = IntCounter::with_opts(Opts::new(
            "edgews_evictions_total",
            "Connections closed by the idle sweep",
        ))?;

        let active_connections = IntGauge::with_opts(Opts::new(
            "edgews_active_connections",
            "Number of open connections",
        ))?;

        let frame_size = Histogram::with_opts(
            HistogramOpts::new("edgews_frame_size_bytes", "Inbound frame payload size in bytes")
                .buckets(vec![64.0, 256.0, 512.0, 1024.0, 4096.0, 8192.0, 16384.0]),
        )?;

        registry.register(Box::new(handshakes.clone()))?;
        registry.register(Box::new(handshake_failures.clone()))?;
        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(frames_sent.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(frame_size.clone()))?;

        Ok(Self {
            registry,
            handshakes,
            handshake_failures,
            frames_received,
            frames_sent,
            evictions,
            active_connections,
            frame_size,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every series
    pub fn encode_text(&self) -> prometheus::Result<Vec<u8>> {
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
