//! Hinted-handoff telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct HandoffInstruments {
    enqueue_requests: Counter<u64>,
    enqueue_points: Counter<u64>,
    enqueue_bytes: Counter<u64>,
    replay_requests: Counter<u64>,
    replay_points: Counter<u64>,
    replay_failures: Counter<u64>,
    evicted_segments: Counter<u64>,
    purged_segments: Counter<u64>,
}

fn instruments() -> &'static HandoffInstruments {
    static INSTRUMENTS: OnceLock<HandoffInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("driftq.handoff");
        HandoffInstruments {
            enqueue_requests: meter
                .u64_counter("driftq.handoff.enqueue.requests")
                .with_description("Hinted writes accepted into a node queue")
                .init(),
            enqueue_points: meter
                .u64_counter("driftq.handoff.enqueue.points")
                .with_description("Points carried by accepted hinted writes")
                .init(),
            enqueue_bytes: meter
                .u64_counter("driftq.handoff.enqueue.bytes")
                .with_description("Block bytes appended to node queues")
                .with_unit("By")
                .init(),
            replay_requests: meter
                .u64_counter("driftq.handoff.replay.requests")
                .with_description("Blocks successfully replayed to a target node")
                .init(),
            replay_points: meter
                .u64_counter("driftq.handoff.replay.points")
                .with_description("Points successfully replayed to a target node")
                .init(),
            replay_failures: meter
                .u64_counter("driftq.handoff.replay.failures")
                .with_description("Replay failures by reason")
                .init(),
            evicted_segments: meter
                .u64_counter("driftq.handoff.queue.evicted_segments")
                .with_description("Head segments dropped by max-size eviction")
                .init(),
            purged_segments: meter
                .u64_counter("driftq.handoff.queue.purged_segments")
                .with_description("Segments deleted by age-based purge")
                .init(),
        }
    })
}

pub fn record_enqueue(points: u64, bytes: u64) {
    let i = instruments();
    i.enqueue_requests.add(1, &[]);
    i.enqueue_points.add(points, &[]);
    i.enqueue_bytes.add(bytes, &[]);
}

pub fn record_replay(points: u64) {
    let i = instruments();
    i.replay_requests.add(1, &[]);
    i.replay_points.add(points, &[]);
}

pub fn record_replay_failure(reason: &'static str) {
    instruments()
        .replay_failures
        .add(1, &[KeyValue::new("reason", reason)]);
}

pub fn record_evicted_segments(count: u64) {
    if count > 0 {
        instruments().evicted_segments.add(count, &[]);
    }
}

pub fn record_purged_segments(count: u64) {
    if count > 0 {
        instruments().purged_segments.add(count, &[]);
    }
}
