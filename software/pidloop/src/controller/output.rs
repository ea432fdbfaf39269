//! Ordered delivery of values to the output sink.
//!
//! The sink is called with no controller lock held, so a sink may call back
//! into its controller (e.g. disable it) and a slow sink never holds up
//! configuration calls. Every value carries a generation number taken under
//! the state lock; a value older than the last one written is dropped, so the
//! sink sees outputs in the order the state produced them.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tracing::trace;

use pidloop_shared::OutputSink;

use super::lock_or_recover;

/// Predicates for the gate's condvar
#[derive(Default)]
struct SlotState {
    /// Present unless detached or lent out to a writer
    sink: Option<Box<dyn OutputSink>>,
    /// Thread currently inside `OutputSink::write`
    writer: Option<ThreadId>,
    /// Generation of the last value handed to the sink
    written: u64,
    /// Newest value submitted from inside the sink's own `write`
    pending: Option<(u64, f64)>,
    detached: bool,
}

pub(super) struct OutputGate {
    state: Mutex<SlotState>,
    cvar: Condvar,
}

/// Drop-guard to guarantee that waiting deliveries are released
/// even if the sink panics.
struct WriterFinishGuard<'a> {
    gate: &'a OutputGate,
}

impl Drop for WriterFinishGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.gate.lock();
        slot.writer = None;
        self.gate.cvar.notify_all();
    }
}

impl OutputGate {
    pub(super) fn new(sink: Box<dyn OutputSink>) -> Self {
        Self {
            state: Mutex::new(SlotState {
                sink: Some(sink),
                ..Default::default()
            }),
            cvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        lock_or_recover(&self.state, "output")
    }

    /// Hand `value`, numbered `generation`, to the sink.
    ///
    /// Waits while another thread is writing. A call made from inside the
    /// sink's own `write` is queued and written once that call returns.
    pub(super) fn deliver(&self, generation: u64, value: f64) {
        let me = thread::current().id();
        let mut slot = self.lock();
        loop {
            if slot.detached || generation <= slot.written {
                trace!("Dropped superseded output {value}");
                return;
            }
            match slot.writer {
                None => break,
                Some(id) if id == me => {
                    if slot.pending.is_none_or(|(g, _)| g < generation) {
                        slot.pending = Some((generation, value));
                    }
                    return;
                }
                Some(_) => {
                    slot = self
                        .cvar
                        .wait(slot)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }

        let Some(mut sink) = slot.sink.take() else {
            return;
        };
        slot.writer = Some(me);
        let finish = WriterFinishGuard { gate: self };

        let (mut generation, mut value) = (generation, value);
        loop {
            slot.written = generation;
            drop(slot);
            sink.write(value);
            slot = self.lock();

            match slot.pending.take() {
                Some((g, v)) if !slot.detached && g > slot.written => {
                    generation = g;
                    value = v;
                }
                _ => break,
            }
        }

        if !slot.detached {
            slot.sink = Some(sink);
        }
        drop(slot);
        drop(finish);
    }

    /// Drop the sink. Later deliveries do nothing, and a write in progress
    /// is the last one.
    pub(super) fn detach(&self) {
        let mut slot = self.lock();
        slot.detached = true;
        slot.sink = None;
        slot.pending = None;
        self.cvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pidloop_shared::FnSink;
    use std::sync::Arc;
    use std::time::Duration;

    fn recording_gate() -> (Arc<OutputGate>, Arc<Mutex<Vec<f64>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let w = written.clone();
        let gate = OutputGate::new(Box::new(FnSink::new(move |v| w.lock().unwrap().push(v))));
        (Arc::new(gate), written)
    }

    #[test]
    fn superseded_values_are_dropped() {
        let (gate, written) = recording_gate();
        gate.deliver(1, 0.1);
        gate.deliver(3, 0.3);
        gate.deliver(2, 0.2);
        gate.deliver(3, 0.3);
        assert_eq!(*written.lock().unwrap(), vec![0.1, 0.3]);
    }

    #[test]
    fn detached_gate_writes_nothing() {
        let (gate, written) = recording_gate();
        gate.deliver(1, 1.0);
        gate.detach();
        gate.deliver(2, 2.0);
        assert_eq!(*written.lock().unwrap(), vec![1.0]);
    }

    #[test]
    fn write_from_inside_the_sink_follows_the_current_one() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let slot: Arc<Mutex<Option<Arc<OutputGate>>>> = Arc::new(Mutex::new(None));

        let w = written.clone();
        let s = slot.clone();
        let gate = Arc::new(OutputGate::new(Box::new(FnSink::new(move |v| {
            w.lock().unwrap().push(v);
            if v > 0.0 {
                let gate = s.lock().unwrap().clone();
                if let Some(gate) = gate {
                    gate.deliver(5, 0.0);
                    // Older than the queued value
                    gate.deliver(4, -1.0);
                }
            }
        }))));
        *slot.lock().unwrap() = Some(gate.clone());

        gate.deliver(1, 1.0);
        assert_eq!(*written.lock().unwrap(), vec![1.0, 0.0]);

        *slot.lock().unwrap() = None;
    }

    #[test]
    fn concurrent_delivery_waits_for_the_writer() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let (started_tx, started_rx) = crossbeam::channel::bounded(1);
        let w = written.clone();
        let gate = Arc::new(OutputGate::new(Box::new(FnSink::new(move |v| {
            if v > 0.0 {
                let _ = started_tx.try_send(());
                thread::sleep(Duration::from_millis(100));
            }
            w.lock().unwrap().push(v);
        }))));

        let slow = {
            let gate = gate.clone();
            thread::spawn(move || gate.deliver(1, 1.0))
        };
        started_rx.recv().unwrap();
        gate.deliver(2, 0.0);
        slow.join().unwrap();

        assert_eq!(*written.lock().unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn panicking_sink_releases_waiters() {
        let gate = Arc::new(OutputGate::new(Box::new(FnSink::new(|_| panic!("sink failed")))));
        let g = gate.clone();
        assert!(thread::spawn(move || g.deliver(1, 1.0)).join().is_err());

        // The sink went down with the panic; nothing blocks
        gate.deliver(2, 0.0);
    }
}
