//! Controllers running on their own threads against a simulated plant.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pidloop::{FnSink, FnSource, PidController};

/// Integrating plant: each written output moves the position by `gain * u`
#[derive(Default)]
struct Plant {
    position: f64,
    written: Vec<f64>,
}

fn plant_io(
    plant: &Arc<Mutex<Plant>>,
    gain: f64,
) -> (
    FnSource<impl FnMut() -> f64 + Send + 'static>,
    FnSink<impl FnMut(f64) + Send + 'static>,
) {
    let p = plant.clone();
    let source = FnSource::new(move || p.lock().unwrap().position);
    let p = plant.clone();
    let sink = FnSink::new(move |u| {
        let mut plant = p.lock().unwrap();
        plant.position += gain * u;
        plant.written.push(u);
    });
    (source, sink)
}

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn settles_on_target() {
    let plant = Arc::new(Mutex::new(Plant::default()));
    let (source, sink) = plant_io(&plant, 0.05);
    let ctrl = PidController::new(2.0, 0.0, 0.0, source, sink, Duration::from_millis(1)).unwrap();

    ctrl.set_absolute_tolerance(0.05);
    ctrl.set_tolerance_buffer(NonZeroUsize::new(5).unwrap());
    ctrl.set_setpoint(1.0);
    ctrl.enable();

    let settled = wait_for(Duration::from_secs(10), || {
        ctrl.is_avg_error_valid() && ctrl.on_target().unwrap()
    });
    assert!(settled, "controller never reached the setpoint");
    assert!((plant.lock().unwrap().position - 1.0).abs() < 0.1);

    ctrl.free();
}

#[test]
fn concurrent_tuning_keeps_output_bounded() {
    let plant = Arc::new(Mutex::new(Plant::default()));
    let (source, sink) = plant_io(&plant, 0.01);
    let ctrl = PidController::with_feed_forward(
        1.0,
        0.1,
        0.5,
        0.0,
        source,
        sink,
        Duration::from_millis(1),
    )
    .unwrap();
    ctrl.set_output_range(-0.3, 0.6).unwrap();
    ctrl.enable();

    let tuner = {
        let ctrl = ctrl.clone();
        thread::spawn(move || {
            for k in 0..200 {
                ctrl.set_setpoint(((k % 11) as f64 - 5.0) * 3.0);
                ctrl.set_pid(0.5 + (k % 4) as f64, 0.1, 0.5, 0.01).unwrap();
                ctrl.set_continuous(k % 2 == 0);
                thread::sleep(Duration::from_micros(200));
            }
        })
    };
    tuner.join().unwrap();

    assert!(wait_for(Duration::from_secs(10), || {
        plant.lock().unwrap().written.len() > 20
    }));
    ctrl.free();

    let plant = plant.lock().unwrap();
    assert!(plant.written.iter().all(|u| (-0.3..=0.6).contains(u)));
}

#[test]
fn disable_leaves_zero_as_last_output() {
    let plant = Arc::new(Mutex::new(Plant::default()));
    let (source, sink) = plant_io(&plant, 0.0);
    let ctrl = PidController::new(1.0, 0.0, 0.0, source, sink, Duration::from_millis(1)).unwrap();
    ctrl.set_setpoint(0.5);
    ctrl.enable();

    assert!(wait_for(Duration::from_secs(10), || {
        plant.lock().unwrap().written.len() > 5
    }));
    ctrl.disable();

    let count = plant.lock().unwrap().written.len();
    thread::sleep(Duration::from_millis(20));

    let plant = plant.lock().unwrap();
    assert_eq!(plant.written.len(), count);
    assert_eq!(plant.written.last(), Some(&0.0));
    drop(plant);
    ctrl.free();
}

#[test]
fn free_stops_output() {
    let plant = Arc::new(Mutex::new(Plant::default()));
    let (source, sink) = plant_io(&plant, 0.0);
    let ctrl = PidController::new(1.0, 0.0, 0.0, source, sink, Duration::from_millis(1)).unwrap();
    ctrl.set_setpoint(0.25);
    ctrl.enable();

    assert!(wait_for(Duration::from_secs(10), || {
        !plant.lock().unwrap().written.is_empty()
    }));
    ctrl.free();

    // The worker thread has been joined, so nothing more arrives
    let count = plant.lock().unwrap().written.len();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(plant.lock().unwrap().written.len(), count);

    // Freeing again is harmless
    ctrl.free();
    ctrl.disable();
    assert_eq!(plant.lock().unwrap().written.len(), count);
}
