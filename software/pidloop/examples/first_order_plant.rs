//! A 200Hz position loop around a simulated first-order plant.
//!
//! Demonstrated here:
//!   * Setting up a controller from a stored configuration
//!   * Logging to a file
//!   * Live tuning through a parameter table
//!   * Waiting for the loop to settle on target

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pidloop::mirror::{MemoryTable, ParamValue, Parameter};
use pidloop::*;

/// Plant whose velocity lags the commanded output
#[derive(Default)]
struct Plant {
    position: f64,
    velocity: f64,
}

impl Plant {
    fn apply(&mut self, u: f64, dt: f64) {
        let tau = 0.1;
        self.velocity += (u - self.velocity) * dt / tau;
        self.position += self.velocity * dt;
    }
}

fn main() {
    let log = logging::init_logging(&logging::LogSettings {
        dir: std::env::temp_dir(),
        name: "first_order_plant".into(),
        ..Default::default()
    })
    .unwrap();
    println!("Logging to {:?}", log.log_path());

    // Store and reload the tunables (for demonstration purposes)
    let cfg = PidConfig {
        kp: 2.0,
        ki: 0.01,
        kd: 0.5,
        period_s: 0.005, // 200 Hz
        output_range: (-1.0, 1.0),
        tolerance: Some(Tolerance::Absolute(0.02)),
        tolerance_buffer: NonZeroUsize::new(20).unwrap(),
        ..Default::default()
    };
    let cfg_path = std::env::temp_dir().join("first_order_plant.json");
    cfg.save(&cfg_path).unwrap();
    let cfg = PidConfig::load(&cfg_path).unwrap();

    // Connect the plant
    let plant = Arc::new(Mutex::new(Plant::default()));
    let p = plant.clone();
    let source = FnSource::new(move || p.lock().unwrap().position);
    let p = plant.clone();
    let dt = cfg.period_s;
    let sink = FnSink::new(move |u| p.lock().unwrap().apply(u, dt));

    let ctrl = PidController::from_config(&cfg, source, sink).unwrap();
    let table = Arc::new(MemoryTable::new());
    ctrl.init_table(Some(table.clone()));

    // Run to the first target
    ctrl.set_setpoint(1.0);
    ctrl.enable();
    wait_on_target(&ctrl);
    println!("Reached {:.3}", plant.lock().unwrap().position);

    // Retune and move from the "dashboard", watching every cycle
    log.set_filter("info,pidloop=trace").unwrap();
    table.put_remote(Parameter::P, ParamValue::Number(1.0));
    table.put_remote(Parameter::Setpoint, ParamValue::Number(-0.5));
    wait_on_target(&ctrl);
    println!("Reached {:.3}", plant.lock().unwrap().position);

    println!("{}", ctrl.config().to_json().unwrap());
    ctrl.free();
}

fn wait_on_target(ctrl: &PidController) {
    for _ in 0..2000 {
        std::thread::sleep(Duration::from_millis(5));
        if ctrl.is_avg_error_valid() && ctrl.on_target().unwrap() {
            return;
        }
    }
    println!("Timed out with error {:.3}", ctrl.avg_error());
}
