use std::time::Duration;

use airlog_core::{RetryPolicy, initialize_with_retry};

pub fn run(spec: super::SensorSpec, count: usize) {
    let mut sensor = match super::make_sensor(&spec) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let info = sensor.info().clone();
    println!("Sampling: {}", info.name);
    println!("  {}", info.description);
    println!();

    if let Err(e) = initialize_with_retry(&mut sensor, &RetryPolicy::default()) {
        super::report_init_error(&e);
        std::process::exit(1);
    }

    let mut failures = 0;
    for i in 0..count {
        if i > 0 {
            std::thread::sleep(Duration::from_secs(2));
        }
        match sensor.read() {
            Ok(r) => println!(
                "  Temperature: {:.2}°C, Humidity: {:.2}%, CO2: {} ppm",
                r.temperature, r.humidity, r.co2
            ),
            Err(e) => {
                failures += 1;
                println!("  Read failed: {e}");
            }
        }
    }

    if count > 0 && failures == count {
        std::process::exit(1);
    }
}
