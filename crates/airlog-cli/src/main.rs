//! CLI for airlog: temperature, humidity and CO2 on a single board computer.

mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "airlog")]
#[command(about = "airlog: poll, persist and stream room-air readings")]
#[command(version = airlog_core::VERSION)]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, env = "AIRLOG_DB", default_value = "sensor_data.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Which sensor to read and where it is attached.
#[derive(Args, Debug, Clone)]
struct SensorArgs {
    /// Sensor backend: hardware (AHT20 + MH-Z19) or simulated
    #[arg(long, env = "AIRLOG_SENSOR", default_value = "hardware", value_parser = ["hardware", "simulated"])]
    sensor: String,

    /// I2C bus device for the AHT20
    #[arg(long, env = "AIRLOG_I2C_BUS", default_value = "/dev/i2c-1")]
    i2c_bus: PathBuf,

    /// Serial port for the MH-Z19
    #[arg(long, env = "AIRLOG_SERIAL", default_value = "/dev/serial0")]
    serial: PathBuf,

    /// Fraction of simulated reads that fail (0.0-1.0)
    #[arg(long, env = "AIRLOG_SIM_FAILURE_RATE", default_value = "0.0")]
    sim_failure_rate: f64,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collector: poll the sensor, persist readings and serve the
    /// dashboard, query API, /metrics and the /ws live stream
    Serve {
        /// Bind address
        #[arg(long, env = "AIRLOG_HOST", default_value = "0.0.0.0")]
        host: String,

        /// Port
        #[arg(long, env = "AIRLOG_PORT", default_value = "5000")]
        port: u16,

        /// Polling interval in seconds
        #[arg(long, env = "AIRLOG_INTERVAL_SECS", default_value = "2.0")]
        interval: f64,

        /// Directory with index.html and app.js
        #[arg(long, env = "AIRLOG_STATIC_DIR", default_value = "static")]
        static_dir: PathBuf,

        #[command(flatten)]
        sensor: SensorArgs,
    },

    /// Initialize the sensor and print readings without touching the database
    Sample {
        /// Number of readings to take
        #[arg(long, default_value = "1")]
        count: usize,

        #[command(flatten)]
        sensor: SensorArgs,
    },

    /// Print the most recent stored reading
    Latest,

    /// Print stored readings, most recent first
    History {
        /// Number of readings (1-1000)
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Create the readings table if it does not exist
    InitDb,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            interval,
            static_dir,
            sensor,
        } => commands::serve::run(commands::serve::ServeCommandConfig {
            db: &cli.db,
            host: &host,
            port,
            interval_secs: interval,
            static_dir: &static_dir,
            sensor: commands::SensorSpec::from(&sensor),
        }),
        Commands::Sample { count, sensor } => {
            commands::sample::run(commands::SensorSpec::from(&sensor), count)
        }
        Commands::Latest => commands::query::latest(&cli.db),
        Commands::History { limit } => commands::query::history(&cli.db, limit),
        Commands::InitDb => commands::init_db::run(&cli.db),
    }
}

impl From<&SensorArgs> for commands::SensorSpec {
    fn from(args: &SensorArgs) -> Self {
        commands::SensorSpec {
            kind: args.sensor.clone(),
            i2c_bus: args.i2c_bus.clone(),
            serial: args.serial.clone(),
            failure_rate: args.sim_failure_rate,
        }
    }
}
