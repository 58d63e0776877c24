use std::time::Duration;

use anyhow::Context;
use ble_echo_tester::client::sort_by_signal;
use ble_echo_tester::{EchoClient, EchoConfig, EchoEvent};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Exercise a BLE echo peripheral: scan, connect, write, print the replies
#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Advertised name of the echo peripheral
    #[arg(long, env = "BLE_ECHO_TARGET_NAME", default_value = ble_echo_tester::ble::DEFAULT_TARGET_NAME)]
    target_name: String,

    /// Advertised service UUID of the echo peripheral
    #[arg(long, env = "BLE_ECHO_SERVICE_UUID", default_value_t = ble_echo_tester::ble::UART_SERVICE_UUID)]
    service_uuid: Uuid,

    /// Characteristic the message is written to
    #[arg(long, env = "BLE_ECHO_WRITE_UUID", default_value_t = ble_echo_tester::ble::UART_RX_UUID)]
    write_uuid: Uuid,

    /// Characteristic replies are notified on
    #[arg(long, env = "BLE_ECHO_NOTIFY_UUID", default_value_t = ble_echo_tester::ble::UART_TX_UUID)]
    notify_uuid: Uuid,

    /// Seconds to scan for the peripheral
    #[arg(long, env = "BLE_ECHO_SCAN_TIMEOUT", default_value = "10", value_parser = parse_seconds)]
    scan_timeout: Duration,

    /// Seconds to list nearby devices when the peripheral is missing
    #[arg(long, default_value = "6", value_parser = parse_seconds)]
    fallback_scan_timeout: Duration,

    /// Seconds to wait between subscribing and writing
    #[arg(long, default_value = "0.3", value_parser = parse_seconds)]
    settle_delay: Duration,

    /// Seconds to collect replies after writing
    #[arg(long, default_value = "2", value_parser = parse_seconds)]
    observe_delay: Duration,

    /// Text written to the peripheral
    #[arg(long, env = "BLE_ECHO_MESSAGE", default_value = "ping")]
    message: String,

    /// MTU to request after connecting (0 skips the request)
    #[arg(long, default_value_t = 247)]
    mtu: u16,

    /// Do not check the remote service table for the RX/TX characteristics
    #[arg(long)]
    no_verify: bool,

    /// More logging on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect once, write the message, print the replies (default)
    Echo,
    /// List every advertising peripheral without connecting
    Scan {
        /// Seconds to scan
        #[arg(long, default_value = "10", value_parser = parse_seconds)]
        timeout: Duration,
    },
    /// Connect and disconnect repeatedly to check the peripheral advertises again
    Reconnect {
        /// Number of connect/disconnect cycles
        #[arg(long, default_value_t = 3)]
        attempts: u32,
        /// Seconds to wait between cycles
        #[arg(long, default_value = "2", value_parser = parse_seconds)]
        delay: Duration,
    },
}

impl Args {
    fn config(&self) -> EchoConfig {
        let mut config = EchoConfig {
            target_name: self.target_name.clone(),
            service_uuid: self.service_uuid,
            write_uuid: self.write_uuid,
            notify_uuid: self.notify_uuid,
            scan_timeout: self.scan_timeout,
            fallback_scan_timeout: self.fallback_scan_timeout,
            settle_delay: self.settle_delay,
            observe_delay: self.observe_delay,
            message: self.message.clone(),
            mtu: (self.mtu > 0).then_some(self.mtu),
            verify_characteristics: !self.no_verify,
            ..Default::default()
        };
        if let Some(Commands::Reconnect { attempts, delay }) = &self.command {
            config.reconnect_attempts = *attempts;
            config.reconnect_delay = *delay;
        }
        config
    }
}

/// How long an interrupted run gets to close its link before exiting.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value
        .parse()
        .map_err(|_| format!("`{}` is not a number of seconds", value))?;
    Duration::try_from_secs_f64(seconds).map_err(|e| e.to_string())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ble_echo_tester={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Print progress events until the client goes away.
fn spawn_printer(mut events: broadcast::Receiver<EchoEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{}", event),
                Err(RecvError::Lagged(skipped)) => eprintln!("({} events not shown)", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = args.config();
    let client = EchoClient::new(config)
        .await
        .context("Failed to set up the Bluetooth client")?;
    let printer = spawn_printer(client.subscribe());

    let mut command = Box::pin(async {
        match &args.command {
            None | Some(Commands::Echo) => client.run().await.map(|report| {
                format!(
                    "Done. {} replies, echoed: {}",
                    report.replies.len(),
                    if report.echoed() { "yes" } else { "no" }
                )
            }),
            Some(Commands::Scan { timeout }) => client.scan_nearby(*timeout).await.map(|found| {
                let found = sort_by_signal(found);
                let mut out = format!("\nFound {} devices:\n", found.len());
                for peripheral in found {
                    out.push_str(&format!(
                        "Name: {}\nAddress: {}\n",
                        peripheral.name.as_deref().unwrap_or("Unknown"),
                        peripheral.address
                    ));
                    if let Some(rssi) = peripheral.rssi {
                        out.push_str(&format!("RSSI: {} dBm\n", rssi));
                    }
                    if !peripheral.service_uuids.is_empty() {
                        out.push_str(&format!("Services: {}\n", peripheral.service_uuids.join(", ")));
                    }
                    out.push_str(&"-".repeat(50));
                    out.push('\n');
                }
                out
            }),
            Some(Commands::Reconnect { .. }) => client
                .probe_reconnection()
                .await
                .into_result()
                .map(|attempts| format!("Reconnection verified over {} attempts.", attempts)),
        }
    });

    let outcome = tokio::select! {
        result = &mut command => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    // Dropping an unfinished command hands any open link to a background close.
    drop(command);
    if outcome.is_none() {
        eprintln!("Interrupted, closing the connection...");
        tokio::time::sleep(CLOSE_GRACE).await;
    }

    // Dropping the client closes the event channel so the printer drains and exits.
    drop(client);
    let _ = printer.await;

    let result = outcome.context("Interrupted")?;
    let summary = result.with_context(|| {
        format!(
            "Echo test failed; make sure the peripheral is powered and advertising as `{}`",
            args.target_name
        )
    })?;
    println!("{}", summary);

    Ok(())
}
