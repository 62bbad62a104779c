use anyhow::Result;
use std::{env, path::PathBuf, time::Duration};
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sprinkler_node::bus::Transport;
use sprinkler_node::clock::MonotonicClock;
use sprinkler_node::config::{self, NodeSettings};
use sprinkler_node::node::{Node, Peripherals};
use sprinkler_node::store::{BaudRate, ConfigStore, FileStorage};

#[cfg(not(any(feature = "sim", feature = "hw")))]
compile_error!("enable the `sim` or `hw` feature to pick a peripheral backend");

/// Pause between control cycles.  The RS-485 driver-enable line is
/// released by `Transport::service` at the start of the cycle after a reply
/// has drained, so this also bounds how long the node holds the bus.
const CYCLE: Duration = Duration::from_millis(1);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Settings ────────────────────────────────────────────────────
    let config_path =
        PathBuf::from(env::var("CONFIG_PATH").unwrap_or_else(|_| "node.toml".to_string()));
    let settings = config::load_or_default(&config_path)?;

    // ── Persisted parameters ────────────────────────────────────────
    let store = ConfigStore::load(FileStorage::new(settings.storage_path.clone()));
    let baud = store.config().baud_rate;

    // ── Peripherals ─────────────────────────────────────────────────
    let (peripherals, transport) = open_peripherals(&settings, baud)?;

    let mut node = Node::new(
        &settings,
        MonotonicClock::new(),
        store,
        peripherals,
        transport,
    );

    run(&mut node).await;
    node.shutdown();
    Ok(())
}

async fn run<T: Transport>(node: &mut Node<MonotonicClock, T, FileStorage>) {
    let mut ticker = interval(CYCLE);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                node.run_cycle();
            }
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
        }
    }
}

#[cfg(feature = "hw")]
fn open_peripherals(
    settings: &NodeSettings,
    baud: BaudRate,
) -> Result<(Peripherals, sprinkler_node::hw::Rs485Uart)> {
    sprinkler_node::hw::open(settings, baud)
}

#[cfg(all(feature = "sim", not(feature = "hw")))]
fn open_peripherals(
    settings: &NodeSettings,
    baud: BaudRate,
) -> Result<(Peripherals, sprinkler_node::sim::ConsoleTransport)> {
    use sprinkler_node::leak::MockBuzzer;
    use sprinkler_node::sim::{ConsoleTransport, Scenario, SimClimate, SimLeak};
    use sprinkler_node::valve::MockValveOutput;

    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    info!(
        %scenario,
        address = %settings.address,
        %baud,
        "simulated node; type commands such as `{} status`",
        settings.address
    );

    let peripherals = Peripherals {
        climate: Box::new(SimClimate::new(scenario)),
        leak: Box::new(SimLeak::new(scenario)),
        valves: Box::new(MockValveOutput::default()),
        buzzer: Box::new(MockBuzzer::default()),
    };
    Ok((peripherals, ConsoleTransport::spawn()))
}
