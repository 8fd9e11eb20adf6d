//! Bluetooth mesh provisioner tool.
//!
//! Manages stored mesh networks (keys, provisioners, address ranges and
//! groups) and runs a loopback demo that provisions a simulated device and
//! controls it with Generic OnOff and Level messages.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mesh_session::{
    AuthValue, GenericLevelServer, GenericOnOffServer, LoopbackBearer, MeshEvent, MeshManager,
    Provisionee, ProvisioningParams,
};
use mesh_storage::{
    open_store, AllocatedRange, Group, MeshNetwork, NetworkStore, RangeKind, StoreMode,
};
use mesh_wire::Capabilities;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

mod config;
mod logging;

use config::MeshConfig;

/// Bluetooth mesh provisioner and node engine
#[derive(Parser, Debug)]
#[command(name = "btmesh", version, about = "Bluetooth mesh provisioner and node engine")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Storage mode: memory, file (overrides the config file)
    #[arg(long, global = true)]
    storage_mode: Option<String>,

    /// Data directory for file storage (overrides the config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Network id; defaults to the configured or only stored network
    #[arg(long, global = true)]
    network: Option<Uuid>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a network with a primary network key, an application key and
    /// a provisioner owning the default ranges
    Init {
        /// Network name
        #[arg(long, default_value = "Mesh Network")]
        name: String,

        /// Provisioner name
        #[arg(long)]
        provisioner_name: Option<String>,
    },

    /// Print keys, provisioners, nodes and groups
    Show,

    /// Grant a range to a provisioner
    Allocate {
        /// Address space
        #[arg(long, value_enum)]
        kind: RangeArg,

        /// Low bound, decimal or 0x-prefixed hex
        #[arg(long, value_parser = parse_u16)]
        low: u16,

        /// High bound, decimal or 0x-prefixed hex
        #[arg(long, value_parser = parse_u16)]
        high: u16,

        /// Provisioner; defaults to the first one
        #[arg(long)]
        provisioner: Option<Uuid>,
    },

    /// Create a group at the next free group address
    AddGroup {
        /// Group name
        #[arg(long)]
        name: String,

        /// Provisioner whose group ranges are used; defaults to the first one
        #[arg(long)]
        provisioner: Option<Uuid>,
    },

    /// Provision a simulated device over a loopback bearer and switch it
    Demo {
        /// Static OOB value as 32 hex digits
        #[arg(long, value_parser = parse_oob)]
        static_oob: Option<[u8; 16]>,

        /// Acknowledged message timeout, e.g. 5s
        #[arg(long, default_value = "5s")]
        ack_timeout: humantime::Duration,

        /// Elements of the simulated device
        #[arg(long, default_value_t = 1)]
        elements: u8,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RangeArg {
    Unicast,
    Group,
    Scene,
}

impl From<RangeArg> for RangeKind {
    fn from(arg: RangeArg) -> Self {
        match arg {
            RangeArg::Unicast => RangeKind::Unicast,
            RangeArg::Group => RangeKind::Group,
            RangeArg::Scene => RangeKind::Scene,
        }
    }
}

fn parse_u16(value: &str) -> Result<u16, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse::<u16>(),
    };
    parsed.map_err(|e| format!("invalid value {}: {}", value, e))
}

fn parse_oob(value: &str) -> Result<[u8; 16], String> {
    let bytes = hex::decode(value).map_err(|e| format!("invalid hex: {}", e))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("static OOB must be 16 octets, got {}", b.len()))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level)?;

    info!("Starting btmesh v{}", env!("CARGO_PKG_VERSION"));

    let mut mesh_config = MeshConfig::load_from_file(&args.config)?;
    if let Some(mode) = &args.storage_mode {
        mesh_config.storage_mode = mode.clone();
    }
    if let Some(dir) = &args.data_dir {
        mesh_config.data_dir = dir.clone();
    }

    match args.command {
        Command::Init {
            name,
            provisioner_name,
        } => {
            let store = open_store(mesh_config.store_mode()?).await?;
            let network = MeshNetwork::generate(name, provisioner_name.as_deref());
            store.save(&network).await?;
            component_info!("storage", "Saved network {}", network.id);
            println!("{}", network.id);
        }
        Command::Show => {
            let store = open_store(mesh_config.store_mode()?).await?;
            let network = load_network(store.as_ref(), args.network, &mesh_config).await?;
            print_network(&network);
        }
        Command::Allocate {
            kind,
            low,
            high,
            provisioner,
        } => {
            let store = open_store(mesh_config.store_mode()?).await?;
            let mut network = load_network(store.as_ref(), args.network, &mesh_config).await?;
            let provisioner = pick_provisioner(&network, provisioner)?;
            let range = AllocatedRange::new(low, high)?;
            network.allocate_range(provisioner, kind.into(), range)?;
            store.save(&network).await?;
            component_info!("allocation", "Allocated {} range {}", RangeKind::from(kind), range);
        }
        Command::AddGroup { name, provisioner } => {
            let store = open_store(mesh_config.store_mode()?).await?;
            let mut network = load_network(store.as_ref(), args.network, &mesh_config).await?;
            let provisioner = pick_provisioner(&network, provisioner)?;
            let address = network.next_group_address(provisioner)?;
            network.add_group(Group {
                address,
                name: name.clone(),
            })?;
            store.save(&network).await?;
            println!("{:#06x} {}", address, name);
        }
        Command::Demo {
            static_oob,
            ack_timeout,
            elements,
        } => {
            mesh_config.ack_timeout = Duration::from(ack_timeout).as_secs().max(1);
            run_demo(&mesh_config, static_oob, elements).await?;
        }
    }

    Ok(())
}

/// The network named on the command line, in the config, or the only stored one
async fn load_network(
    store: &dyn NetworkStore,
    requested: Option<Uuid>,
    config: &MeshConfig,
) -> Result<MeshNetwork> {
    let id = match requested {
        Some(id) => id,
        None => match &config.network_id {
            Some(id) => Uuid::parse_str(id).context("invalid network id in configuration")?,
            None => {
                let ids = store.list().await?;
                match ids.as_slice() {
                    [only] => *only,
                    [] => anyhow::bail!("No stored network; run `btmesh init` first"),
                    _ => anyhow::bail!("{} networks stored; pick one with --network", ids.len()),
                }
            }
        },
    };
    Ok(store.load(id).await?)
}

fn pick_provisioner(network: &MeshNetwork, requested: Option<Uuid>) -> Result<Uuid> {
    match requested {
        Some(uuid) if network.provisioner(uuid).is_some() => Ok(uuid),
        Some(uuid) => anyhow::bail!("Unknown provisioner {}", uuid),
        None => network
            .provisioners
            .first()
            .map(|p| p.uuid)
            .context("network has no provisioner"),
    }
}

fn print_network(network: &MeshNetwork) {
    println!("Network {} ({})", network.name, network.id);
    println!(
        "  IV index {}{}",
        network.iv_index.index,
        if network.iv_index.update_active {
            " (update in progress)"
        } else {
            ""
        }
    );
    for key in &network.net_keys {
        println!("  Network key {} {} [{:?}]", key.index, key.name, key.phase);
    }
    for key in &network.app_keys {
        println!(
            "  Application key {} {} -> network key {}",
            key.index, key.name, key.bound_net_key
        );
    }
    for p in &network.provisioners {
        let ranges = |ranges: &[AllocatedRange]| {
            ranges
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!("  Provisioner {} ({})", p.name, p.uuid);
        println!("    unicast: {}", ranges(&p.unicast_ranges));
        println!("    group:   {}", ranges(&p.group_ranges));
        println!("    scene:   {}", ranges(&p.scene_ranges));
    }
    for node in &network.nodes {
        println!(
            "  Node {:#06x} {} ({} elements, seq {})",
            node.unicast_address, node.name, node.element_count, node.sequence_number
        );
    }
    for group in &network.groups {
        println!("  Group {:#06x} {}", group.address, group.name);
    }
}

async fn run_demo(config: &MeshConfig, static_oob: Option<[u8; 16]>, elements: u8) -> Result<()> {
    let engine = config.engine_config()?;
    let store = open_store(StoreMode::InMemory).await?;

    let network = MeshNetwork::generate("Demo Network", None);
    let provisioner_id = network.provisioners[0].uuid;
    let (near, far) = LoopbackBearer::pair(config.mtu);

    let provisioner = MeshManager::for_provisioner(
        network,
        provisioner_id,
        Arc::new(near.bearer),
        engine.clone(),
        Some(store.clone()),
    )?;
    provisioner.attach(near.inbound);

    let device_uuid = Uuid::new_v4();
    let device = MeshManager::unprovisioned(
        Provisionee::new(device_uuid, Capabilities::no_oob(elements), static_oob),
        Arc::new(far.bearer),
        engine,
        None,
    )?;
    device.attach(far.inbound);
    let onoff = Arc::new(GenericOnOffServer::new(false));
    let level = Arc::new(GenericLevelServer::new(0));
    device.register_model(onoff.clone());
    device.register_model(level.clone());

    let mut events = provisioner.subscribe();
    tokio::spawn(async move {
        while let Ok(record) = events.recv().await {
            component_debug!("events", "#{} {:?}", record.sequence, record.event);
        }
    });

    let params = ProvisioningParams {
        auth: static_oob.map_or(AuthValue::NoOob, AuthValue::Static),
        ..Default::default()
    };
    let node = provisioner.provision(device_uuid, params).await?;
    component_info!(
        "demo",
        "Provisioned {} at {:#06x}",
        node.uuid,
        node.unicast_address
    );

    // The simulated device learns the application key locally
    let app_key = *provisioner
        .network()
        .await
        .app_key(0)
        .context("demo network has no application key")?
        .key
        .as_bytes();
    device.import_app_key(0, app_key, 0).await?;

    let status = provisioner
        .send_generic_on_off(node.unicast_address, 0, true)
        .await?;
    println!("OnOff Set (acknowledged) -> {:?}", status);

    provisioner
        .send_generic_on_off_unacknowledged(node.unicast_address, 0, false)
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!(
        "OnOff Set (unacknowledged) -> device now {}",
        if onoff.state() { "on" } else { "off" }
    );

    let status = provisioner
        .send_generic_level(node.unicast_address, 0, -1200)
        .await?;
    println!("Level Set (acknowledged) -> {:?}", status);

    let mut device_events = device.subscribe();
    let group = provisioner.create_group("Demo Group").await?;
    provisioner.select_group(group.address).await?;
    provisioner
        .send_generic_level_unacknowledged(group.address, 0, 512)
        .await?;
    let delivered = tokio::time::timeout(Duration::from_secs(1), async {
        while let Ok(record) = device_events.recv().await {
            if let MeshEvent::UnsolicitedMessage { destination, .. } = record.event {
                if destination == group.address {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    println!(
        "Level Set to group {:#06x} -> delivered: {}, device level {}",
        group.address,
        delivered,
        level.level()
    );

    let network = provisioner.network().await;
    print_network(&network);

    provisioner.disconnect().await;
    device.disconnect().await;
    component_info!("demo", "Demo finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u16() {
        assert_eq!(parse_u16("0xC000").unwrap(), 0xC000);
        assert_eq!(parse_u16("42").unwrap(), 42);
        assert!(parse_u16("0x1FFFF").is_err());
    }

    #[test]
    fn test_parse_oob() {
        let value = parse_oob("00112233445566778899aabbccddeeff").unwrap();
        assert_eq!(value[0], 0x00);
        assert_eq!(value[15], 0xFF);
        assert!(parse_oob("0011").is_err());
        assert!(parse_oob("zz").is_err());
    }

    #[test]
    fn test_pick_provisioner() {
        let network = MeshNetwork::generate("Test", None);
        let first = network.provisioners[0].uuid;
        assert_eq!(pick_provisioner(&network, None).unwrap(), first);
        assert!(pick_provisioner(&network, Some(Uuid::new_v4())).is_err());
    }

    #[tokio::test]
    async fn test_load_only_network() {
        let store = open_store(StoreMode::InMemory).await.unwrap();
        let config = MeshConfig::default();
        assert!(load_network(store.as_ref(), None, &config).await.is_err());

        let network = MeshNetwork::generate("Test", None);
        store.save(&network).await.unwrap();
        let loaded = load_network(store.as_ref(), None, &config).await.unwrap();
        assert_eq!(loaded.id, network.id);
    }
}
