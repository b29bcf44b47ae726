//! SAN Volume Mounter
//!
//! Operator command line for attaching, detaching and monitoring SAN block
//! volumes on this host.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use san_mounter::types::{Advisory, FaultyPathPolicy};
use san_mounter::{
    MounterConfig, NamedLocks, Protocol, ScbeMounter, SystemExecutor, VolumeConfig, Wwn, metrics,
};

/// Idle age after which monitor drops per-WWN locks.
const LOCK_MAX_IDLE: Duration = Duration::from_secs(600);

#[derive(Parser, Debug)]
#[command(name = "san-mounter")]
#[command(about = "Attach and mount SAN block volumes behind dm-multipath")]
struct Args {
    /// JSON configuration file; flags below override its values
    #[arg(long, env = "SAN_MOUNTER_CONFIG")]
    config: Option<PathBuf>,

    /// SAN transport of this host (fc, iscsi)
    #[arg(long, env = "SAN_PROTOCOL")]
    protocol: Option<Protocol>,

    /// Directory under which per-WWN mount points are created
    #[arg(long, env = "MOUNT_ROOT")]
    mount_root: Option<PathBuf>,

    /// Filesystem created when a volume config names none
    #[arg(long, env = "DEFAULT_FS_TYPE")]
    default_fs_type: Option<String>,

    /// What attach does with a device that has no active path (block, warn)
    #[arg(long, env = "FAULTY_PATH_POLICY")]
    faulty_path_policy: Option<FaultyPathPolicy>,

    /// Timeout for multipath commands, in seconds
    #[arg(long, env = "MULTIPATH_TIMEOUT_SECS")]
    multipath_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9092)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach and mount volumes, given as JSON volume config objects
    Attach {
        #[arg(long = "volume-config", required = true)]
        volume_configs: Vec<String>,
    },
    /// Unmount and detach a volume, then rescan the host
    Detach {
        #[arg(long)]
        wwn: Wwn,
        /// Also delete the raw SCSI devices of the volume
        #[arg(long, default_value = "false")]
        remove_devices: bool,
    },
    /// Rescan SCSI buses and reload multipath
    Rescan {
        #[arg(long, default_value = "false")]
        no_iscsi: bool,
    },
    /// Report multipath path health of volumes
    Health {
        #[arg(long, required = true)]
        wwn: Vec<Wwn>,
    },
    /// Periodically report path health (use with --metrics-addr)
    Monitor {
        #[arg(long, required = true)]
        wwn: Vec<Wwn>,
        #[arg(long, default_value = "30")]
        interval_secs: u64,
    },
}

fn build_config(args: &Args) -> Result<MounterConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => MounterConfig::from_file(path)?,
        None => MounterConfig::default(),
    };
    if let Some(protocol) = args.protocol {
        config.protocol = protocol;
    }
    if let Some(root) = &args.mount_root {
        config.mount_root = root.clone();
    }
    if let Some(fs_type) = &args.default_fs_type {
        config.default_fs_type = fs_type.clone();
    }
    if let Some(policy) = args.faulty_path_policy {
        config.faulty_path_policy = policy;
    }
    if let Some(secs) = args.multipath_timeout_secs {
        config.multipath_timeout_secs = secs;
    }
    config.validate()?;
    Ok(config)
}

fn log_advisories(advisories: &[Advisory]) {
    for advisory in advisories {
        warn!(step = advisory.step, error = %advisory.error, "Step failed, operation continued");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let config = build_config(&args)?;
    let host = hostname::get()?.to_string_lossy().to_string();
    info!(
        host = %host,
        protocol = %config.protocol,
        mount_root = %config.mount_root.display(),
        faulty_path_policy = ?config.faulty_path_policy,
        "Starting san-mounter"
    );

    let scbe = ScbeMounter::new(Arc::new(SystemExecutor::new()), config);
    let locks = NamedLocks::new();

    match args.command {
        Command::Attach { volume_configs } => {
            let volumes = volume_configs
                .iter()
                .map(|doc| VolumeConfig::from_json(doc))
                .collect::<Result<Vec<_>, _>>()?;
            attach_all(&scbe, &locks, &volumes)
        }
        Command::Detach {
            wwn,
            remove_devices,
        } => detach(&scbe, &locks, &wwn, remove_devices),
        Command::Rescan { no_iscsi } => {
            let outcome = scbe.rescan(!no_iscsi)?;
            log_advisories(&outcome.advisories);
            info!("Rescan complete");
            Ok(())
        }
        Command::Health { wwn } => {
            let mut faulty = 0;
            for wwn in &wwn {
                let device = locks.with_read(wwn.as_str(), || scbe.check_health(wwn))?;
                if device.health.is_faulty() {
                    faulty += 1;
                }
                println!(
                    "{} {} {:?} paths={}",
                    wwn,
                    device.path,
                    device.health,
                    device.devices.join(",")
                );
            }
            if faulty > 0 {
                return Err(format!("{} volume(s) have no active path", faulty).into());
            }
            Ok(())
        }
        Command::Monitor { wwn, interval_secs } => {
            let interval = Duration::from_secs(interval_secs.max(1));
            info!(volumes = wwn.len(), interval = ?interval, "Monitoring path health");
            loop {
                for wwn in &wwn {
                    if let Err(e) = locks.with_read(wwn.as_str(), || scbe.check_health(wwn)) {
                        warn!(wwn = %wwn, error = %e, "Health check failed");
                        metrics::set_device_faulty(wwn.as_str(), true);
                    }
                }
                locks.evict_stale(LOCK_MAX_IDLE);
                thread::sleep(interval);
            }
        }
    }
}

/// Attach volumes concurrently. Attaches of the same WWN are serialized;
/// every attach rescans the whole host, so one volume's rescan may surface
/// another's device mid-flight.
fn attach_all(
    scbe: &ScbeMounter,
    locks: &NamedLocks,
    volumes: &[VolumeConfig],
) -> Result<(), Box<dyn std::error::Error>> {
    let failures = thread::scope(|s| {
        let handles: Vec<_> = volumes
            .iter()
            .map(|volume| {
                s.spawn(move || locks.with_write(volume.wwn.as_str(), || scbe.mount(volume)))
            })
            .collect();

        let mut failures = 0;
        for (volume, handle) in volumes.iter().zip(handles) {
            match handle.join() {
                Ok(Ok(outcome)) => {
                    log_advisories(&outcome.advisories);
                    println!("{} {}", volume.wwn, outcome.value);
                }
                Ok(Err(e)) => {
                    error!(wwn = %volume.wwn, state = %e.reached, error = %e, "Attach failed");
                    failures += 1;
                }
                Err(_) => {
                    error!(wwn = %volume.wwn, "Attach worker panicked");
                    failures += 1;
                }
            }
        }
        failures
    });

    if failures > 0 {
        return Err(format!("{} of {} attach(es) failed", failures, volumes.len()).into());
    }
    Ok(())
}

fn detach(
    scbe: &ScbeMounter,
    locks: &NamedLocks,
    wwn: &Wwn,
    remove_devices: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = locks.with_write(wwn.as_str(), || {
        let detached = scbe.unmount(wwn);
        if detached.is_ok() && remove_devices {
            match scbe.remove_volume_devices(wwn) {
                Ok(outcome) => log_advisories(&outcome.advisories),
                Err(e) => warn!(wwn = %wwn, error = %e, "Failed to remove SCSI devices"),
            }
        }
        detached
    });

    match scbe.action_after_detach() {
        Ok(outcome) => log_advisories(&outcome.advisories),
        Err(e) => warn!(error = %e, "Post-detach rescan failed"),
    }

    result?;
    println!("{} detached", wwn);
    Ok(())
}
