use proxmox_vm_manager::{Api, Config, Error, Result, VmManager, VmStore};

const USAGE: &str = "usage: proxmox-vm-manager <config.json> \
<list|status|resources|start|stop|restart|destroy|sync|next-id> [vmid]";

const COMMANDS: &[&str] = &[
    "list", "status", "resources", "start", "stop", "restart", "destroy", "sync", "next-id",
];

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args).await {
        Ok(()) => {}
        Err(Error::Usage { message }) => {
            eprintln!("{message}\n{USAGE}");
            std::process::exit(2);
        }
        Err(why) => {
            tracing::error!("{why}");
            std::process::exit(1);
        }
    }
}

async fn run(args: &[String]) -> Result<()> {
    let (config_path, command) = match args {
        [config_path, command, ..] => (config_path, command.as_str()),
        _ => {
            return Err(Error::Usage {
                message: "missing config path or command".to_string(),
            });
        }
    };

    if !COMMANDS.contains(&command) {
        return Err(Error::Usage {
            message: format!("unknown command {command:?}"),
        });
    }

    let config = Config::load(config_path)?;
    let api = Api::from_config(&config.proxmox)?;
    let store = VmStore::connect(&config.database.url).await?;
    let manager = VmManager::new(api, store, config.defaults, &config.provisioning);

    let vmid = || -> Result<u32> {
        args.get(2)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Usage {
                message: format!("{command} needs a numeric vmid"),
            })
    };

    let output = match command {
        "list" => serde_json::to_value(manager.api().list_vms().await?)?,
        "status" => serde_json::to_value(manager.api().get_vm_status(vmid()?).await?)?,
        "resources" => serde_json::to_value(manager.api().get_vm_resources(vmid()?).await?)?,
        "start" => serde_json::to_value(manager.start(vmid()?).await?)?,
        "stop" => serde_json::to_value(manager.stop(vmid()?).await?)?,
        "restart" => serde_json::to_value(manager.restart(vmid()?).await?)?,
        "destroy" => {
            let vmid = vmid()?;
            manager.destroy(vmid).await?;
            serde_json::json!({ "destroyed": vmid })
        }
        "sync" => serde_json::to_value(manager.sync_all().await?)?,
        "next-id" => serde_json::json!(manager.allocate_vmid().await?),
        other => {
            return Err(Error::Usage {
                message: format!("unknown command {other:?}"),
            });
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
