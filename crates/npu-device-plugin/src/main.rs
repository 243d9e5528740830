mod logging;

use anyhow::anyhow;
use anyhow::Result;
use clap::Parser;
use npu_device_plugin::app;
use npu_device_plugin::config::Cli;
use npu_device_plugin::config::Commands;
use npu_device_plugin::config::DaemonArgs;
use npu_device_plugin::config::DeviceConfig;
use npu_device_plugin::config::ShowConfigArgs;
use npu_device_plugin::domain::inventory::capacity::virtual_slots_for;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::ShowConfig(show_config_args) => run_show_config(show_config_args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.log_path.clone());

    tracing::info!("Starting NPU device plugin {}", &**version::VERSION);

    let result = app::run_daemon(daemon_args).await;
    if let Err(e) = &result {
        tracing::error!("device plugin exited: {e}");
    }
    result
}

fn run_show_config(args: ShowConfigArgs) -> Result<()> {
    let config = DeviceConfig::load(&args.config_file)
        .map_err(|e| anyhow!("invalid device config: {e:?}"))?;

    for family in &config.vnpus {
        println!(
            "{}: resource {} ({}), {} virtual devices per chip",
            family.chip_name,
            family.resource_name,
            family.common_word,
            virtual_slots_for(family)
        );
    }
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
